/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

use anyhow::{Context, Result};
use meshroom_protocol::{
    CreateRoomRequest, CreateRoomResponse, ErrorResponse, MembersResponse, RegisterRequest,
    RegisterResponse,
};
use reqwest::Response;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::http_retry::{send_with_retry, RetryPolicy};

/// REST side of the relay: participant registration and room bookkeeping.
#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base: String,
    retry: RetryPolicy,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn register(&self, name: &str) -> Result<RegisterResponse> {
        let url = format!("{}/register", self.base);
        let body = RegisterRequest {
            name: name.to_string(),
        };
        let resp = send_with_retry(|| self.http.post(&url).json(&body), &self.retry).await?;
        let out: RegisterResponse = decode(resp).await.context("register")?;
        info!(user = %out.user_id, name = %out.name, "registered with relay");
        Ok(out)
    }

    pub async fn create_room(&self, user_id: &str, name: &str) -> Result<CreateRoomResponse> {
        let url = format!("{}/create-room", self.base);
        let body = CreateRoomRequest {
            user_id: user_id.to_string(),
            name: name.to_string(),
        };
        let resp = send_with_retry(|| self.http.post(&url).json(&body), &self.retry).await?;
        let out: CreateRoomResponse = decode(resp).await.context("create room")?;
        info!(room = %out.room_id, "room created");
        Ok(out)
    }

    pub async fn list_members(&self, room_id: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/list-members/{}",
            self.base,
            urlencoding::encode(room_id)
        );
        let resp = send_with_retry(|| self.http.get(&url), &self.retry).await?;
        let out: MembersResponse = decode(resp).await.context("list members")?;
        Ok(out.members)
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        let msg = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.error)
            .unwrap_or(text);
        anyhow::bail!("relay error {status}: {msg}");
    }
    serde_json::from_str(&text).with_context(|| format!("decode relay response: {text}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_relay_fails_register() {
        let client = RelayClient::new("http://127.0.0.1:1/")
            .unwrap()
            .with_retry(RetryPolicy {
                attempts: 1,
                ..Default::default()
            });
        assert_eq!(client.base, "http://127.0.0.1:1");
        assert!(client.register("ann").await.is_err());
    }
}
