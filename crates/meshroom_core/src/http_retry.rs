/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Result};
use rand::{thread_rng, Rng};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            max_jitter: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    fn max_attempts(&self) -> u32 {
        self.attempts.clamp(1, 5)
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

/// Sends the request built by `build`, retrying transport errors, 429 and 5xx with
/// jittered exponential backoff. The last response is returned as-is once attempts run out.
pub async fn send_with_retry<F>(mut build: F, policy: &RetryPolicy) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = policy.max_attempts();
    let mut backoff = policy.initial_backoff;
    let mut last_err = None;
    for attempt in 0..max_attempts {
        let last = attempt + 1 >= max_attempts;
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                if should_retry_status(status) && !last {
                    debug!(%status, attempt, "retrying relay request");
                    sleep_with_jitter(backoff, policy.max_jitter).await;
                    backoff = policy.next_backoff(backoff);
                    continue;
                }
                return Ok(resp);
            }
            Err(e) => {
                if last {
                    return Err(e.into());
                }
                debug!(attempt, "relay request failed: {e}");
                last_err = Some(e);
                sleep_with_jitter(backoff, policy.max_jitter).await;
                backoff = policy.next_backoff(backoff);
            }
        }
    }
    Err(last_err
        .map(Into::into)
        .unwrap_or_else(|| anyhow!("no request attempted")))
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn sleep_with_jitter(base: Duration, max_jitter: Duration) {
    let cap = max_jitter.as_millis() as u64;
    let jitter_ms: u64 = thread_rng().gen_range(0..=cap);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}
