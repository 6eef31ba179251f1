/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Clone, Debug, serde::Deserialize)]
pub struct MeshConfig {
    /// Participant id assigned by the relay (`/register`).
    pub self_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Capture audio at start (default true).
    #[serde(default)]
    pub audio: Option<bool>,
    /// Capture video at start (default true).
    #[serde(default)]
    pub video: Option<bool>,
    /// ICE server URLs (e.g. `stun:stun.l.google.com:19302`, `turn:turn.example:3478?transport=udp`).
    #[serde(default)]
    pub ice_urls: Option<Vec<String>>,
    /// Optional ICE username (TURN).
    #[serde(default)]
    pub ice_username: Option<String>,
    /// Optional ICE credential (TURN).
    #[serde(default)]
    pub ice_credential: Option<String>,
    /// Upper bound for each negotiation step (description creation/application, candidate add).
    #[serde(default)]
    pub negotiate_timeout_secs: Option<u64>,
    /// Buffered room events per subscriber before lagging ones start missing events.
    #[serde(default)]
    pub event_capacity: Option<usize>,
}

impl MeshConfig {
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            display_name: None,
            audio: None,
            video: None,
            ice_urls: None,
            ice_username: None,
            ice_credential: None,
            negotiate_timeout_secs: None,
            event_capacity: None,
        }
    }

    pub fn display_name(&self) -> String {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.self_id)
            .to_string()
    }

    pub fn wants_audio(&self) -> bool {
        self.audio.unwrap_or(true)
    }

    pub fn wants_video(&self) -> bool {
        self.video.unwrap_or(true)
    }

    pub fn ice_urls(&self) -> Vec<String> {
        let urls = self
            .ice_urls
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if urls.is_empty() {
            vec![DEFAULT_STUN_URL.to_string()]
        } else {
            urls
        }
    }

    pub fn ice_username(&self) -> Option<String> {
        self.ice_username.clone().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }

    pub fn ice_credential(&self) -> Option<String> {
        self.ice_credential.clone().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }

    pub fn negotiate_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiate_timeout_secs.unwrap_or(20).max(5).min(120))
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity.unwrap_or(256).max(16).min(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_clamps() {
        let mut cfg: MeshConfig = serde_json::from_str(r#"{"self_id":"abc123"}"#).unwrap();
        assert!(cfg.wants_audio() && cfg.wants_video());
        assert_eq!(cfg.ice_urls(), vec![DEFAULT_STUN_URL.to_string()]);
        assert_eq!(cfg.negotiate_timeout(), Duration::from_secs(20));
        assert_eq!(cfg.display_name(), "abc123");

        cfg.negotiate_timeout_secs = Some(1);
        cfg.event_capacity = Some(1_000_000);
        cfg.ice_urls = Some(vec!["  ".into(), "turn:t.example:3478".into()]);
        cfg.ice_username = Some("  ".into());
        assert_eq!(cfg.negotiate_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.event_capacity(), 4096);
        assert_eq!(cfg.ice_urls(), vec!["turn:t.example:3478".to_string()]);
        assert_eq!(cfg.ice_username(), None);
    }
}
