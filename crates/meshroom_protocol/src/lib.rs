/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recipient value used for presence announcements fanned out by the relay.
pub const BROADCAST: &str = "all";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    All,
    Peer(String),
}

impl Recipient {
    pub fn is_for(&self, participant: &str) -> bool {
        match self {
            Recipient::All => true,
            Recipient::Peer(id) => id == participant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Join,
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Leave,
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::Join => "join",
            SignalBody::Offer(_) => "offer",
            SignalBody::Answer(_) => "answer",
            SignalBody::IceCandidate(_) => "ice-candidate",
            SignalBody::Leave => "leave",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct SignalEnvelope {
    pub room_id: String,
    pub from: String,
    pub to: Recipient,
    pub body: SignalBody,
}

impl SignalEnvelope {
    pub fn new(room_id: &str, from: &str, to: Recipient, body: SignalBody) -> Self {
        Self {
            room_id: room_id.to_string(),
            from: from.to_string(),
            to,
            body,
        }
    }

    pub fn to_peer(room_id: &str, from: &str, to: &str, body: SignalBody) -> Self {
        Self::new(room_id, from, Recipient::Peer(to.to_string()), body)
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "roomId", default)]
    room_id: String,
    #[serde(default)]
    from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

impl TryFrom<WireEnvelope> for SignalEnvelope {
    type Error = String;

    fn try_from(w: WireEnvelope) -> Result<Self, Self::Error> {
        let to = match w.to.as_deref().map(str::trim) {
            None | Some("") | Some(BROADCAST) => Recipient::All,
            Some(id) => Recipient::Peer(id.to_string()),
        };
        let body = match w.kind.trim().to_ascii_lowercase().as_str() {
            "join" => SignalBody::Join,
            "leave" => SignalBody::Leave,
            "offer" => SignalBody::Offer(
                serde_json::from_value(w.payload).map_err(|e| format!("bad offer payload: {e}"))?,
            ),
            "answer" => SignalBody::Answer(
                serde_json::from_value(w.payload).map_err(|e| format!("bad answer payload: {e}"))?,
            ),
            "ice-candidate" | "candidate" => SignalBody::IceCandidate(
                serde_json::from_value(w.payload)
                    .map_err(|e| format!("bad candidate payload: {e}"))?,
            ),
            other => return Err(format!("unknown signal type: {other}")),
        };
        Ok(SignalEnvelope {
            room_id: w.room_id,
            from: w.from,
            to,
            body,
        })
    }
}

impl From<SignalEnvelope> for WireEnvelope {
    fn from(e: SignalEnvelope) -> Self {
        let kind = e.body.kind().to_string();
        let payload = match e.body {
            SignalBody::Offer(d) | SignalBody::Answer(d) => {
                serde_json::to_value(d).unwrap_or(Value::Null)
            }
            SignalBody::IceCandidate(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            SignalBody::Join | SignalBody::Leave => Value::Null,
        };
        let to = match e.to {
            Recipient::All => Some(BROADCAST.to_string()),
            Recipient::Peer(id) => Some(id),
        };
        WireEnvelope {
            kind,
            room_id: e.room_id,
            from: e.from,
            to,
            payload,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegisterRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegisterResponse {
    pub message: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateRoomRequest {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateRoomResponse {
    pub message: String,
    #[serde(rename = "roomID")]
    pub room_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MembersResponse {
    pub members: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
}
