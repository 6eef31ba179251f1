/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::fmt::Display;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    /// Local capture could not be acquired. Fatal to `start`.
    #[error("local media unavailable: {0}")]
    DeviceUnavailable(String),
    /// Signaling channel failed to open or dropped.
    #[error("signaling channel unavailable: {0}")]
    ChannelUnavailable(String),
    /// A message arrived that does not fit the peer's negotiation state. The message is dropped.
    #[error("protocol order violation from {peer}: {reason}")]
    ProtocolOrderViolation { peer: String, reason: String },
    /// The transport could not complete a negotiation step for one peer.
    #[error("negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: String, reason: String },
    #[error("room is not running")]
    Stopped,
}

impl MeshError {
    pub(crate) fn order(peer: &str, reason: impl Into<String>) -> Self {
        MeshError::ProtocolOrderViolation {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn negotiation(peer: &str, reason: impl Display) -> Self {
        MeshError::NegotiationFailed {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_protocol_order(&self) -> bool {
        matches!(self, MeshError::ProtocolOrderViolation { .. })
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
