/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Seam between the session state machine and the connectivity/negotiation stack.
//!
//! A factory builds one [`PeerTransport`] per session and wires the stack's callbacks
//! (local candidate found, remote track arrived, connection state changed) into
//! [`TransportEvents`], which enqueues them on the room's task queue. Callbacks never
//! touch session state directly. Results of negotiation steps travel the same queue as
//! [`StepOutcome`]s.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use meshroom_protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{LocalTrack, TrackKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A track received from the remote side. `media` is the live RTP track when the
/// transport carries real media.
#[derive(Clone)]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    pub media: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("has_media", &self.media.is_some())
            .finish()
    }
}

/// Completion of one negotiation step run off the room task.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Local description created and set; ready to go on the wire.
    LocalReady(SessionDescription),
    RemoteApplied,
    CandidateApplied,
    CandidateRejected(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(TransportState),
    Step(StepOutcome),
}

#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub peer_id: String,
    /// Identifies the session instance; events from a replaced or closed session are stale.
    pub epoch: u64,
    pub kind: TransportEventKind,
}

#[derive(Clone)]
pub struct TransportEvents {
    peer_id: String,
    epoch: u64,
    tx: mpsc::Sender<TransportEvent>,
}

impl TransportEvents {
    pub fn new(peer_id: &str, epoch: u64, tx: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            epoch,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub async fn emit(&self, kind: TransportEventKind) {
        let ev = TransportEvent {
            peer_id: self.peer_id.clone(),
            epoch: self.epoch,
            kind,
        };
        if self.tx.send(ev).await.is_err() {
            debug!(peer = %self.peer_id, "room queue closed, transport event dropped");
        }
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: TransportEvents) -> Result<Box<dyn PeerTransport>>;
}
