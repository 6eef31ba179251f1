/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use meshroom_protocol::{
    IceCandidate, Recipient, SessionDescription, SignalBody, SignalEnvelope,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::media::{LocalMediaController, LocalMediaState, TrackKind};
use crate::metrics::MeshMetrics;
use crate::registry::SessionRegistry;
use crate::room_events::{RoomEventKind, RoomEvents};
use crate::session::{ConnectionState, PeerSnapshot};
use crate::transport::{TransportEvent, TransportEventKind};

#[derive(Clone, Debug, Serialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub self_id: String,
    pub local_media: LocalMediaState,
    pub peers: Vec<PeerSnapshot>,
}

/// Turns inbound envelopes and transport callbacks into session operations and emits the
/// resulting envelopes. Only ever driven from the room task.
pub struct SignalRouter {
    room_id: String,
    self_id: String,
    registry: SessionRegistry,
    media: LocalMediaController,
    outbound: mpsc::Sender<SignalEnvelope>,
    events: RoomEvents,
    metrics: Arc<MeshMetrics>,
}

impl SignalRouter {
    pub fn new(
        room_id: &str,
        self_id: &str,
        registry: SessionRegistry,
        media: LocalMediaController,
        outbound: mpsc::Sender<SignalEnvelope>,
        events: RoomEvents,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            self_id: self_id.to_string(),
            registry,
            media,
            outbound,
            events,
            metrics,
        }
    }

    /// Presence announcement; members already in the room answer it with offers.
    pub async fn announce(&self) {
        let env = SignalEnvelope::new(&self.room_id, &self.self_id, Recipient::All, SignalBody::Join);
        self.send(env).await;
        info!(room = %self.room_id, id = %self.self_id, "presence announced");
    }

    /// Dispatches one inbound envelope. Errors are already logged and published; they
    /// only tell the caller the envelope was not applied.
    pub async fn handle_inbound(&mut self, env: SignalEnvelope) -> MeshResult<()> {
        if env.room_id != self.room_id {
            debug!(room = %self.room_id, other = %env.room_id, kind = env.kind(), "envelope for another room dropped");
            MeshMetrics::bump(&self.metrics.dropped_envelopes);
            return Ok(());
        }
        if env.from.is_empty() || env.from == self.self_id {
            debug!(room = %self.room_id, kind = env.kind(), "envelope without a remote sender dropped");
            MeshMetrics::bump(&self.metrics.dropped_envelopes);
            return Ok(());
        }
        if !env.to.is_for(&self.self_id) {
            debug!(room = %self.room_id, from = %env.from, kind = env.kind(), "envelope addressed elsewhere dropped");
            MeshMetrics::bump(&self.metrics.dropped_envelopes);
            return Ok(());
        }

        let from = env.from;
        match env.body {
            SignalBody::Join => self.on_join(&from).await,
            SignalBody::Offer(offer) => self.on_offer(&from, offer).await,
            SignalBody::Answer(answer) => self.on_answer(&from, answer).await,
            SignalBody::IceCandidate(c) => self.on_remote_candidate(&from, c).await,
            SignalBody::Leave => {
                self.on_leave(&from).await;
                Ok(())
            }
        }
    }

    async fn on_join(&mut self, from: &str) -> MeshResult<()> {
        if self.registry.contains(from) {
            debug!(peer = %from, "join from a peer we already have a session with");
            return Ok(());
        }
        info!(peer = %from, "peer joined, offering");
        self.initiate_session(from).await
    }

    async fn on_offer(&mut self, from: &str, offer: SessionDescription) -> MeshResult<()> {
        MeshMetrics::bump(&self.metrics.offers_received);
        // Both sides offered at once: the larger id keeps its offer, the other answers.
        if let Some(s) = self.registry.get_existing(from) {
            if s.awaits_answer() && self.self_id.as_str() > from {
                info!(peer = %from, "offer collision, keeping our own offer");
                MeshMetrics::bump(&self.metrics.offer_collisions);
                return Ok(());
            }
        }
        let replaced = self.registry.contains(from);
        let res = self
            .registry
            .get_or_create_as_answerer(from, offer, &self.media)
            .await;
        match res {
            Ok(()) => {
                info!(peer = %from, replaced, "offer accepted, answering");
                self.publish_state(from, ConnectionState::Negotiating);
                self.refresh_session_metrics();
                Ok(())
            }
            Err(e) => {
                warn!(peer = %from, "answering failed: {e}");
                MeshMetrics::bump(&self.metrics.negotiation_failures);
                self.events.publish(RoomEventKind::NegotiationFailed {
                    peer_id: from.to_string(),
                    reason: e.to_string(),
                });
                if replaced && !self.registry.contains(from) {
                    self.events.publish(RoomEventKind::PeerRemoved {
                        peer_id: from.to_string(),
                    });
                }
                self.refresh_session_metrics();
                Err(e)
            }
        }
    }

    async fn on_answer(&mut self, from: &str, answer: SessionDescription) -> MeshResult<()> {
        MeshMetrics::bump(&self.metrics.answers_received);
        let Some(session) = self.registry.get_existing(from) else {
            return self
                .reject(from, MeshError::order(from, "answer from a peer without a session"))
                .await;
        };
        match session.apply_remote_answer(answer) {
            Ok(()) => {
                debug!(peer = %from, "answer accepted");
                Ok(())
            }
            Err(e) => self.reject(from, e).await,
        }
    }

    async fn on_remote_candidate(&mut self, from: &str, candidate: IceCandidate) -> MeshResult<()> {
        MeshMetrics::bump(&self.metrics.candidates_received);
        let Some(session) = self.registry.get_existing(from) else {
            return self
                .reject(from, MeshError::order(from, "candidate from a peer without a session"))
                .await;
        };
        let before = session.pending_candidates();
        let res = session.enqueue_remote_candidate(candidate);
        let buffered = session.pending_candidates() > before;
        match res {
            Ok(()) => {
                if buffered {
                    MeshMetrics::bump(&self.metrics.candidates_buffered);
                }
                Ok(())
            }
            Err(e) => self.reject(from, e).await,
        }
    }

    async fn on_leave(&mut self, from: &str) {
        if self.registry.remove(from).await {
            info!(peer = %from, "peer left");
            self.events.publish(RoomEventKind::PeerRemoved {
                peer_id: from.to_string(),
            });
            self.refresh_session_metrics();
        } else {
            debug!(peer = %from, "leave from unknown peer ignored");
        }
    }

    async fn reject(&mut self, peer: &str, e: MeshError) -> MeshResult<()> {
        match &e {
            MeshError::ProtocolOrderViolation { reason, .. } => {
                warn!(peer = %peer, "{e}");
                MeshMetrics::bump(&self.metrics.protocol_violations);
                self.events.publish(RoomEventKind::ProtocolViolation {
                    peer_id: peer.to_string(),
                    reason: reason.clone(),
                });
            }
            MeshError::NegotiationFailed { reason, .. } => {
                warn!(peer = %peer, "{e}");
                MeshMetrics::bump(&self.metrics.negotiation_failures);
                self.events.publish(RoomEventKind::NegotiationFailed {
                    peer_id: peer.to_string(),
                    reason: reason.clone(),
                });
                self.fail_session(peer).await;
            }
            _ => warn!(peer = %peer, "{e}"),
        }
        Err(e)
    }

    /// Failed sessions are not kept around: the session goes Failed, is closed and forgotten.
    pub async fn fail_session(&mut self, peer: &str) {
        if let Some(s) = self.registry.get_existing(peer) {
            s.mark_failed();
        } else {
            return;
        }
        self.publish_state(peer, ConnectionState::Failed);
        self.registry.remove(peer).await;
        self.events.publish(RoomEventKind::PeerRemoved {
            peer_id: peer.to_string(),
        });
        self.refresh_session_metrics();
    }

    pub async fn handle_transport_event(&mut self, ev: TransportEvent) {
        let TransportEvent {
            peer_id,
            epoch,
            kind,
        } = ev;
        let Some(session) = self.registry.get_current(&peer_id, epoch) else {
            debug!(peer = %peer_id, epoch, "stale transport event dropped");
            return;
        };
        match kind {
            TransportEventKind::Step(outcome) => match session.on_step(outcome) {
                Ok(bodies) => {
                    for body in bodies {
                        self.emit(&peer_id, body).await;
                    }
                }
                Err(e) => {
                    let _ = self.reject(&peer_id, e).await;
                }
            },
            TransportEventKind::LocalCandidate(c) => {
                let out = session.on_local_candidate(c);
                if let Some(body) = out {
                    self.emit(&peer_id, body).await;
                }
            }
            TransportEventKind::RemoteTrack(track) => {
                let stream = session.on_remote_track(track);
                if let Some(stream) = stream {
                    let kinds: Vec<TrackKind> = stream.tracks.iter().map(|t| t.kind).collect();
                    info!(peer = %peer_id, stream = %stream.stream_id, tracks = kinds.len(), "remote stream updated");
                    self.events.publish(RoomEventKind::RemoteStreamAdded {
                        peer_id: peer_id.clone(),
                        stream_id: stream.stream_id,
                        kinds,
                    });
                }
            }
            TransportEventKind::StateChanged(st) => {
                let next = session.on_transport_state(st);
                match next {
                    Some(ConnectionState::Failed) => {
                        warn!(peer = %peer_id, ?st, "transport lost");
                        self.fail_session(&peer_id).await;
                    }
                    Some(state) => {
                        info!(peer = %peer_id, ?state, "session state");
                        self.publish_state(&peer_id, state);
                        self.refresh_session_metrics();
                    }
                    None => debug!(peer = %peer_id, ?st, "transport state"),
                }
            }
        }
    }

    /// Explicit connection request toward `peer`.
    pub async fn connect_to(&mut self, peer: &str) -> MeshResult<()> {
        if peer == self.self_id {
            return Err(MeshError::order(peer, "cannot connect to self"));
        }
        if let Some(s) = self.registry.get_existing(peer) {
            if !matches!(s.state(), ConnectionState::Failed | ConnectionState::Closed) {
                return Err(MeshError::order(peer, "session already active"));
            }
        }
        self.initiate_session(peer).await
    }

    async fn initiate_session(&mut self, peer: &str) -> MeshResult<()> {
        let res = self.registry.initiate(peer, &self.media).await;
        match res {
            Ok(()) => {
                self.publish_state(peer, ConnectionState::Negotiating);
                self.refresh_session_metrics();
                Ok(())
            }
            Err(e) => {
                warn!(peer = %peer, "offering failed: {e}");
                MeshMetrics::bump(&self.metrics.negotiation_failures);
                self.events.publish(RoomEventKind::NegotiationFailed {
                    peer_id: peer.to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn toggle_audio(&mut self) -> bool {
        let enabled = self.media.toggle_audio();
        self.after_toggle(TrackKind::Audio, enabled);
        enabled
    }

    pub fn toggle_video(&mut self) -> bool {
        let enabled = self.media.toggle_video();
        self.after_toggle(TrackKind::Video, enabled);
        enabled
    }

    // Tracks are shared with every session, so flipping the flag needs no renegotiation.
    fn after_toggle(&self, kind: TrackKind, enabled: bool) {
        self.registry.for_each(|s| {
            debug!(peer = %s.peer_id(), ?kind, enabled, "local track flag applies to session");
        });
        self.events.publish(RoomEventKind::LocalMediaChanged {
            state: self.media.state(),
        });
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let mut peers = Vec::with_capacity(self.registry.len());
        self.registry.for_each(|s| peers.push(s.snapshot()));
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        RoomSnapshot {
            room_id: self.room_id.clone(),
            self_id: self.self_id.clone(),
            local_media: self.media.state(),
            peers,
        }
    }

    /// Stops local tracks, then closes every session.
    pub async fn shutdown(&mut self) {
        self.media.release();
        self.registry.close_all().await;
        self.refresh_session_metrics();
        self.events.publish(RoomEventKind::LocalMediaChanged {
            state: self.media.state(),
        });
        info!(room = %self.room_id, "room torn down");
    }

    /// Sends negotiation output produced by a session and counts it.
    async fn emit(&self, peer: &str, body: SignalBody) {
        let counter = match &body {
            SignalBody::Offer(_) => Some(&self.metrics.offers_sent),
            SignalBody::Answer(_) => Some(&self.metrics.answers_sent),
            SignalBody::IceCandidate(_) => Some(&self.metrics.candidates_sent),
            SignalBody::Join | SignalBody::Leave => None,
        };
        if matches!(body, SignalBody::Offer(_) | SignalBody::Answer(_)) {
            info!(peer = %peer, kind = body.kind(), "description sent");
        }
        self.send_to(peer, body).await;
        if let Some(c) = counter {
            MeshMetrics::bump(c);
        }
    }

    async fn send_to(&self, peer: &str, body: SignalBody) {
        let env = SignalEnvelope::to_peer(&self.room_id, &self.self_id, peer, body);
        self.send(env).await;
    }

    async fn send(&self, env: SignalEnvelope) {
        let kind = env.kind();
        if self.outbound.send(env).await.is_err() {
            warn!(room = %self.room_id, kind, "signaling channel closed, envelope not sent");
        }
    }

    fn publish_state(&self, peer: &str, state: ConnectionState) {
        self.events.publish(RoomEventKind::PeerStateChanged {
            peer_id: peer.to_string(),
            state,
        });
    }

    fn refresh_session_metrics(&self) {
        let mut active = 0u64;
        let mut connected = 0u64;
        self.registry.for_each(|s| {
            active += 1;
            if s.state() == ConnectionState::Connected {
                connected += 1;
            }
        });
        self.metrics.sessions_set(active, connected);
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn media(&self) -> &LocalMediaController {
        &self.media
    }
}
