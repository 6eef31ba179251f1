/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meshroom_protocol::{SdpType, SessionDescription};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{MeshError, MeshResult};
use crate::media::LocalMediaController;
use crate::session::PeerSession;
use crate::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};

/// At most one session per remote participant. Each session gets a fresh epoch so
/// transport events from a replaced or closed instance can be told apart.
pub struct SessionRegistry {
    sessions: HashMap<String, PeerSession>,
    next_epoch: u64,
    factory: Arc<dyn TransportFactory>,
    events: mpsc::Sender<TransportEvent>,
    step_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        events: mpsc::Sender<TransportEvent>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            next_epoch: 1,
            factory,
            events,
            step_timeout,
        }
    }

    async fn open_transport(
        &mut self,
        peer_id: &str,
    ) -> MeshResult<(Box<dyn PeerTransport>, TransportEvents)> {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let events = TransportEvents::new(peer_id, epoch, self.events.clone());
        match tokio::time::timeout(self.step_timeout, self.factory.create(events.clone())).await {
            Ok(Ok(t)) => Ok((t, events)),
            Ok(Err(e)) => Err(MeshError::negotiation(peer_id, format!("open transport: {e:#}"))),
            Err(_) => Err(MeshError::negotiation(peer_id, "open transport: timed out")),
        }
    }

    /// Answers an offer from `peer_id`. An existing session for that peer is closed and
    /// replaced. Nothing is registered when creation fails. The answer itself is produced
    /// in the background.
    pub async fn get_or_create_as_answerer(
        &mut self,
        peer_id: &str,
        offer: SessionDescription,
        media: &LocalMediaController,
    ) -> MeshResult<()> {
        if offer.sdp_type != SdpType::Offer {
            return Err(MeshError::negotiation(peer_id, "offer payload is not an offer"));
        }
        if let Some(mut old) = self.sessions.remove(peer_id) {
            info!(peer = %peer_id, epoch = old.epoch(), "replacing session on new offer");
            old.close().await;
        }
        let (transport, events) = self.open_transport(peer_id).await?;
        let session = PeerSession::create_as_answerer(
            peer_id,
            transport,
            events,
            media,
            offer,
            self.step_timeout,
        );
        self.sessions.insert(peer_id.to_string(), session);
        Ok(())
    }

    /// Starts a session toward `peer_id` as offerer; the Offer is produced in the background.
    pub async fn initiate(&mut self, peer_id: &str, media: &LocalMediaController) -> MeshResult<()> {
        if let Some(mut old) = self.sessions.remove(peer_id) {
            old.close().await;
        }
        let (transport, events) = self.open_transport(peer_id).await?;
        let session =
            PeerSession::create_as_offerer(peer_id, transport, events, media, self.step_timeout);
        self.sessions.insert(peer_id.to_string(), session);
        Ok(())
    }

    pub fn get_existing(&mut self, peer_id: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer_id)
    }

    /// The session for `peer_id` only if it is still the instance `epoch` refers to.
    pub fn get_current(&mut self, peer_id: &str, epoch: u64) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(peer_id)
            .filter(|s| s.epoch() == epoch)
    }

    /// Closes and forgets the session. Returns whether one existed.
    pub async fn remove(&mut self, peer_id: &str) -> bool {
        match self.sessions.remove(peer_id) {
            Some(mut s) => {
                s.close().await;
                true
            }
            None => false,
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&PeerSession)) {
        for s in self.sessions.values() {
            f(s);
        }
    }

    pub async fn close_all(&mut self) {
        for (_, mut s) in self.sessions.drain() {
            s.close().await;
        }
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransportFactory;
    use crate::media::{MediaConstraints, MediaSource, SyntheticMediaSource};
    use crate::session::ConnectionState;

    async fn setup() -> (SessionRegistry, LoopbackTransportFactory, LocalMediaController) {
        let factory = LoopbackTransportFactory::new();
        let (tx, _) = mpsc::channel(256);
        let reg = SessionRegistry::new(Arc::new(factory.clone()), tx, Duration::from_secs(5));
        let stream = SyntheticMediaSource::new()
            .acquire(MediaConstraints { audio: true, video: false })
            .await
            .unwrap();
        (reg, factory, LocalMediaController::new(Some(stream)))
    }

    #[tokio::test]
    async fn second_offer_replaces_session_with_new_epoch() {
        let (mut reg, factory, media) = setup().await;
        let offer = SessionDescription::offer("O1");
        reg.get_or_create_as_answerer("carol", offer.clone(), &media).await.unwrap();
        let first = reg.get_existing("carol").unwrap().epoch();
        reg.get_or_create_as_answerer("carol", offer, &media).await.unwrap();
        let second = reg.get_existing("carol").unwrap().epoch();

        assert_ne!(first, second);
        assert_eq!(reg.len(), 1);
        assert!(reg.get_current("carol", first).is_none());
        assert!(reg.get_current("carol", second).is_some());
        assert_eq!(factory.created_for("carol"), 2);
        assert_eq!(factory.epochs_for("carol"), vec![first, second]);
        assert!(factory.log_for("carol").is_some());
    }

    #[tokio::test]
    async fn malformed_offer_registers_nothing_and_keeps_existing() {
        let (mut reg, factory, media) = setup().await;
        reg.initiate("bob", &media).await.unwrap();
        let epoch = reg.get_existing("bob").unwrap().epoch();
        let err = reg
            .get_or_create_as_answerer("bob", SessionDescription::answer("A"), &media)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NegotiationFailed { .. }));
        assert!(reg.get_current("bob", epoch).is_some());
        assert_eq!(factory.created_for("bob"), 1);
    }

    #[tokio::test]
    async fn close_all_closes_every_session() {
        let (mut reg, factory, media) = setup().await;
        reg.initiate("bob", &media).await.unwrap();
        reg.initiate("carol", &media).await.unwrap();
        assert_eq!(reg.peer_ids(), vec!["bob".to_string(), "carol".to_string()]);

        let mut states = Vec::new();
        reg.for_each(|s| states.push(s.state()));
        assert!(states.iter().all(|s| *s == ConnectionState::Negotiating));

        reg.close_all().await;
        assert!(reg.is_empty());
        assert!(factory.log_for("bob").unwrap().is_closed());
        assert!(factory.log_for("carol").unwrap().is_closed());
        assert!(!reg.remove("bob").await);
    }
}
