/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;
use tokio::sync::broadcast;

use crate::media::{LocalMediaState, TrackKind};
use crate::session::ConnectionState;

fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomEventKind {
    PeerStateChanged {
        peer_id: String,
        state: ConnectionState,
    },
    RemoteStreamAdded {
        peer_id: String,
        stream_id: String,
        kinds: Vec<TrackKind>,
    },
    PeerRemoved {
        peer_id: String,
    },
    LocalMediaChanged {
        state: LocalMediaState,
    },
    ProtocolViolation {
        peer_id: String,
        reason: String,
    },
    NegotiationFailed {
        peer_id: String,
        reason: String,
    },
    ChannelClosed,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoomEvent {
    pub ts_ms: u64,
    #[serde(flatten)]
    pub kind: RoomEventKind,
}

impl RoomEvent {
    pub fn new(kind: RoomEventKind) -> Self {
        Self {
            ts_ms: now_ms_u64(),
            kind,
        }
    }
}

/// Fan-out of room events to any number of observers. Publishing never blocks and works
/// with no subscriber attached.
#[derive(Clone)]
pub struct RoomEvents {
    tx: broadcast::Sender<RoomEvent>,
}

impl RoomEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, kind: RoomEventKind) {
        let _ = self.tx.send(RoomEvent::new(kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_flat_with_kind_tag() {
        let ev = RoomEvent::new(RoomEventKind::PeerStateChanged {
            peer_id: "bob".into(),
            state: ConnectionState::Connected,
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["kind"], "peer_state_changed");
        assert_eq!(v["state"], "connected");
        assert!(v["ts_ms"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_and_tolerates_none() {
        let events = RoomEvents::new(16);
        events.publish(RoomEventKind::ChannelClosed);
        let mut rx = events.subscribe();
        events.publish(RoomEventKind::PeerRemoved { peer_id: "bob".into() });
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev.kind, RoomEventKind::PeerRemoved { ref peer_id } if peer_id == "bob"));
    }
}
