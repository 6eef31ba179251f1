/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshroom_core::channel::MemorySignalConnector;
use meshroom_core::config::MeshConfig;
use meshroom_core::lifecycle::{RoomCoordinator, RoomHandle};
use meshroom_core::loopback::LoopbackTransportFactory;
use meshroom_core::media::SyntheticMediaSource;
use meshroom_core::metrics::MeshMetrics;
use meshroom_core::room_events::{RoomEvent, RoomEventKind};
use meshroom_core::router::RoomSnapshot;
use meshroom_core::session::ConnectionState;
use tokio::sync::broadcast;

pub const ROOM: &str = "room-1";

pub struct Peer {
    pub coordinator: RoomCoordinator,
    pub handle: RoomHandle,
    pub factory: LoopbackTransportFactory,
    pub events: broadcast::Receiver<RoomEvent>,
}

pub async fn join(connector: &MemorySignalConnector, id: &str) -> Peer {
    join_with(connector, id, LoopbackTransportFactory::new()).await
}

pub async fn join_with(
    connector: &MemorySignalConnector,
    id: &str,
    factory: LoopbackTransportFactory,
) -> Peer {
    let mut coordinator = RoomCoordinator::new(
        MeshConfig::new(id),
        Arc::new(SyntheticMediaSource::new()),
        Arc::new(connector.clone()),
        Arc::new(factory.clone()),
        Arc::new(MeshMetrics::new()),
    );
    let events = coordinator.subscribe();
    let handle = coordinator.start(ROOM).await.unwrap();
    Peer {
        coordinator,
        handle,
        factory,
        events,
    }
}

/// Polls the room until `pred` holds, failing the test after a few seconds.
pub async fn wait_snapshot(
    handle: &RoomHandle,
    what: &str,
    pred: impl Fn(&RoomSnapshot) -> bool,
) -> RoomSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snap = handle.snapshot().await.unwrap();
        if pred(&snap) {
            return snap;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}: {snap:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn connected_to(snap: &RoomSnapshot, peers: &[&str]) -> bool {
    snap.peers.len() == peers.len()
        && peers.iter().all(|p| {
            snap.peers
                .iter()
                .any(|s| s.peer_id == *p && s.state == ConnectionState::Connected)
        })
}

pub async fn wait_event(
    events: &mut broadcast::Receiver<RoomEvent>,
    pred: impl Fn(&RoomEventKind) -> bool,
) -> RoomEventKind {
    let fut = async {
        loop {
            let ev = events.recv().await.unwrap();
            if pred(&ev.kind) {
                return ev.kind;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("event did not arrive")
}
