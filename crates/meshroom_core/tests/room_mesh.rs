/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use std::time::Duration;

use common::{connected_to, join, join_with, wait_event, wait_snapshot, ROOM};
use meshroom_core::channel::{MemorySignalConnector, SignalConnector};
use meshroom_core::loopback::LoopbackTransportFactory;
use meshroom_core::protocol::{IceCandidate, SessionDescription, SignalBody, SignalEnvelope};
use meshroom_core::room_events::RoomEventKind;
use meshroom_core::session::ConnectionState;

#[tokio::test]
async fn three_peers_form_a_full_mesh() {
    let relay = MemorySignalConnector::new();
    let alpha = join(&relay, "alpha").await;
    let bob = join(&relay, "bob").await;
    let carol = join(&relay, "carol").await;

    let a = wait_snapshot(&alpha.handle, "alpha mesh", |s| connected_to(s, &["bob", "carol"])).await;
    wait_snapshot(&bob.handle, "bob mesh", |s| connected_to(s, &["alpha", "carol"])).await;
    wait_snapshot(&carol.handle, "carol mesh", |s| connected_to(s, &["alpha", "bob"])).await;

    // earlier members offer to the newcomer
    assert_eq!(alpha.factory.created_for("bob"), 1);
    assert_eq!(carol.factory.created_for("alpha"), 1);
    assert!(a.peers.iter().all(|p| p.remote_streams.len() == 1));
    assert!(a.peers.iter().all(|p| p.pending_candidates == 0));
    assert!(a.peers.iter().all(|p| p.local_tracks.len() == 2));
}

#[tokio::test]
async fn leaving_peer_is_removed_everywhere_else() {
    let relay = MemorySignalConnector::new();
    let mut alpha = join(&relay, "alpha").await;
    let mut bob = join(&relay, "bob").await;
    let carol = join(&relay, "carol").await;
    wait_snapshot(&alpha.handle, "alpha mesh", |s| connected_to(s, &["bob", "carol"])).await;
    wait_snapshot(&carol.handle, "carol mesh", |s| connected_to(s, &["alpha", "bob"])).await;

    bob.coordinator.stop().await;
    bob.coordinator.stop().await;

    wait_snapshot(&alpha.handle, "bob gone at alpha", |s| connected_to(s, &["carol"])).await;
    wait_snapshot(&carol.handle, "bob gone at carol", |s| connected_to(s, &["alpha"])).await;
    assert!(bob.handle.snapshot().await.is_err());
    assert!(alpha.factory.log_for("bob").unwrap().is_closed());
    assert!(!alpha.factory.log_for("carol").unwrap().is_closed());

    wait_event(&mut alpha.events, |e| {
        matches!(e, RoomEventKind::PeerRemoved { peer_id } if peer_id == "bob")
    })
    .await;
    alpha.coordinator.stop().await;
    assert_eq!(relay.members(ROOM), vec!["carol".to_string()]);
}

#[tokio::test]
async fn alpha_answers_bob_and_applies_candidates_in_order() {
    let relay = MemorySignalConnector::new();
    let alpha = join(&relay, "alpha").await;
    let mut bob = relay.open(ROOM, "bob").await.unwrap();
    let out = bob.sender();

    out.send(SignalEnvelope::to_peer(
        ROOM,
        "bob",
        "alpha",
        SignalBody::Offer(SessionDescription::offer("O1")),
    ))
    .await
    .unwrap();

    let answer = bob.recv().await.unwrap();
    assert_eq!(answer.from, "alpha");
    assert!(matches!(answer.body, SignalBody::Answer(_)));

    for c in ["c1", "c2"] {
        out.send(SignalEnvelope::to_peer(
            ROOM,
            "bob",
            "alpha",
            SignalBody::IceCandidate(IceCandidate::new(c)),
        ))
        .await
        .unwrap();
    }
    let snap = wait_snapshot(&alpha.handle, "candidates applied", |s| {
        s.peers.len() == 1
            && s.peers[0].applied_candidates == 2
            && s.peers[0].state == ConnectionState::Connected
    })
    .await;
    assert_eq!(snap.peers[0].pending_candidates, 0);
    assert_eq!(
        alpha.factory.log_for("bob").unwrap().applied_candidates(),
        vec!["c1", "c2"]
    );

    out.send(SignalEnvelope::to_peer(ROOM, "bob", "alpha", SignalBody::Leave))
        .await
        .unwrap();
    wait_snapshot(&alpha.handle, "registry empty", |s| s.peers.is_empty()).await;
}

#[tokio::test]
async fn stray_answer_and_candidate_leave_registry_unchanged() {
    let relay = MemorySignalConnector::new();
    let alpha = join(&relay, "alpha").await;
    let mallory = relay.open(ROOM, "mallory").await.unwrap();
    let out = mallory.sender();
    out.send(SignalEnvelope::to_peer(
        ROOM,
        "mallory",
        "alpha",
        SignalBody::Answer(SessionDescription::answer("A")),
    ))
    .await
    .unwrap();
    out.send(SignalEnvelope::to_peer(
        ROOM,
        "mallory",
        "alpha",
        SignalBody::IceCandidate(IceCandidate::new("c")),
    ))
    .await
    .unwrap();

    let metrics = wait_for_received_candidate(&alpha).await;
    assert_eq!(metrics["negotiation"]["answers_received"], 1);
    assert_eq!(metrics["negotiation"]["protocol_violations"], 2);
    assert!(alpha.handle.snapshot().await.unwrap().peers.is_empty());
    assert_eq!(alpha.factory.created_for("mallory"), 0);
}

async fn wait_for_received_candidate(peer: &common::Peer) -> serde_json::Value {
    for _ in 0..500 {
        let m = peer.handle.metrics();
        if m["negotiation"]["candidates_received"] == 1 {
            return m;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("candidate never reached the router");
}

#[tokio::test]
async fn muting_never_renegotiates() {
    let relay = MemorySignalConnector::new();
    let mut alpha = join(&relay, "alpha").await;
    let bob = join(&relay, "bob").await;
    wait_snapshot(&alpha.handle, "connected", |s| connected_to(s, &["bob"])).await;
    let calls_before = alpha.factory.log_for("bob").unwrap().calls().len();

    assert!(!alpha.handle.toggle_audio().await.unwrap());
    assert!(!alpha.handle.toggle_video().await.unwrap());
    assert!(alpha.handle.toggle_audio().await.unwrap());
    let snap = alpha.handle.snapshot().await.unwrap();
    assert!(snap.local_media.audio_enabled);
    assert!(!snap.local_media.video_enabled);

    let ev = wait_event(&mut alpha.events, |e| {
        matches!(e, RoomEventKind::LocalMediaChanged { .. })
    })
    .await;
    assert!(matches!(ev, RoomEventKind::LocalMediaChanged { state } if !state.audio_enabled));

    assert!(connected_to(&snap, &["bob"]));
    assert_eq!(alpha.factory.created_for("bob"), 1);
    assert_eq!(bob.factory.created_for("alpha"), 1);
    assert_eq!(alpha.factory.log_for("bob").unwrap().calls().len(), calls_before);
}

#[tokio::test]
async fn dropped_channel_keeps_existing_sessions() {
    let relay = MemorySignalConnector::new();
    let mut alpha = join(&relay, "alpha").await;
    let _bob = join(&relay, "bob").await;
    wait_snapshot(&alpha.handle, "connected", |s| connected_to(s, &["bob"])).await;

    relay.disconnect(ROOM, "alpha");
    wait_event(&mut alpha.events, |e| matches!(e, RoomEventKind::ChannelClosed)).await;
    let snap = alpha.handle.snapshot().await.unwrap();
    assert!(connected_to(&snap, &["bob"]));
    assert_eq!(alpha.handle.metrics()["signal"]["connected"], false);
}

#[tokio::test]
async fn explicit_connect_is_refused_while_session_active() {
    let relay = MemorySignalConnector::new();
    let alpha = join(&relay, "alpha").await;
    let _bob = join(&relay, "bob").await;
    wait_snapshot(&alpha.handle, "connected", |s| connected_to(s, &["bob"])).await;
    let err = alpha.handle.connect_to("bob").await.unwrap_err();
    assert!(err.is_protocol_order());
}

#[tokio::test]
async fn slow_peer_does_not_hold_up_others() {
    let relay = MemorySignalConnector::new();
    let factory = LoopbackTransportFactory::new();
    factory.delay_peer("slow", "create_answer", Duration::from_secs(3));
    let alpha = join_with(&relay, "alpha", factory).await;
    let mut slow = relay.open(ROOM, "slow").await.unwrap();
    let mut fast = relay.open(ROOM, "fast").await.unwrap();

    slow.sender()
        .send(SignalEnvelope::to_peer(
            ROOM,
            "slow",
            "alpha",
            SignalBody::Offer(SessionDescription::offer("O-slow")),
        ))
        .await
        .unwrap();
    wait_snapshot(&alpha.handle, "slow session registered", |s| s.peers.len() == 1).await;
    fast.sender()
        .send(SignalEnvelope::to_peer(
            ROOM,
            "fast",
            "alpha",
            SignalBody::Offer(SessionDescription::offer("O-fast")),
        ))
        .await
        .unwrap();

    let answer = tokio::time::timeout(Duration::from_secs(1), fast.recv())
        .await
        .expect("fast peer waited on the slow one")
        .unwrap();
    assert!(matches!(answer.body, SignalBody::Answer(_)));
    assert!(tokio::time::timeout(Duration::from_millis(50), slow.recv())
        .await
        .is_err());

    let snap = alpha.handle.snapshot().await.unwrap();
    let state = |id: &str| snap.peers.iter().find(|p| p.peer_id == id).map(|p| p.state);
    assert_eq!(state("fast"), Some(ConnectionState::Connected));
    assert_eq!(state("slow"), Some(ConnectionState::Negotiating));

    let late = tokio::time::timeout(Duration::from_secs(5), slow.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(late.body, SignalBody::Answer(_)));
}
