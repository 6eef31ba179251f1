/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-process transport that needs no network stack.
//!
//! Descriptions are plain text listing the tracks added before they were created, so a
//! peer applying a remote description learns the other side's tracks the same way a real
//! stack would. Once both descriptions are set the transport reports `Connected`. Every
//! call is recorded and individual operations can be made to fail or to stall.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use meshroom_protocol::{IceCandidate, SdpType, SessionDescription};

use crate::media::{LocalTrack, TrackKind};
use crate::transport::{
    PeerTransport, RemoteTrack, TransportEventKind, TransportEvents, TransportFactory,
    TransportState,
};

const SDP_HEADER: &str = "meshroom-loopback";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    AddTrack(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, c: Call) {
        lock(&self.0).push(c);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.0).clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.0)
            .iter()
            .filter_map(|c| match c {
                Call::AddCandidate(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.0).contains(&Call::Close)
    }
}

#[derive(Default)]
struct PlanInner {
    fail: HashSet<String>,
    // keyed by (peer, op); no peer means every peer
    delay: HashMap<(Option<String>, String), Duration>,
}

/// Operation names accepted by `fail_on` and `delay_on`: `create_offer`, `create_answer`,
/// `set_local_description`, `set_remote_description`, `add_ice_candidate`, `add_track`;
/// `delay_on` also takes `close`.
#[derive(Clone, Default)]
struct Plan(Arc<Mutex<PlanInner>>);

impl Plan {
    fn fail_on(&self, op: &str) {
        lock(&self.0).fail.insert(op.to_string());
    }

    fn delay(&self, peer: Option<&str>, op: &str, d: Duration) {
        lock(&self.0)
            .delay
            .insert((peer.map(str::to_string), op.to_string()), d);
    }

    fn delay_for(&self, peer: &str, op: &str) -> Option<Duration> {
        let p = lock(&self.0);
        p.delay
            .get(&(Some(peer.to_string()), op.to_string()))
            .or_else(|| p.delay.get(&(None, op.to_string())))
            .copied()
    }

    async fn check(&self, peer: &str, op: &str) -> Result<()> {
        if let Some(d) = self.delay_for(peer, op) {
            tokio::time::sleep(d).await;
        }
        if lock(&self.0).fail.contains(op) {
            bail!("{op} rejected by loopback");
        }
        Ok(())
    }

    fn clear(&self) {
        let mut p = lock(&self.0);
        p.fail.clear();
        p.delay.clear();
    }
}

#[derive(Default)]
struct Progress {
    tracks: Vec<(TrackKind, String, String)>,
    local: bool,
    remote: bool,
    connected: bool,
    closed: bool,
}

pub struct LoopbackTransport {
    events: TransportEvents,
    log: CallLog,
    plan: Plan,
    progress: Mutex<Progress>,
}

impl LoopbackTransport {
    pub fn new(events: TransportEvents) -> Self {
        Self {
            events,
            log: CallLog::default(),
            plan: Plan::default(),
            progress: Mutex::new(Progress::default()),
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn fail_on(&self, op: &str) {
        self.plan.fail_on(op);
    }

    /// Makes `op` take `d` before it completes.
    pub fn delay_on(&self, op: &str, d: Duration) {
        self.plan.delay(None, op, d);
    }

    async fn check(&self, op: &str) -> Result<()> {
        self.plan.check(self.events.peer_id(), op).await
    }

    fn describe(&self) -> String {
        let p = lock(&self.progress);
        let mut sdp = format!("{SDP_HEADER} {}\n", self.events.peer_id());
        for (kind, id, stream) in &p.tracks {
            let kind = match kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("track {kind} {id} {stream}\n"));
        }
        sdp
    }

    fn ensure_open(&self) -> Result<()> {
        if lock(&self.progress).closed {
            bail!("transport closed");
        }
        Ok(())
    }

    async fn maybe_connected(&self) {
        let ready = {
            let mut p = lock(&self.progress);
            if p.local && p.remote && !p.connected {
                p.connected = true;
                true
            } else {
                false
            }
        };
        if ready {
            self.events
                .emit(TransportEventKind::StateChanged(TransportState::Connecting))
                .await;
            self.events
                .emit(TransportEventKind::StateChanged(TransportState::Connected))
                .await;
        }
    }
}

// Descriptions from another stack carry no track lines we understand.
fn parse_tracks(sdp: &str) -> Vec<RemoteTrack> {
    let mut lines = sdp.lines();
    if !lines.next().unwrap_or_default().starts_with(SDP_HEADER) {
        return Vec::new();
    }
    let mut out = Vec::new();
    for line in lines {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let ["track", kind, id, stream] = parts.as_slice() else {
            continue;
        };
        let kind = match *kind {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            _ => continue,
        };
        out.push(RemoteTrack {
            track_id: id.to_string(),
            stream_id: stream.to_string(),
            kind,
            media: None,
        });
    }
    out
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.log.push(Call::CreateOffer);
        self.ensure_open()?;
        self.check("create_offer").await?;
        Ok(SessionDescription::offer(self.describe()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.log.push(Call::CreateAnswer);
        self.ensure_open()?;
        self.check("create_answer").await?;
        if !lock(&self.progress).remote {
            bail!("answer requires a remote offer");
        }
        Ok(SessionDescription::answer(self.describe()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.log.push(Call::SetLocal(desc.sdp_type));
        self.ensure_open()?;
        self.check("set_local_description").await?;
        lock(&self.progress).local = true;
        let candidate = IceCandidate::new(format!(
            "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
            40000 + self.events.epoch() % 20000
        ));
        self.events
            .emit(TransportEventKind::LocalCandidate(candidate))
            .await;
        self.maybe_connected().await;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.log.push(Call::SetRemote(desc.sdp_type));
        self.ensure_open()?;
        self.check("set_remote_description").await?;
        let tracks = parse_tracks(&desc.sdp);
        lock(&self.progress).remote = true;
        for t in tracks {
            self.events.emit(TransportEventKind::RemoteTrack(t)).await;
        }
        self.maybe_connected().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.log.push(Call::AddCandidate(candidate.candidate.clone()));
        self.ensure_open()?;
        self.check("add_ice_candidate").await?;
        if !lock(&self.progress).remote {
            bail!("candidate before remote description");
        }
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.log.push(Call::AddTrack(track.id().to_string()));
        self.ensure_open()?;
        self.check("add_track").await?;
        lock(&self.progress).tracks.push((
            track.kind(),
            track.id().to_string(),
            track.stream_id().to_string(),
        ));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.push(Call::Close);
        self.check("close").await?;
        let was_open = {
            let mut p = lock(&self.progress);
            !std::mem::replace(&mut p.closed, true)
        };
        if was_open {
            self.events
                .emit(TransportEventKind::StateChanged(TransportState::Closed))
                .await;
        }
        Ok(())
    }
}

#[derive(Clone)]
struct Created {
    peer_id: String,
    epoch: u64,
    log: CallLog,
}

/// Builds [`LoopbackTransport`]s and keeps the call log of each one it created.
#[derive(Clone, Default)]
pub struct LoopbackTransportFactory {
    plan: Plan,
    created: Arc<Mutex<Vec<Created>>>,
}

impl LoopbackTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `op` fail on every transport this factory created or will create.
    pub fn fail_on(&self, op: &str) {
        self.plan.fail_on(op);
    }

    /// Makes `op` take `d` on every transport this factory created or will create.
    pub fn delay_on(&self, op: &str, d: Duration) {
        self.plan.delay(None, op, d);
    }

    /// Like `delay_on`, for transports toward `peer_id` only.
    pub fn delay_peer(&self, peer_id: &str, op: &str, d: Duration) {
        self.plan.delay(Some(peer_id), op, d);
    }

    /// Drops every injected failure and delay.
    pub fn clear_plan(&self) {
        self.plan.clear();
    }

    /// Call log of the most recent transport built for `peer_id`.
    pub fn log_for(&self, peer_id: &str) -> Option<CallLog> {
        lock(&self.created)
            .iter()
            .rev()
            .find(|c| c.peer_id == peer_id)
            .map(|c| c.log.clone())
    }

    pub fn created_for(&self, peer_id: &str) -> usize {
        lock(&self.created)
            .iter()
            .filter(|c| c.peer_id == peer_id)
            .count()
    }

    pub fn epochs_for(&self, peer_id: &str) -> Vec<u64> {
        lock(&self.created)
            .iter()
            .filter(|c| c.peer_id == peer_id)
            .map(|c| c.epoch)
            .collect()
    }
}

#[async_trait]
impl TransportFactory for LoopbackTransportFactory {
    async fn create(&self, events: TransportEvents) -> Result<Box<dyn PeerTransport>> {
        let peer_id = events.peer_id().to_string();
        let epoch = events.epoch();
        let mut t = LoopbackTransport::new(events);
        t.plan = self.plan.clone();
        lock(&self.created).push(Created {
            peer_id,
            epoch,
            log: t.log(),
        });
        Ok(Box::new(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn descriptions_carry_tracks_and_connect() {
        let (tx, mut rx) = mpsc::channel(16);
        let a = LoopbackTransport::new(TransportEvents::new("alpha", 3, tx.clone()));
        let track = LocalTrack::new(TrackKind::Audio, "s-audio", "s");
        a.add_track(&track).await.unwrap();
        let offer = a.create_offer().await.unwrap();

        let b = LoopbackTransport::new(TransportEvents::new("bob", 4, tx));
        b.set_remote_description(offer).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.peer_id, "bob");
        let TransportEventKind::RemoteTrack(t) = ev.kind else {
            panic!("expected remote track");
        };
        assert_eq!((t.track_id.as_str(), t.stream_id.as_str()), ("s-audio", "s"));

        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer).await.unwrap();
        let kinds: Vec<_> = [rx.recv().await, rx.recv().await, rx.recv().await]
            .into_iter()
            .map(|e| e.unwrap().kind)
            .collect();
        assert!(matches!(kinds[0], TransportEventKind::LocalCandidate(_)));
        assert!(matches!(
            kinds[2],
            TransportEventKind::StateChanged(TransportState::Connected)
        ));
    }

    #[tokio::test]
    async fn candidate_before_remote_description_is_rejected() {
        let (tx, _rx) = mpsc::channel(16);
        let t = LoopbackTransport::new(TransportEvents::new("alpha", 1, tx));
        assert!(t.add_ice_candidate(IceCandidate::new("c")).await.is_err());
        t.fail_on("create_offer");
        assert!(t.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn factory_delays_only_the_named_peer() {
        let factory = LoopbackTransportFactory::new();
        factory.delay_peer("slow", "create_offer", Duration::from_secs(30));
        let (tx, _rx) = mpsc::channel(16);
        let fast = factory
            .create(TransportEvents::new("fast", 1, tx.clone()))
            .await
            .unwrap();
        let slow = factory
            .create(TransportEvents::new("slow", 2, tx))
            .await
            .unwrap();
        let quick = Duration::from_millis(500);
        assert!(tokio::time::timeout(quick, fast.create_offer()).await.is_ok());
        assert!(tokio::time::timeout(quick, slow.create_offer()).await.is_err());
        factory.clear_plan();
        assert!(tokio::time::timeout(quick, slow.create_offer()).await.is_ok());
    }
}
