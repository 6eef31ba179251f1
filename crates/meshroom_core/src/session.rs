/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meshroom_protocol::{IceCandidate, SdpType, SessionDescription, SignalBody};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::media::{LocalMediaController, LocalTrack};
use crate::transport::{
    PeerTransport, RemoteTrack, StepOutcome, TransportEventKind, TransportEvents, TransportState,
};

const WORKER_QUEUE: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Clone, Debug)]
pub struct RemoteStream {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub role: Role,
    pub state: ConnectionState,
    pub has_remote_description: bool,
    pub pending_candidates: usize,
    pub applied_candidates: usize,
    pub local_tracks: Vec<String>,
    pub remote_streams: Vec<String>,
}

/// Transport work for one session, run in order by that session's worker.
enum Op {
    AddTracks(Vec<LocalTrack>),
    Offer,
    ApplyRemote(SessionDescription),
    Answer,
    AddCandidate(IceCandidate),
}

async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, String>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(format!("{what}: {e:#}")),
        Err(_) => Err(format!("{what}: timed out")),
    }
}

async fn local_description(
    t: &dyn PeerTransport,
    limit: Duration,
    kind: SdpType,
) -> Result<SessionDescription, String> {
    let desc = match kind {
        SdpType::Offer => bounded(limit, "create offer", t.create_offer()).await?,
        _ => bounded(limit, "create answer", t.create_answer()).await?,
    };
    bounded(limit, "set local description", t.set_local_description(desc.clone())).await?;
    Ok(desc)
}

async fn run_op(t: &dyn PeerTransport, limit: Duration, op: Op) -> Option<StepOutcome> {
    let outcome = match op {
        Op::AddTracks(tracks) => {
            for track in &tracks {
                if let Err(e) = bounded(limit, "add track", t.add_track(track)).await {
                    return Some(StepOutcome::Failed(e));
                }
            }
            return None;
        }
        Op::Offer => match local_description(t, limit, SdpType::Offer).await {
            Ok(d) => StepOutcome::LocalReady(d),
            Err(e) => StepOutcome::Failed(e),
        },
        Op::Answer => match local_description(t, limit, SdpType::Answer).await {
            Ok(d) => StepOutcome::LocalReady(d),
            Err(e) => StepOutcome::Failed(e),
        },
        Op::ApplyRemote(desc) => {
            match bounded(limit, "set remote description", t.set_remote_description(desc)).await {
                Ok(()) => StepOutcome::RemoteApplied,
                Err(e) => StepOutcome::Failed(e),
            }
        }
        Op::AddCandidate(c) => {
            match bounded(limit, "add ice candidate", t.add_ice_candidate(c)).await {
                Ok(()) => StepOutcome::CandidateApplied,
                Err(e) => StepOutcome::CandidateRejected(e),
            }
        }
    };
    Some(outcome)
}

// Stops at the first failure; the room task closes the session when it sees it.
fn spawn_worker(
    transport: Arc<dyn PeerTransport>,
    events: TransportEvents,
    limit: Duration,
) -> (mpsc::Sender<Op>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Op>(WORKER_QUEUE);
    let task = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let Some(outcome) = run_op(transport.as_ref(), limit, op).await else {
                continue;
            };
            let failed = matches!(outcome, StepOutcome::Failed(_));
            events.emit(TransportEventKind::Step(outcome)).await;
            if failed {
                break;
            }
        }
    });
    (tx, task)
}

/// Negotiation and connectivity state for exactly one remote participant.
///
/// Transport calls run on a worker task owned by the session, one at a time and in the
/// order they were requested, so a slow peer never holds up the room. Their results come
/// back through the room's queue and are folded in with [`PeerSession::on_step`].
///
/// Remote candidates that arrive before the remote description was requested are held
/// in a FIFO and handed to the worker, in arrival order, right behind the description;
/// from then on the buffer stays empty. Local candidates are held until the local
/// description went out, so the peer never sees a candidate before the description it
/// belongs to. A closed session is never reopened.
pub struct PeerSession {
    peer_id: String,
    epoch: u64,
    role: Role,
    state: ConnectionState,
    pending_candidates: VecDeque<IceCandidate>,
    remote_requested: bool,
    has_remote_description: bool,
    local_sent: bool,
    held_local: Vec<IceCandidate>,
    applied_candidates: usize,
    local_tracks: BTreeSet<String>,
    remote_streams: BTreeMap<String, RemoteStream>,
    transport: Arc<dyn PeerTransport>,
    ops: Option<mpsc::Sender<Op>>,
    worker: Option<JoinHandle<()>>,
    step_timeout: Duration,
}

impl PeerSession {
    fn new(
        peer_id: &str,
        role: Role,
        transport: Box<dyn PeerTransport>,
        events: TransportEvents,
        step_timeout: Duration,
    ) -> Self {
        let transport: Arc<dyn PeerTransport> = Arc::from(transport);
        let epoch = events.epoch();
        let (ops, worker) = spawn_worker(transport.clone(), events, step_timeout);
        Self {
            peer_id: peer_id.to_string(),
            epoch,
            role,
            state: ConnectionState::New,
            pending_candidates: VecDeque::new(),
            remote_requested: false,
            has_remote_description: false,
            local_sent: false,
            held_local: Vec::new(),
            applied_candidates: 0,
            local_tracks: BTreeSet::new(),
            remote_streams: BTreeMap::new(),
            transport,
            ops: Some(ops),
            worker: Some(worker),
            step_timeout,
        }
    }

    /// Builds a session that offers first. The Offer comes back as
    /// `StepOutcome::LocalReady` once the transport produced it.
    pub fn create_as_offerer(
        peer_id: &str,
        transport: Box<dyn PeerTransport>,
        events: TransportEvents,
        media: &LocalMediaController,
        step_timeout: Duration,
    ) -> Self {
        let mut session = Self::new(peer_id, Role::Offerer, transport, events, step_timeout);
        media.attach_to(&mut session);
        session.submit(Op::Offer);
        session.state = ConnectionState::Negotiating;
        info!(peer = %peer_id, epoch = session.epoch, tracks = session.local_tracks.len(), "negotiating as offerer");
        session
    }

    /// Builds a session answering `offer`: the offer is applied first, then the answer is
    /// produced and comes back as `StepOutcome::LocalReady`.
    pub fn create_as_answerer(
        peer_id: &str,
        transport: Box<dyn PeerTransport>,
        events: TransportEvents,
        media: &LocalMediaController,
        offer: SessionDescription,
        step_timeout: Duration,
    ) -> Self {
        let mut session = Self::new(peer_id, Role::Answerer, transport, events, step_timeout);
        media.attach_to(&mut session);
        session.state = ConnectionState::Negotiating;
        session.request_remote(offer);
        session.submit(Op::Answer);
        info!(peer = %peer_id, epoch = session.epoch, tracks = session.local_tracks.len(), "negotiating as answerer");
        session
    }

    fn submit(&mut self, op: Op) {
        let Some(ops) = self.ops.as_ref() else {
            return;
        };
        if let Err(e) = ops.try_send(op) {
            warn!(peer = %self.peer_id, "negotiation queue rejected step: {e}");
        }
    }

    fn request_remote(&mut self, desc: SessionDescription) {
        self.remote_requested = true;
        self.submit(Op::ApplyRemote(desc));
        while let Some(c) = self.pending_candidates.pop_front() {
            self.submit(Op::AddCandidate(c));
        }
    }

    pub(crate) fn attach_tracks(&mut self, tracks: &[LocalTrack]) {
        let fresh: Vec<LocalTrack> = tracks
            .iter()
            .filter(|t| !self.local_tracks.contains(t.id()))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return;
        }
        for t in &fresh {
            self.local_tracks.insert(t.id().to_string());
        }
        self.submit(Op::AddTracks(fresh));
    }

    /// Valid only for an offerer still waiting for its answer.
    pub fn apply_remote_answer(&mut self, answer: SessionDescription) -> MeshResult<()> {
        if self.role != Role::Offerer {
            return Err(MeshError::order(&self.peer_id, "answer for a session we did not offer"));
        }
        if self.remote_requested {
            return Err(MeshError::order(&self.peer_id, "answer already applied"));
        }
        if self.state != ConnectionState::Negotiating {
            return Err(MeshError::order(
                &self.peer_id,
                format!("answer while {:?}", self.state),
            ));
        }
        if answer.sdp_type != SdpType::Answer {
            return Err(MeshError::order(&self.peer_id, "answer payload is not an answer"));
        }
        self.request_remote(answer);
        Ok(())
    }

    pub fn enqueue_remote_candidate(&mut self, candidate: IceCandidate) -> MeshResult<()> {
        if self.is_terminal() {
            return Err(MeshError::order(
                &self.peer_id,
                format!("candidate while {:?}", self.state),
            ));
        }
        if !self.remote_requested {
            self.pending_candidates.push_back(candidate);
            debug!(peer = %self.peer_id, buffered = self.pending_candidates.len(), "candidate buffered");
            return Ok(());
        }
        self.submit(Op::AddCandidate(candidate));
        Ok(())
    }

    /// An offerer whose offer has not been answered yet.
    pub fn awaits_answer(&self) -> bool {
        self.role == Role::Offerer && !self.remote_requested && !self.is_terminal()
    }

    /// Folds a finished negotiation step into the session. Returns what has to go on the
    /// wire now, in order. A failed step is `NegotiationFailed`; a rejected candidate only
    /// loses one path.
    pub fn on_step(&mut self, outcome: StepOutcome) -> MeshResult<Vec<SignalBody>> {
        if self.is_terminal() {
            return Ok(Vec::new());
        }
        match outcome {
            StepOutcome::LocalReady(desc) => {
                if self.local_sent {
                    return Ok(Vec::new());
                }
                self.local_sent = true;
                let mut out = Vec::with_capacity(1 + self.held_local.len());
                out.push(match desc.sdp_type {
                    SdpType::Offer => SignalBody::Offer(desc),
                    _ => SignalBody::Answer(desc),
                });
                out.extend(self.held_local.drain(..).map(SignalBody::IceCandidate));
                Ok(out)
            }
            StepOutcome::RemoteApplied => {
                self.has_remote_description = true;
                Ok(Vec::new())
            }
            StepOutcome::CandidateApplied => {
                self.applied_candidates += 1;
                Ok(Vec::new())
            }
            StepOutcome::CandidateRejected(reason) => {
                warn!(peer = %self.peer_id, "{reason}");
                Ok(Vec::new())
            }
            StepOutcome::Failed(reason) => Err(MeshError::negotiation(&self.peer_id, reason)),
        }
    }

    /// Wraps a locally discovered candidate for the wire once the local description went
    /// out; earlier ones are held and released with it.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Option<SignalBody> {
        if self.is_terminal() {
            return None;
        }
        if !self.local_sent {
            self.held_local.push(candidate);
            return None;
        }
        Some(SignalBody::IceCandidate(candidate))
    }

    /// Records a remote track; returns the stream it belongs to, as updated.
    pub fn on_remote_track(&mut self, track: RemoteTrack) -> Option<RemoteStream> {
        if self.is_terminal() {
            return None;
        }
        let stream = self
            .remote_streams
            .entry(track.stream_id.clone())
            .or_insert_with(|| RemoteStream {
                stream_id: track.stream_id.clone(),
                tracks: Vec::new(),
            });
        stream.tracks.retain(|t| t.track_id != track.track_id);
        stream.tracks.push(track);
        Some(stream.clone())
    }

    /// Folds a transport state report into the session; returns the new state if it changed.
    pub fn on_transport_state(&mut self, st: TransportState) -> Option<ConnectionState> {
        let next = match (self.state, st) {
            (ConnectionState::Negotiating, TransportState::Connected) => ConnectionState::Connected,
            (
                ConnectionState::Negotiating | ConnectionState::Connected,
                TransportState::Failed | TransportState::Closed,
            ) => ConnectionState::Failed,
            _ => return None,
        };
        self.state = next;
        Some(next)
    }

    pub fn mark_failed(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Failed;
        }
    }

    /// Idempotent. Cancels in-flight negotiation, releases the transport and forgets
    /// attached and received tracks.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.ops = None;
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        let grace = self.step_timeout.min(CLOSE_GRACE);
        match tokio::time::timeout(grace, self.transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %self.peer_id, "transport close: {e:#}"),
            Err(_) => debug!(peer = %self.peer_id, "transport close timed out"),
        }
        self.pending_candidates.clear();
        self.held_local.clear();
        self.local_tracks.clear();
        self.remote_streams.clear();
        self.state = ConnectionState::Closed;
        info!(peer = %self.peer_id, epoch = self.epoch, "session closed");
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, ConnectionState::Failed | ConnectionState::Closed)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn applied_candidates(&self) -> usize {
        self.applied_candidates
    }

    pub fn local_tracks(&self) -> impl Iterator<Item = &str> {
        self.local_tracks.iter().map(String::as_str)
    }

    pub fn remote_streams(&self) -> impl Iterator<Item = &RemoteStream> {
        self.remote_streams.values()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.peer_id.clone(),
            role: self.role,
            state: self.state,
            has_remote_description: self.has_remote_description,
            pending_candidates: self.pending_candidates.len(),
            applied_candidates: self.applied_candidates,
            local_tracks: self.local_tracks.iter().cloned().collect(),
            remote_streams: self.remote_streams.keys().cloned().collect(),
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}
