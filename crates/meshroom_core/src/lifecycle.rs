/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Room lifecycle: start (media, channel, presence) and teardown as one scoped sequence,
//! plus the single task that owns all per-room state while the room runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::{SignalChannel, SignalConnector};
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::media::{LocalMediaController, MediaConstraints, MediaSource};
use crate::metrics::MeshMetrics;
use crate::registry::SessionRegistry;
use crate::room_events::{RoomEvent, RoomEventKind, RoomEvents};
use crate::router::{RoomSnapshot, SignalRouter};
use crate::transport::{TransportEvent, TransportFactory};

const TRANSPORT_QUEUE: usize = 1024;
const COMMAND_QUEUE: usize = 64;

enum RoomCommand {
    ToggleAudio(oneshot::Sender<bool>),
    ToggleVideo(oneshot::Sender<bool>),
    ConnectTo(String, oneshot::Sender<MeshResult<()>>),
    Snapshot(oneshot::Sender<RoomSnapshot>),
}

/// Cheap handle to a running room. Every call fails with `MeshError::Stopped` once the
/// room is gone.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    self_id: String,
    tx: mpsc::Sender<RoomCommand>,
    events: RoomEvents,
    metrics: Arc<MeshMetrics>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> MeshResult<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(cmd(tx)).await.map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Returns the new audio flag.
    pub async fn toggle_audio(&self) -> MeshResult<bool> {
        self.request(RoomCommand::ToggleAudio).await
    }

    pub async fn toggle_video(&self) -> MeshResult<bool> {
        self.request(RoomCommand::ToggleVideo).await
    }

    pub async fn connect_to(&self, peer_id: &str) -> MeshResult<()> {
        let peer = peer_id.to_string();
        self.request(|tx| RoomCommand::ConnectTo(peer, tx)).await?
    }

    pub async fn snapshot(&self) -> MeshResult<RoomSnapshot> {
        self.request(RoomCommand::Snapshot).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> serde_json::Value {
        self.metrics.snapshot_json()
    }
}

struct RunningRoom {
    handle: RoomHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct RoomCoordinator {
    cfg: MeshConfig,
    media_source: Arc<dyn MediaSource>,
    connector: Arc<dyn SignalConnector>,
    factory: Arc<dyn TransportFactory>,
    metrics: Arc<MeshMetrics>,
    events: RoomEvents,
    running: Option<RunningRoom>,
}

impl RoomCoordinator {
    pub fn new(
        cfg: MeshConfig,
        media_source: Arc<dyn MediaSource>,
        connector: Arc<dyn SignalConnector>,
        factory: Arc<dyn TransportFactory>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        let events = RoomEvents::new(cfg.event_capacity());
        Self {
            cfg,
            media_source,
            connector,
            factory,
            metrics,
            events,
            running: None,
        }
    }

    /// Events of whichever room this coordinator runs, across restarts.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub fn handle(&self) -> Option<RoomHandle> {
        self.running.as_ref().map(|r| r.handle.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Acquires local media, joins the room's signaling channel and announces presence.
    /// A room already running is stopped first. On failure nothing stays acquired.
    pub async fn start(&mut self, room_id: &str) -> MeshResult<RoomHandle> {
        if self.running.is_some() {
            self.stop().await;
        }
        let self_id = self.cfg.self_id.clone();

        let stream = self
            .media_source
            .acquire(MediaConstraints {
                audio: self.cfg.wants_audio(),
                video: self.cfg.wants_video(),
            })
            .await?;
        let mut media = LocalMediaController::new(Some(stream));

        let channel = match self.connector.open(room_id, &self_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(room = %room_id, "signaling channel unavailable: {e}");
                media.release();
                return Err(e);
            }
        };

        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_QUEUE);
        let registry =
            SessionRegistry::new(self.factory.clone(), transport_tx, self.cfg.negotiate_timeout());
        let router = SignalRouter::new(
            room_id,
            &self_id,
            registry,
            media,
            channel.sender(),
            self.events.clone(),
            self.metrics.clone(),
        );
        router.announce().await;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_room(
            router,
            channel,
            transport_rx,
            cmd_rx,
            shutdown_rx,
            self.events.clone(),
            self.metrics.clone(),
        ));

        let handle = RoomHandle {
            room_id: room_id.to_string(),
            self_id,
            tx: cmd_tx,
            events: self.events.clone(),
            metrics: self.metrics.clone(),
        };
        self.running = Some(RunningRoom {
            handle: handle.clone(),
            shutdown: shutdown_tx,
            task,
        });
        info!(room = %room_id, "room started");
        Ok(handle)
    }

    /// Stops local tracks, closes every session, then closes the channel. No-op when
    /// nothing is running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        // Teardown is bounded by per-step timeouts; this only guards a wedged transport.
        let grace = self.cfg.negotiate_timeout() + Duration::from_secs(5);
        let mut task = running.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(room = %running.handle.room_id, "room task ended abnormally: {e}"),
            Err(_) => {
                warn!(room = %running.handle.room_id, "room teardown timed out, aborting");
                task.abort();
            }
        }
        info!(room = %running.handle.room_id, "room stopped");
    }
}

impl Drop for RoomCoordinator {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
        }
    }
}

async fn run_room(
    mut router: SignalRouter,
    mut channel: SignalChannel,
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    mut cmd_rx: mpsc::Receiver<RoomCommand>,
    mut shutdown: watch::Receiver<bool>,
    events: RoomEvents,
    metrics: Arc<MeshMetrics>,
) {
    let mut channel_open = true;
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    RoomCommand::ToggleAudio(reply) => {
                        let _ = reply.send(router.toggle_audio());
                    }
                    RoomCommand::ToggleVideo(reply) => {
                        let _ = reply.send(router.toggle_video());
                    }
                    RoomCommand::ConnectTo(peer, reply) => {
                        let _ = reply.send(router.connect_to(&peer).await);
                    }
                    RoomCommand::Snapshot(reply) => {
                        let _ = reply.send(router.snapshot());
                    }
                }
            }
            env = channel.recv(), if channel_open => {
                match env {
                    Some(env) => {
                        let _ = router.handle_inbound(env).await;
                    }
                    None => {
                        channel_open = false;
                        warn!("signaling channel closed; existing sessions kept");
                        metrics.set_signal_error("channel closed".to_string());
                        events.publish(RoomEventKind::ChannelClosed);
                    }
                }
            }
            ev = transport_rx.recv() => {
                let Some(ev) = ev else { break };
                router.handle_transport_event(ev).await;
            }
        }
    }

    router.shutdown().await;
    channel.close().await;
}
