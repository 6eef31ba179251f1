/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Signaling channel seam: a room-scoped, ordered, bidirectional envelope pipe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use meshroom_protocol::{Recipient, SignalBody, SignalEnvelope};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};

const CHANNEL_QUEUE: usize = 256;

#[async_trait]
pub trait SignalConnector: Send + Sync {
    /// Joins `room_id` as `self_id`. Fails with `MeshError::ChannelUnavailable`.
    async fn open(&self, room_id: &str, self_id: &str) -> MeshResult<SignalChannel>;
}

/// An open signaling channel. Inbound envelopes arrive in order; `recv` yields `None`
/// once the underlying connection is gone.
pub struct SignalChannel {
    outbound: mpsc::Sender<SignalEnvelope>,
    inbound: mpsc::Receiver<SignalEnvelope>,
    closer: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl SignalChannel {
    pub fn new(
        outbound: mpsc::Sender<SignalEnvelope>,
        inbound: mpsc::Receiver<SignalEnvelope>,
        closer: oneshot::Sender<()>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            closer: Some(closer),
            pump: Some(pump),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<SignalEnvelope> {
        self.outbound.clone()
    }

    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.inbound.recv().await
    }

    /// Idempotent. Stops the pump and waits briefly for it to flush and exit.
    pub async fn close(&mut self) {
        if let Some(tx) = self.closer.take() {
            let _ = tx.send(());
        }
        self.inbound.close();
        if let Some(pump) = self.pump.take() {
            if tokio::time::timeout(Duration::from_secs(2), pump).await.is_err() {
                debug!("signal pump did not stop in time");
            }
        }
    }
}

impl Drop for SignalChannel {
    fn drop(&mut self) {
        if let Some(tx) = self.closer.take() {
            let _ = tx.send(());
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Member {
    conn_id: u64,
    tx: mpsc::Sender<SignalEnvelope>,
}

#[derive(Default)]
struct Hub {
    rooms: HashMap<String, HashMap<String, Member>>,
}

impl Hub {
    fn deliver(&self, env: &SignalEnvelope) {
        let Some(members) = self.rooms.get(&env.room_id) else {
            return;
        };
        for (id, m) in members {
            if *id == env.from || !env.to.is_for(id) {
                continue;
            }
            if m.tx.try_send(env.clone()).is_err() {
                warn!(room = %env.room_id, to = %id, kind = env.kind(), "member queue full, envelope dropped");
            }
        }
    }

    fn leave(&mut self, room_id: &str, user_id: &str, conn_id: u64) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if members.get(user_id).map(|m| m.conn_id) != Some(conn_id) {
            return false;
        }
        members.remove(user_id);
        if members.is_empty() {
            self.rooms.remove(room_id);
        }
        true
    }
}

/// In-process relay: routes envelopes between channels opened on the same connector the
/// way the relay service does (sender id stamped, `all` fans out to everyone else, leave
/// announced when a member goes away).
#[derive(Clone, Default)]
pub struct MemorySignalConnector {
    hub: Arc<Mutex<Hub>>,
    next_conn: Arc<AtomicU64>,
    offline: Arc<AtomicBool>,
}

impl MemorySignalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline, `open` fails with `ChannelUnavailable`.
    pub fn set_offline(&self, v: bool) {
        self.offline.store(v, Ordering::Relaxed);
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        let hub = lock(&self.hub);
        let mut ids: Vec<String> = hub
            .rooms
            .get(room_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Drops `user_id`'s connection as if the network went away.
    pub fn disconnect(&self, room_id: &str, user_id: &str) {
        let mut hub = lock(&self.hub);
        let conn = hub
            .rooms
            .get(room_id)
            .and_then(|m| m.get(user_id))
            .map(|m| m.conn_id);
        if let Some(conn_id) = conn {
            hub.leave(room_id, user_id, conn_id);
            hub.deliver(&SignalEnvelope::new(room_id, user_id, Recipient::All, SignalBody::Leave));
            info!(room = %room_id, user = %user_id, "memory channel disconnected");
        }
    }
}

#[async_trait]
impl SignalConnector for MemorySignalConnector {
    async fn open(&self, room_id: &str, self_id: &str) -> MeshResult<SignalChannel> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(MeshError::ChannelUnavailable("memory relay offline".to_string()));
        }
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_QUEUE);
        let (out_tx, mut out_rx) = mpsc::channel::<SignalEnvelope>(CHANNEL_QUEUE);
        let (close_tx, mut close_rx) = oneshot::channel();
        lock(&self.hub)
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(self_id.to_string(), Member { conn_id, tx: in_tx });

        let hub = self.hub.clone();
        let room = room_id.to_string();
        let me = self_id.to_string();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => break,
                    out = out_rx.recv() => {
                        let Some(mut env) = out else { break };
                        env.from = me.clone();
                        env.room_id = room.clone();
                        lock(&hub).deliver(&env);
                    }
                }
            }
            let mut hub = lock(&hub);
            if hub.leave(&room, &me, conn_id) {
                hub.deliver(&SignalEnvelope::new(&room, &me, Recipient::All, SignalBody::Leave));
            }
            debug!(room = %room, user = %me, "memory channel pump stopped");
        });
        Ok(SignalChannel::new(out_tx, in_rx, close_tx, pump))
    }
}
