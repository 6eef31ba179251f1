/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use meshroom_protocol::SignalEnvelope;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

use crate::channel::{SignalChannel, SignalConnector};
use crate::error::{MeshError, MeshResult};
use crate::metrics::MeshMetrics;

const CHANNEL_QUEUE: usize = 256;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Signaling over the relay's `/join-room` websocket.
#[derive(Clone)]
pub struct WsSignalConnector {
    relay_ws: String,
    display_name: String,
    metrics: Arc<MeshMetrics>,
}

impl WsSignalConnector {
    pub fn new(relay_ws: &str, display_name: &str, metrics: Arc<MeshMetrics>) -> Self {
        Self {
            relay_ws: relay_ws.trim_end_matches('/').to_string(),
            display_name: display_name.to_string(),
            metrics,
        }
    }

    pub fn join_url(&self, room_id: &str, self_id: &str) -> String {
        format!(
            "{}/join-room/{}?userID={}&name={}",
            self.relay_ws,
            urlencoding::encode(room_id),
            urlencoding::encode(self_id),
            urlencoding::encode(&self.display_name)
        )
    }
}

#[async_trait]
impl SignalConnector for WsSignalConnector {
    async fn open(&self, room_id: &str, self_id: &str) -> MeshResult<SignalChannel> {
        let url = self.join_url(room_id, self_id);
        info!(room = %room_id, %url, "connecting signaling channel");

        let (ws, _) = match tokio_tungstenite::connect_async(url).await {
            Ok(v) => v,
            Err(e) => {
                self.metrics.set_signal_error(e.to_string());
                return Err(MeshError::ChannelUnavailable(e.to_string()));
            }
        };
        let (mut ws_tx, mut ws_rx) = ws.split();
        self.metrics.set_signal_connected(true);

        let (in_tx, in_rx) = mpsc::channel::<SignalEnvelope>(CHANNEL_QUEUE);
        let (out_tx, mut out_rx) = mpsc::channel::<SignalEnvelope>(CHANNEL_QUEUE);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let metrics = self.metrics.clone();
        let room = room_id.to_string();

        let pump = tokio::spawn(async move {
            let mut ping = tokio::time::interval(std::time::Duration::from_secs(5));
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        // Flush whatever the room queued before it asked us to stop.
                        while let Ok(env) = out_rx.try_recv() {
                            let Ok(json) = serde_json::to_string(&env) else { continue };
                            metrics.signal_tx_add(json.len() as u64);
                            if ws_tx.send(tungstenite::Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        let _ = ws_tx.send(tungstenite::Message::Close(None)).await;
                        break;
                    }
                    _ = ping.tick() => {
                        let payload = now_ms().to_be_bytes().to_vec();
                        if let Err(e) = ws_tx.send(tungstenite::Message::Ping(payload)).await {
                            metrics.set_signal_error(e.to_string());
                            break;
                        }
                    }
                    out = out_rx.recv() => {
                        let Some(env) = out else { break };
                        let json = match serde_json::to_string(&env) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(room = %room, "encode envelope: {e}");
                                continue;
                            }
                        };
                        metrics.signal_tx_add(json.len() as u64);
                        if let Err(e) = ws_tx.send(tungstenite::Message::Text(json)).await {
                            metrics.set_signal_error(e.to_string());
                            break;
                        }
                    }
                    msg = ws_rx.next() => {
                        let Some(msg) = msg else { break };
                        let msg = match msg {
                            Ok(v) => v,
                            Err(e) => {
                                metrics.set_signal_error(e.to_string());
                                break;
                            }
                        };
                        let text = match msg {
                            tungstenite::Message::Text(t) => t,
                            tungstenite::Message::Pong(p) => {
                                if p.len() == 8 {
                                    let mut a = [0u8; 8];
                                    a.copy_from_slice(&p);
                                    let sent_ms = u64::from_be_bytes(a);
                                    metrics.signal_rtt_update(now_ms().saturating_sub(sent_ms));
                                }
                                continue;
                            }
                            tungstenite::Message::Ping(p) => {
                                let _ = ws_tx.send(tungstenite::Message::Pong(p)).await;
                                continue;
                            }
                            tungstenite::Message::Close(_) => break,
                            _ => continue,
                        };
                        metrics.signal_rx_add(text.len() as u64);
                        let env: SignalEnvelope = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(room = %room, "bad signal json: {e}");
                                continue;
                            }
                        };
                        if in_tx.send(env).await.is_err() {
                            break;
                        }
                    }
                }
            }

            metrics.set_signal_connected(false);
            debug!(room = %room, "signaling channel pump stopped");
        });

        Ok(SignalChannel::new(out_tx, in_rx, close_tx, pump))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_encodes_query() {
        let c = WsSignalConnector::new(
            "ws://relay.local:8080/",
            "Ann Lee",
            Arc::new(MeshMetrics::new()),
        );
        assert_eq!(
            c.join_url("r 1", "abc123"),
            "ws://relay.local:8080/join-room/r%201?userID=abc123&name=Ann%20Lee"
        );
    }

    #[tokio::test]
    async fn unreachable_relay_is_channel_unavailable() {
        let metrics = Arc::new(MeshMetrics::new());
        let c = WsSignalConnector::new("ws://127.0.0.1:1", "ann", metrics.clone());
        let err = c.open("r1", "abc123").await.err().unwrap();
        assert!(matches!(err, MeshError::ChannelUnavailable(_)));
        assert!(!metrics.snapshot_json()["signal"]["last_error"].is_null());
    }
}
