/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use meshroom_core::config::MeshConfig;
use meshroom_core::error::MeshResult;
use meshroom_core::lifecycle::RoomCoordinator;
use meshroom_core::media::{LocalStream, MediaConstraints, MediaSource, SyntheticMediaSource, TrackKind};
use meshroom_core::metrics::MeshMetrics;
use meshroom_core::relay_client::RelayClient;
use meshroom_core::webrtc_transport::WebrtcTransportFactory;
use meshroom_core::ws_channel::WsSignalConnector;
use tracing::{info, warn};
use webrtc::media::Sample;

/// Remembers the stream it handed out so `main` can feed it.
struct CapturingSource {
    inner: SyntheticMediaSource,
    last: Mutex<Option<LocalStream>>,
}

#[async_trait]
impl MediaSource for CapturingSource {
    async fn acquire(&self, constraints: MediaConstraints) -> MeshResult<LocalStream> {
        let stream = self.inner.acquire(constraints).await?;
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream.clone());
        Ok(stream)
    }
}

// Opus comfort-noise frame.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];

fn spawn_audio_feed(stream: LocalStream) {
    let Some(track) = stream.tracks_of(TrackKind::Audio).next().cloned() else {
        return;
    };
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(20));
        while !track.is_stopped() {
            tick.tick().await;
            let sample = Sample {
                data: Bytes::from_static(OPUS_SILENCE),
                duration: Duration::from_millis(20),
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                warn!("audio feed: {e:#}");
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let relay_http =
        std::env::var("MESHROOM_RELAY_HTTP").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
    let relay_ws =
        std::env::var("MESHROOM_RELAY_WS").unwrap_or_else(|_| "ws://127.0.0.1:8080".to_string());
    let name = std::env::var("MESHROOM_NAME").unwrap_or_else(|_| "dev-peer".to_string());
    let room = std::env::var("MESHROOM_ROOM").ok().filter(|s| !s.trim().is_empty());

    let relay = RelayClient::new(&relay_http)?;
    let me = relay.register(&name).await?;
    let room_id = match room {
        Some(r) => r,
        None => relay.create_room(&me.user_id, &name).await?.room_id,
    };
    let members = relay.list_members(&room_id).await?;
    info!(room = %room_id, ?members, "joining");

    let mut cfg = MeshConfig::new(&me.user_id);
    cfg.display_name = Some(name.clone());
    let metrics = Arc::new(MeshMetrics::new());
    let source = Arc::new(CapturingSource {
        inner: SyntheticMediaSource::new(),
        last: Mutex::new(None),
    });
    let mut coordinator = RoomCoordinator::new(
        cfg.clone(),
        source.clone(),
        Arc::new(WsSignalConnector::new(&relay_ws, &cfg.display_name(), metrics.clone())),
        Arc::new(WebrtcTransportFactory::new(&cfg)?),
        metrics,
    );

    let mut events = coordinator.subscribe();
    let handle = coordinator.start(&room_id).await?;
    if let Some(stream) = source.last.lock().unwrap_or_else(|e| e.into_inner()).take() {
        spawn_audio_feed(stream);
    }

    let mut stats = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = events.recv() => match ev {
                Ok(ev) => info!(event = %serde_json::to_string(&ev).unwrap_or_default(), "room event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => warn!(n, "room events lagged"),
                Err(_) => break,
            },
            _ = stats.tick() => info!(metrics = %handle.metrics(), "stats"),
        }
    }

    coordinator.stop().await;
    info!(room = %room_id, "bye");
    Ok(())
}
