/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{MeshError, MeshResult};
use crate::session::PeerSession;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A captured local track. Clones share the same underlying track and flags, so every
/// session the track is attached to observes the same enabled state.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

struct LocalTrackInner {
    id: String,
    stream_id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, id: &str, stream_id: &str) -> Self {
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtp = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        );
        Self {
            inner: Arc::new(LocalTrackInner {
                id: id.to_string(),
                stream_id: stream_id.to_string(),
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                rtp: Arc::new(rtp),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, v: bool) {
        self.inner.enabled.store(v, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Relaxed)
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.rtp.clone()
    }

    /// Feed one encoded frame from the capture pipeline. Disabled or stopped tracks drop it;
    /// returns whether the sample went out.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.inner
            .rtp
            .write_sample(sample)
            .await
            .context("write sample")?;
        Ok(true)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: &str, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn stop(&self) {
        for t in &self.tracks {
            t.stop();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a capture stream. Fails with `MeshError::DeviceUnavailable`.
    async fn acquire(&self, constraints: MediaConstraints) -> MeshResult<LocalStream>;
}

/// Device-less source: hands out tracks that only carry what is written into them.
#[derive(Clone, Debug)]
pub struct SyntheticMediaSource {
    available: bool,
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self { available: true }
    }

    pub fn unavailable() -> Self {
        Self { available: false }
    }
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> MeshResult<LocalStream> {
        if !self.available {
            return Err(MeshError::DeviceUnavailable("no capture devices".to_string()));
        }
        if !constraints.audio && !constraints.video {
            return Err(MeshError::DeviceUnavailable(
                "neither audio nor video requested".to_string(),
            ));
        }
        let stream_id = format!("local-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, &format!("{stream_id}-audio"), &stream_id));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, &format!("{stream_id}-video"), &stream_id));
        }
        Ok(LocalStream::new(&stream_id, tracks))
    }
}

fn random_id() -> String {
    let mut b = [0u8; 8];
    use rand::RngCore as _;
    rand::rngs::OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LocalMediaState {
    pub has_stream: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

/// Owns the local capture stream for the room's lifetime and is the only writer of the
/// tracks' enabled flags.
pub struct LocalMediaController {
    stream: Option<LocalStream>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl LocalMediaController {
    /// Flags start from the tracks actually captured; a kind with no track reads disabled.
    pub fn new(stream: Option<LocalStream>) -> Self {
        let enabled = |kind: TrackKind| {
            stream
                .as_ref()
                .is_some_and(|s| s.tracks_of(kind).any(|t| t.is_enabled()))
        };
        let audio_enabled = enabled(TrackKind::Audio);
        let video_enabled = enabled(TrackKind::Video);
        Self {
            stream,
            audio_enabled,
            video_enabled,
        }
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        self.stream.as_ref().map(|s| s.tracks()).unwrap_or(&[])
    }

    pub fn state(&self) -> LocalMediaState {
        LocalMediaState {
            has_stream: self.stream.is_some(),
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
        }
    }

    fn has_kind(&self, kind: TrackKind) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|s| s.tracks_of(kind).next().is_some())
    }

    /// Returns the new audio flag. Without an audio track nothing changes.
    pub fn toggle_audio(&mut self) -> bool {
        if self.has_kind(TrackKind::Audio) {
            self.audio_enabled = !self.audio_enabled;
            self.apply(TrackKind::Audio, self.audio_enabled);
        }
        self.audio_enabled
    }

    pub fn toggle_video(&mut self) -> bool {
        if self.has_kind(TrackKind::Video) {
            self.video_enabled = !self.video_enabled;
            self.apply(TrackKind::Video, self.video_enabled);
        }
        self.video_enabled
    }

    fn apply(&self, kind: TrackKind, enabled: bool) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        for t in stream.tracks_of(kind) {
            t.set_enabled(enabled);
            debug!(track = %t.id(), ?kind, enabled, "local track flag");
        }
    }

    /// Adds every present local track to the session, disabled ones included.
    pub fn attach_to(&self, session: &mut PeerSession) {
        session.attach_tracks(self.tracks());
    }

    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            info!(stream = %stream.id(), "local media released");
        }
    }
}
