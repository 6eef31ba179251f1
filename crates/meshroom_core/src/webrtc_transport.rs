/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use meshroom_protocol::{IceCandidate, SdpType, SessionDescription};
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use crate::config::MeshConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::transport::{
    PeerTransport, RemoteTrack, TransportEventKind, TransportEvents, TransportFactory,
    TransportState,
};

fn build_ice_servers(cfg: &MeshConfig) -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: cfg.ice_urls(),
        username: cfg.ice_username().unwrap_or_default(),
        credential: cfg.ice_credential().unwrap_or_default(),
        ..Default::default()
    }]
}

fn build_api() -> Result<API> {
    let mut media = MediaEngine::default();
    media
        .register_default_codecs()
        .context("register default codecs")?;
    let registry = register_default_interceptors(Registry::new(), &mut media)
        .context("register default interceptors")?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

/// One `RTCPeerConnection` per session, configured from the room's ICE settings.
pub struct WebrtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebrtcTransportFactory {
    pub fn new(cfg: &MeshConfig) -> Result<Self> {
        Ok(Self {
            api: build_api()?,
            ice_servers: build_ice_servers(cfg),
        })
    }
}

fn map_state(st: RTCPeerConnectionState) -> TransportState {
    match st {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

#[async_trait]
impl TransportFactory for WebrtcTransportFactory {
    async fn create(&self, events: TransportEvents) -> Result<Box<dyn PeerTransport>> {
        let pc = self
            .api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await
            .context("new peer connection")?;
        let pc = Arc::new(pc);

        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |cand| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(cand) = cand else { return };
                    match cand.to_json() {
                        Ok(init) => {
                            events
                                .emit(TransportEventKind::LocalCandidate(from_rtc_candidate(init)))
                                .await
                        }
                        Err(e) => debug!(peer = %events.peer_id(), "candidate to_json: {e}"),
                    }
                })
            }));
        }

        {
            let events = events.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    let remote = RemoteTrack {
                        track_id: track.id().to_string(),
                        stream_id: track.stream_id().to_string(),
                        kind,
                        media: Some(track),
                    };
                    events.emit(TransportEventKind::RemoteTrack(remote)).await;
                })
            }));
        }

        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    events
                        .emit(TransportEventKind::StateChanged(map_state(st)))
                        .await;
                })
            }));
        }

        info!(peer = %events.peer_id(), epoch = events.epoch(), "peer connection created");
        Ok(Box::new(WebrtcPeer { pc }))
    }
}

struct WebrtcPeer {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let out = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    out.context("parse session description")
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(anyhow!("unsupported description type {other}")),
    }
}

fn to_rtc_candidate(c: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

fn from_rtc_candidate(c: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

#[async_trait]
impl PeerTransport for WebrtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.context("create offer")?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.context("create answer")?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .context("set local description")
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .context("set remote description")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .context("add ice candidate")
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        let sender = self.pc.add_track(rtp).await.context("add track")?;
        // RTCP has to be drained for interceptors (NACK, reports) to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.context("close peer connection")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_fields_survive_conversion() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.2 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".into()),
        };
        assert_eq!(from_rtc_candidate(to_rtc_candidate(c.clone())), c);
    }

    #[test]
    fn ice_servers_follow_config() {
        let mut cfg = MeshConfig::new("abc123");
        cfg.ice_urls = Some(vec!["turn:turn.example:3478".into()]);
        cfg.ice_username = Some("u".into());
        let servers = build_ice_servers(&cfg);
        assert_eq!(servers[0].urls, vec!["turn:turn.example:3478".to_string()]);
        assert_eq!(servers[0].username, "u");
        assert_eq!(servers[0].credential, "");
    }

    #[test]
    fn peer_states_map_onto_transport_states() {
        assert_eq!(map_state(RTCPeerConnectionState::Connected), TransportState::Connected);
        assert_eq!(map_state(RTCPeerConnectionState::Failed), TransportState::Failed);
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), TransportState::New);
    }

    #[tokio::test]
    async fn offer_carries_local_tracks() {
        let factory = WebrtcTransportFactory::new(&MeshConfig::new("abc123")).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let t = factory
            .create(TransportEvents::new("bob", 1, tx))
            .await
            .unwrap();
        t.add_track(&LocalTrack::new(TrackKind::Audio, "s-audio", "s"))
            .await
            .unwrap();
        let offer = t.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        t.close().await.unwrap();
    }
}
