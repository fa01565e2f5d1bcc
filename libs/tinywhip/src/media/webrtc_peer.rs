// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// webrtc-rs Media Transport
//
// RTCPeerConnection behind the `MediaTransport` trait. The connection is
// created on first use so ICE servers applied before negotiation (configured
// or fetched from the endpoint) end up in its configuration. Callbacks are
// forwarded as `MediaEvent`s on the channel returned by `WebRtcPeer::new`.

use super::{
    ConnectionState, IceConnectionState, IceGatheringState, MediaEvent, MediaTransport,
    OfferOptions,
};
use crate::config::IceServer;
use crate::error::{Result, WhipError};
use crate::sdp::{Candidate, IceComponent};
use std::sync::{Arc, Mutex};
use tokio::sync::{OnceCell, mpsc};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

const EVENT_CHANNEL_CAPACITY: usize = 256;

const H264_PAYLOAD_TYPE: u8 = 102;
const OPUS_PAYLOAD_TYPE: u8 = 111;
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

/// Which side of a WHIP/WHEP exchange the peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// WHIP: outbound tracks only.
    Publish,
    /// WHEP: one recvonly video and one recvonly audio transceiver.
    Play,
}

/// Outbound RTP track. Write packets through [`LocalTrack::rtp`].
#[derive(Clone)]
pub struct LocalTrack(Arc<TrackLocalStaticRTP>);

impl LocalTrack {
    /// H.264 video track (90 kHz).
    pub fn h264(stream_id: &str) -> Self {
        Self(Arc::new(TrackLocalStaticRTP::new(
            h264_capability(),
            "video".to_owned(),
            stream_id.to_owned(),
        )))
    }

    /// Opus audio track (48 kHz stereo).
    pub fn opus(stream_id: &str) -> Self {
        Self(Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            "audio".to_owned(),
            stream_id.to_owned(),
        )))
    }

    pub fn rtp(&self) -> &Arc<TrackLocalStaticRTP> {
        &self.0
    }
}

fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_owned(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: H264_FMTP.to_owned(),
        rtcp_feedback: vec![],
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: OPUS_FMTP.to_owned(),
        rtcp_feedback: vec![],
    }
}

fn engine_error(context: &str, e: impl std::fmt::Display) -> WhipError {
    WhipError::TransportFailure(format!("{}: {}", context, e))
}

pub struct WebRtcPeer {
    role: PeerRole,
    ice_servers: Mutex<Vec<IceServer>>,
    peer_connection: OnceCell<Arc<RTCPeerConnection>>,
    events: mpsc::Sender<MediaEvent>,
}

impl WebRtcPeer {
    pub fn new(role: PeerRole) -> (Self, mpsc::Receiver<MediaEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let peer = Self {
            role,
            ice_servers: Mutex::new(Vec::new()),
            peer_connection: OnceCell::new(),
            events,
        };
        (peer, events_rx)
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    async fn peer(&self) -> Result<&Arc<RTCPeerConnection>> {
        self.peer_connection
            .get_or_try_init(|| self.build_peer())
            .await
    }

    async fn build_peer(&self) -> Result<Arc<RTCPeerConnection>> {
        tracing::debug!("[WebRtcPeer] Creating MediaEngine and registering codecs...");

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: h264_capability(),
                    payload_type: H264_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| engine_error("Failed to register H.264 codec", e))?;
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: OPUS_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| engine_error("Failed to register Opus codec", e))?;

        let mut registry = webrtc::interceptor::registry::Registry::new();
        registry = webrtc::api::interceptor_registry::register_default_interceptors(
            registry,
            &mut media_engine,
        )
        .map_err(|e| engine_error("Failed to register interceptors", e))?;

        let api = webrtc::api::APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .ice_servers
            .lock()
            .map(|servers| servers.iter().map(to_rtc_ice_server).collect())
            .unwrap_or_default();
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| engine_error("Failed to create PeerConnection", e))?,
        );
        self.forward_events(&peer_connection);

        if self.role == PeerRole::Play {
            for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
                peer_connection
                    .add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                    .map_err(|e| engine_error("Failed to add recvonly transceiver", e))?;
            }
        }

        tracing::info!("[WebRtcPeer] RTCPeerConnection created ({:?})", self.role);
        Ok(peer_connection)
    }

    fn forward_events(&self, peer_connection: &Arc<RTCPeerConnection>) {
        let events = self.events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let event = match candidate {
                    Some(candidate) => MediaEvent::LocalCandidate(to_candidate(&candidate)),
                    None => {
                        tracing::debug!("[WebRtcPeer] ICE candidate gathering complete");
                        MediaEvent::EndOfCandidates
                    }
                };
                let _ = events.send(event).await;
            })
        }));

        let events = self.events.clone();
        peer_connection.on_ice_gathering_state_change(Box::new(
            move |state: RTCIceGathererState| {
                let events = events.clone();
                Box::pin(async move {
                    tracing::debug!("[WebRtcPeer] ICE gathering state: {:?}", state);
                    let state = match state {
                        RTCIceGathererState::Gathering => IceGatheringState::Gathering,
                        RTCIceGathererState::Complete => IceGatheringState::Complete,
                        _ => IceGatheringState::New,
                    };
                    let _ = events
                        .send(MediaEvent::IceGatheringStateChanged(state))
                        .await;
                })
            },
        ));

        let events = self.events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    tracing::info!("[WebRtcPeer] Peer connection state: {:?}", state);
                    let _ = events
                        .send(MediaEvent::ConnectionStateChanged(connection_state(state)))
                        .await;
                })
            },
        ));

        let events = self.events.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    tracing::info!("[WebRtcPeer] ICE connection state: {:?}", state);
                    let _ = events
                        .send(MediaEvent::IceConnectionStateChanged(
                            ice_connection_state(state),
                        ))
                        .await;
                })
            },
        ));
    }
}

impl MediaTransport for WebRtcPeer {
    type Track = LocalTrack;

    async fn apply_ice_servers(&self, servers: &[IceServer]) -> Result<()> {
        if self.peer_connection.initialized() {
            tracing::warn!(
                "[WebRtcPeer] PeerConnection already created, ignoring {} ICE server(s)",
                servers.len()
            );
            return Ok(());
        }

        let mut current = self
            .ice_servers
            .lock()
            .map_err(|_| WhipError::TransportFailure("ICE server list poisoned".into()))?;
        *current = servers.to_vec();
        Ok(())
    }

    async fn add_track(&self, track: LocalTrack) -> Result<()> {
        let peer_connection = self.peer().await?;
        peer_connection
            .add_track(Arc::clone(&track.0) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| engine_error("Failed to add track", e))?;
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<String> {
        let peer_connection = self.peer().await?;

        if options.send_only {
            for transceiver in peer_connection.get_transceivers().await {
                if transceiver.sender().await.track().await.is_some() {
                    transceiver
                        .set_direction(RTCRtpTransceiverDirection::Sendonly)
                        .await;
                }
            }
        }

        let offer = peer_connection
            .create_offer(None)
            .await
            .map_err(|e| engine_error("Failed to create offer", e))?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_owned())
            .map_err(|e| engine_error("Invalid local offer", e))?;
        self.peer()
            .await?
            .set_local_description(offer)
            .await
            .map_err(|e| engine_error("Failed to set local description", e))
    }

    async fn local_description(&self) -> Option<String> {
        let peer_connection = self.peer_connection.get()?;
        peer_connection.local_description().await.map(|d| d.sdp)
    }

    async fn set_remote_description(&self, answer_sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_owned())
            .map_err(|e| engine_error("Failed to parse SDP answer", e))?;
        self.peer()
            .await?
            .set_remote_description(answer)
            .await
            .map_err(|e| engine_error("Failed to set remote description", e))
    }

    async fn stop_senders(&self) {
        let Some(peer_connection) = self.peer_connection.get() else {
            return;
        };
        for sender in peer_connection.get_senders().await {
            if let Err(e) = sender.stop().await {
                tracing::warn!("[WebRtcPeer] Failed to stop sender: {}", e);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        match self.peer_connection.get() {
            Some(peer_connection) => peer_connection
                .close()
                .await
                .map_err(|e| engine_error("Failed to close PeerConnection", e)),
            None => Ok(()),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.peer_connection
            .get()
            .map(|pc| connection_state(pc.connection_state()))
            .unwrap_or_default()
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;

        match self.peer_connection.get().map(|pc| pc.ice_gathering_state()) {
            Some(RTCIceGatheringState::Gathering) => IceGatheringState::Gathering,
            Some(RTCIceGatheringState::Complete) => IceGatheringState::Complete,
            _ => IceGatheringState::New,
        }
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_candidate(candidate: &RTCIceCandidate) -> Candidate {
    let related = (!candidate.related_address.is_empty())
        .then(|| (candidate.related_address.clone(), candidate.related_port));

    Candidate {
        foundation: candidate.foundation.clone(),
        component: if candidate.component == 1 {
            IceComponent::Rtp
        } else {
            IceComponent::Rtcp
        },
        transport: candidate.protocol.to_string(),
        priority: candidate.priority,
        address: candidate.address.clone(),
        port: candidate.port,
        typ: candidate.typ.to_string(),
        related_address: related.as_ref().map(|(addr, _)| addr.clone()),
        related_port: related.map(|(_, port)| port),
        tcp_type: (!candidate.tcp_type.is_empty()).then(|| candidate.tcp_type.clone()),
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn ice_connection_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}
