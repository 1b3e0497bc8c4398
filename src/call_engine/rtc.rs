//! WebRTC Transport
//!
//! [`MediaTransport`]-Implementierung auf Basis von webrtc-rs.

use super::media::{CHANNELS, SAMPLE_RATE};
use super::transport::{
    ConnectionState, MediaTransport, SignalingState, TrackKind, TransportError,
    TransportEventSink, TransportFactory,
};
use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "callcore";

fn webrtc_err(e: webrtc::Error) -> TransportError {
    TransportError::WebRTC(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Baut Peer Connections mit den konfigurierten ICE Servern
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();

        Self { ice_servers }
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(pc: &RTCPeerConnection, events: TransportEventSink) {
        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);

            let state = match s {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                    ConnectionState::New
                }
                RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                RTCPeerConnectionState::Connected => ConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => ConnectionState::Failed,
                RTCPeerConnectionState::Closed => ConnectionState::Closed,
            };
            state_events.connection_state(state);

            Box::pin(async {})
        }));

        pc.on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
            tracing::debug!("Signaling state: {:?}", s);
            Box::pin(async {})
        }));

        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => events.local_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Remote-Medien werden nur protokolliert, Rendering liegt beim Host
        pc.on_track(Box::new(move |track, _, _| {
            Box::pin(async move {
                tracing::info!("Received remote track: {:?}", track.codec());
            })
        }));
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        tracks: &[TrackKind],
        events: TransportEventSink,
    ) -> Result<Box<dyn MediaTransport>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let generation = events.generation();
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        Self::setup_handlers(&pc, events);

        for kind in tracks {
            let codec = match kind {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: SAMPLE_RATE,
                    channels: CHANNELS,
                    ..Default::default()
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
            };
            let id = match kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };

            let track = Arc::new(TrackLocalStaticRTP::new(
                codec,
                id.to_string(),
                STREAM_ID.to_string(),
            ));
            pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_err)?;
        }

        tracing::info!(
            "Created peer connection (generation {}, {} track(s))",
            generation,
            tracks.len()
        );

        Ok(Box::new(RtcTransport { pc }))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Eine webrtc-rs Peer Connection
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        let result = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        result.map_err(|e| TransportError::InvalidSdp(e.to_string()))
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed | RTCSignalingState::Unspecified => SignalingState::Closed,
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(webrtc_err)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(webrtc_err)
    }
}

impl std::fmt::Debug for RtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcTransport")
            .field("signaling_state", &self.pc.signaling_state())
            .field("connection_state", &self.pc.connection_state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
