//! WebRTC-Backend für die Medien-Fähigkeit
//!
//! Setzt den Vertrag aus [`super::backend`] auf die `webrtc`-Crate um:
//! Peer Connection mit Standard-Codecs und -Interceptors, lokale
//! Audio-Spur (Opus), Candidate- und Track-Events als `LinkEvent`s.
//!
//! Hinweis: Das Einspeisen echter Mikrofon-Samples in die RTP-Spur ist
//! Sache der Einbettung; dieses Backend verwaltet Verhandlung und Transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::backend::{IceServer, LinkEvent, LocalMedia, MediaBackend, MediaError, PeerLink};
use crate::signaling::{NetworkCandidate, SdpKind, SessionDescription};

/// Abtastrate der Audio-Spur (Opus)
pub const SAMPLE_RATE: u32 = 48_000;

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Lokale Audio-Spur, die beim Verbindungsaufbau angehängt wird
pub struct WebRtcMedia {
    track: Arc<TrackLocalStaticRTP>,
    active: bool,
}

impl LocalMedia for WebRtcMedia {
    fn stop(&mut self) {
        if self.active {
            self.active = false;
            tracing::debug!("Released local audio track");
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl std::fmt::Debug for WebRtcMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcMedia")
            .field("active", &self.active)
            .finish()
    }
}

// ============================================================================
// PEER LINK
// ============================================================================

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    event_tx: broadcast::Sender<LinkEvent>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let remote = to_rtc_description(&description)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| MediaError::Backend(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: NetworkCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|e| MediaError::Backend(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// Medien-Backend über die `webrtc`-Crate
pub struct WebRtcBackend;

impl WebRtcBackend {
    pub fn new() -> Self {
        Self
    }

    /// Registriert die Event Handler der Peer Connection
    fn setup_peer_connection_handlers(
        pc: &Arc<RTCPeerConnection>,
        event_tx: &broadcast::Sender<LinkEvent>,
    ) {
        // Connection State Handler
        let event_tx_clone = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);

            match s {
                RTCPeerConnectionState::Disconnected
                | RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Closed => {
                    let _ = event_tx_clone.send(LinkEvent::Closed);
                }
                _ => {}
            }

            Box::pin(async {})
        }));

        // ICE Candidate Handler
        let event_tx_clone = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(init) = c.to_json() {
                    let _ = event_tx_clone.send(LinkEvent::IceCandidate(from_candidate_init(init)));
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (erste eingehende Spur der Gegenseite)
        let event_tx_clone = event_tx.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let event_tx = event_tx_clone.clone();
            Box::pin(async move {
                let mime_type = track.codec().capability.mime_type;
                tracing::info!("Received remote track: {}", mime_type);
                let _ = event_tx.send(LinkEvent::RemoteTrack { mime_type });
            })
        }));
    }
}

impl Default for WebRtcBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn acquire_local_media(&self) -> Result<Box<dyn LocalMedia>, MediaError> {
        // Audio-Spur mit Opus (48 kHz, mono)
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "klingel".to_string(),
        ));

        tracing::debug!("Acquired local audio track");
        Ok(Box::new(WebRtcMedia {
            track,
            active: true,
        }))
    }

    async fn create_connection(
        &self,
        media: &dyn LocalMedia,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerLink>, MediaError> {
        let media = media
            .as_any()
            .downcast_ref::<WebRtcMedia>()
            .ok_or_else(|| {
                MediaError::Backend("Local media handle does not belong to this backend".to_string())
            })?;

        // Media Engine mit Standard-Codecs konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        // API erstellen
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        // RTCConfiguration mit ICE Servern
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        // Peer Connection erstellen
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| MediaError::Backend(e.to_string()))?,
        );

        // Lokale Spur anhängen
        pc.add_track(Arc::clone(&media.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        // Event Handler registrieren
        let (event_tx, _) = broadcast::channel(100);
        Self::setup_peer_connection_handlers(&pc, &event_tx);

        Ok(Arc::new(WebRtcLink {
            pc,
            event_tx,
            closed: AtomicBool::new(false),
        }))
    }
}

impl std::fmt::Debug for WebRtcBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcBackend").finish()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    }
    .map_err(|e| MediaError::Backend(format!("Invalid SDP: {}", e)))
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

fn to_candidate_init(candidate: NetworkCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> NetworkCandidate {
    NetworkCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

// ============================================================================
// TESTS
// ============================================================================
