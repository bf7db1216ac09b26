//! Media Module - Verbindungsaufbau als opake Fähigkeit
//!
//! Dieses Modul verwaltet:
//! - den Vertrag zwischen Call-Controllern und Medienschicht
//! - das WebRTC-Backend (Peer Connections, Audio-Spur, ICE)
//! - die ICE-Server-Konfiguration

mod backend;
mod webrtc;

pub use backend::{
    default_ice_servers, IceServer, LinkEvent, LocalMedia, MediaBackend, MediaError, PeerLink,
};
pub use self::webrtc::{WebRtcBackend, WebRtcMedia, SAMPLE_RATE};
