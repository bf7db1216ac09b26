//! Medien-Fähigkeit als austauschbarer Vertrag
//!
//! Die Call-Controller sehen Medien nur als opake Handles:
//! - `MediaBackend` beschafft lokale Medien und baut Verbindungs-Handles
//! - `PeerLink` verhandelt SDP, nimmt Candidates entgegen, meldet Events
//! - `LocalMedia` hält die lokalen Ressourcen bis zum Teardown
//!
//! Wie die Verbindung intern funktioniert (Transport, Codecs, Gathering)
//! ist Sache des Backends, siehe [`super::webrtc`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::signaling::{NetworkCandidate, SessionDescription};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("Camera/microphone access denied")]
    PermissionDenied,

    #[error("No camera/microphone found")]
    NoDevice,

    #[error("Camera/microphone already in use")]
    DeviceBusy,

    #[error("Media backend error: {0}")]
    Backend(String),
}

// ============================================================================
// LINK EVENTS
// ============================================================================

/// Events eines Verbindungs-Handles
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Lokal gefundener ICE-Candidate, gehört über das Relay zur Gegenseite
    IceCandidate(NetworkCandidate),

    /// Erste Medienspur der Gegenseite ist eingetroffen
    RemoteTrack { mime_type: String },

    /// Transport geschlossen oder fehlgeschlagen
    Closed,
}

// ============================================================================
// CAPABILITY TRAITS
// ============================================================================

/// Handle auf beschaffte lokale Medien (Mikrofon/Spur)
pub trait LocalMedia: Send + Sync {
    /// Gibt die gehaltenen Ressourcen frei; mehrfacher Aufruf ist erlaubt
    fn stop(&mut self);

    /// Zugriff des erzeugenden Backends auf den konkreten Typ
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Verbindungs-Handle für genau einen Anrufversuch
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Erstellt das SDP Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Erstellt das SDP Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    /// Wendet die Beschreibung der Gegenseite an
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    /// Reicht einen Candidate der Gegenseite an den Transport weiter
    async fn add_ice_candidate(&self, candidate: NetworkCandidate) -> Result<(), MediaError>;

    /// Event-Receiver dieses Handles
    ///
    /// Vor dem Start der Verhandlung abonnieren, sonst gehen frühe
    /// Candidates verloren.
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;

    /// Schließt den Transport (idempotent)
    async fn close(&self);
}

/// Fabrik für lokale Medien und Verbindungs-Handles
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Beschafft lokale Medien; scheitert mit Berechtigungs- oder Gerätefehlern
    async fn acquire_local_media(&self) -> Result<Box<dyn LocalMedia>, MediaError>;

    /// Baut ein frisches Verbindungs-Handle und hängt die lokalen Medien an
    async fn create_connection(
        &self,
        media: &dyn LocalMedia,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerLink>, MediaError>;
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN-Server für das ICE-Gathering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    /// STUN-Server ohne Credentials
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: String::new(),
            credential: String::new(),
        }
    }

    /// TURN-Server mit Credentials
    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: username.to_string(),
            credential: credential.to_string(),
        }
    }
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            username: String::new(),
            credential: String::new(),
        },
    ]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ice_servers_are_stun_only() {
        let servers = default_ice_servers();
        assert!(!servers.is_empty());
        for server in &servers {
            assert!(server.urls.iter().all(|u| u.starts_with("stun:")));
            assert!(server.username.is_empty());
        }
    }

    #[test]
    fn test_turn_server_carries_credentials() {
        let server = IceServer::turn("turn:turn.example.org:3478", "user", "secret");
        assert_eq!(server.urls, vec!["turn:turn.example.org:3478"]);
        assert_eq!(server.username, "user");
        assert_eq!(server.credential, "secret");
    }

    #[test]
    fn test_capability_objects_shared_with_send_futures() {
        // `create_connection` hält `&dyn LocalMedia` über await-Punkte
        fn assert_sync<T: Sync + ?Sized>() {}
        assert_sync::<dyn LocalMedia>();
        assert_sync::<dyn PeerLink>();
        assert_sync::<dyn MediaBackend>();
    }
}
