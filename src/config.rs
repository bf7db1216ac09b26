//! Konfiguration für Relay-Anbindung und Anrufverhalten

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::media::{default_ice_servers, IceServer};

/// Default Relay URL (kann über Umgebungsvariable überschrieben werden)
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8000/api";

/// Umgebungsvariable für die Relay-Basis-URL
pub const RELAY_URL_ENV: &str = "KLINGEL_RELAY_URL";

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid relay URL '{value}': {detail}")]
    InvalidUrl { value: String, detail: String },
}

// ============================================================================
// RELAY CONFIG
// ============================================================================

/// Anbindung an das Signaling-Relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Basis-URL, unter der die Signaling-Routen liegen
    pub base_url: Url,
    /// Timeout für einzelne HTTP-Requests
    pub request_timeout: Duration,
}

impl RelayConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let base_url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
            value: value.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self::new(base_url))
    }

    /// Liest die Relay-URL aus `KLINGEL_RELAY_URL` oder nimmt den Default
    pub fn from_env() -> Result<Self, ConfigError> {
        let value =
            std::env::var(RELAY_URL_ENV).unwrap_or_else(|_| DEFAULT_RELAY_URL.to_string());
        Self::parse(&value)
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Zeitverhalten und ICE-Server der Call-Controller
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Wie lange ein Klingeln unbeantwortet bleiben darf
    pub ring_timeout: Duration,
    /// Poll-Abstand während eines aktiven Versuchs
    pub poll_interval: Duration,
    /// Poll-Abstand der wartenden Besitzerseite
    pub listen_interval: Duration,
    /// STUN/TURN-Server für den Verbindungsaufbau
    pub ice_servers: Vec<IceServer>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            listen_interval: Duration::from_secs(2),
            ice_servers: default_ice_servers(),
        }
    }
}

impl CallConfig {
    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn add_turn_server(&mut self, url: &str, username: &str, credential: &str) {
        self.ice_servers.push(IceServer::turn(url, username, credential));
    }
}

// ============================================================================
// TESTS
// ============================================================================
