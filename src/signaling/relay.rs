//! Relay-Vertrag und HTTP-Anbindung
//!
//! Das Relay ist ein Store-and-Forward-Briefkasten pro Raum:
//! - `send` legt einen Umschlag für die Gegenseite ab
//! - `poll` holt die eigene Post ab (konsumierend, in Ankunftsreihenfolge)
//! - `end_call` meldet die finale Gesprächsdauer
//!
//! Es gibt keinen direkten Socket zwischen den Teilnehmern, beide Seiten
//! sehen nur das Relay. `HttpRelay` spricht die REST-Routen des
//! Klingel-Backends, für Tests und lokale Läufe existiert ein
//! In-Prozess-Relay in [`super::memory`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::messages::{Envelope, MessageKind, SenderRole, Signal};
use crate::config::RelayConfig;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("Relay request failed: {0}")]
    Transport(String),

    #[error("Relay error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Doorbell not found")]
    NotFound,

    #[error("Caller is blocked for this doorbell")]
    Blocked,

    #[error("Directory request failed: {0}")]
    Transport(String),
}

// ============================================================================
// RELAY CONTRACT
// ============================================================================

/// Store-and-Forward-Kanal für Signaling-Umschläge
///
/// Garantien des Vertrags:
/// - `send` liefert die vom Relay vergebene Message-ID zurück; die ID des
///   `ring`-Umschlags ist die Call-ID des Versuchs
/// - `poll` liefert ausschließlich Nachrichten der Gegenrolle, jede genau
///   einmal, in Ankunftsreihenfolge
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Legt ein Signal im Raum ab und liefert die Message-ID
    async fn send(
        &self,
        room_id: &str,
        sender: SenderRole,
        signal: &Signal,
    ) -> Result<String, RelayError>;

    /// Holt alle neuen Umschläge für die eigene Rolle ab (konsumierend)
    async fn poll(&self, room_id: &str, as_role: SenderRole) -> Result<Vec<Envelope>, RelayError>;

    /// Meldet das Gesprächsende mit finaler Dauer
    async fn end_call(&self, call_id: &str, duration_seconds: u64) -> Result<(), RelayError>;
}

/// Nachschlagedienst für Klingel-Infos vor dem Anruf
#[async_trait]
pub trait DoorbellDirectory: Send + Sync {
    /// Liefert Anzeige-Infos und Verfügbarkeit einer Klingel
    async fn call_info(&self, owner_id: &str) -> Result<CallInfo, DirectoryError>;
}

/// Anzeige-Infos einer Klingel für die Besucherseite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    pub display_name: String,
    #[serde(default)]
    pub owner_name: Option<String>,
    pub available: bool,
    /// Hinweistext des Servers, wenn die Klingel gerade nicht erreichbar ist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// HTTP WIRE SHAPES
// ============================================================================

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    room_id: &'a str,
    sender_type: SenderRole,
    message_type: MessageKind,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    messages: Vec<Envelope>,
}

#[derive(Debug, Serialize)]
struct EndCallRequest<'a> {
    call_id: &'a str,
    duration_seconds: u64,
}

// ============================================================================
// HTTP RELAY
// ============================================================================

/// Relay-Client über die REST-Routen des Klingel-Backends
pub struct HttpRelay {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRelay {
    /// Erstellt einen neuen Relay-Client
    pub fn new(config: &RelayConfig) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: normalize_base(config.base_url.as_str()),
        })
    }

    async fn error_for_status(response: reqwest::Response) -> RelayError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        RelayError::Server { status, message }
    }
}

/// Basis-URL ohne abschließenden Schrägstrich, für simples `format!`-Joining
fn normalize_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

#[async_trait]
impl RelayChannel for HttpRelay {
    async fn send(
        &self,
        room_id: &str,
        sender: SenderRole,
        signal: &Signal,
    ) -> Result<String, RelayError> {
        let payload = signal
            .to_payload()
            .map_err(|e| RelayError::Encode(e.to_string()))?;

        let body = SendRequest {
            room_id,
            sender_type: sender,
            message_type: signal.kind(),
            payload,
        };

        let url = format!("{}/signaling/send", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        tracing::debug!(
            "Sent {} to room {} as {} (message_id={})",
            signal.kind(),
            room_id,
            sender,
            parsed.message_id
        );
        Ok(parsed.message_id)
    }

    async fn poll(&self, room_id: &str, as_role: SenderRole) -> Result<Vec<Envelope>, RelayError> {
        let url = format!(
            "{}/signaling/poll/{}?sender_type={}",
            self.base_url, room_id, as_role
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        let parsed: PollResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        Ok(parsed.messages)
    }

    async fn end_call(&self, call_id: &str, duration_seconds: u64) -> Result<(), RelayError> {
        let body = EndCallRequest {
            call_id,
            duration_seconds,
        };

        let url = format!("{}/signaling/end-call", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for_status(response).await);
        }

        tracing::debug!(
            "Reported end of call {} ({} seconds)",
            call_id,
            duration_seconds
        );
        Ok(())
    }
}

#[async_trait]
impl DoorbellDirectory for HttpRelay {
    async fn call_info(&self, owner_id: &str) -> Result<CallInfo, DirectoryError> {
        let url = format!("{}/call/info/{}", self.base_url, owner_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;

        match response.status().as_u16() {
            404 => return Err(DirectoryError::NotFound),
            403 => return Err(DirectoryError::Blocked),
            status if !(200..300).contains(&status) => {
                return Err(DirectoryError::Transport(format!(
                    "Call info request failed with status {}",
                    status
                )));
            }
            _ => {}
        }

        response
            .json()
            .await
            .map_err(|e| DirectoryError::Transport(e.to_string()))
    }
}

impl std::fmt::Debug for HttpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRelay")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
