//! Wire-Format für das Klingel-Signaling
//!
//! Diese Strukturen spiegeln das JSON-Format des Relay-Servers wider:
//! - `Envelope`: die vom Relay gespeicherte Nachricht (Umschlag)
//! - typisierte Payload-Strukturen pro Nachrichtenart
//! - `Signal`: dekodierte Nachricht für die Call-State-Machine
//!
//! Der Umschlag wird hier nur dekodiert, nie inhaltlich geprüft:
//! fehlende Pflichtfelder einer Payload sind ein `CodecError::Malformed`,
//! alles Weitere entscheidet die State-Machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CodecError {
    #[error("Malformed {kind} payload: {detail}")]
    Malformed { kind: MessageKind, detail: String },

    #[error("Failed to encode {kind} payload: {detail}")]
    Encode { kind: MessageKind, detail: String },
}

// ============================================================================
// ROLES & MESSAGE KINDS
// ============================================================================

/// Rolle eines Teilnehmers in einem Raum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Visitor,
    Owner,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Visitor => "visitor",
            SenderRole::Owner => "owner",
        }
    }

    /// Die Gegenseite im Raum
    pub fn opposite(&self) -> SenderRole {
        match self {
            SenderRole::Visitor => SenderRole::Owner,
            SenderRole::Owner => SenderRole::Visitor,
        }
    }
}

impl std::fmt::Display for SenderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alle Nachrichtenarten des Protokolls
///
/// Achtung: `ice-candidate` ist auf dem Draht mit Bindestrich geschrieben,
/// alle anderen Arten klein ohne Trenner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Ring,
    Accept,
    Reject,
    Offer,
    Answer,
    #[serde(rename = "ice-candidate")]
    IceCandidate,
    End,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ring => "ring",
            MessageKind::Accept => "accept",
            MessageKind::Reject => "reject",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::End => "end",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SDP & ICE WIRE TYPES
// ============================================================================

/// Art einer Session-Beschreibung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session-Beschreibung im Browser-Format (`{"type": "...", "sdp": "..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp,
        }
    }
}

/// ICE-Candidate im Browser-Format (camelCase-Felder)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Klingelzeichen des Besuchers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingPayload {
    /// Anzeigename des Besuchers; fehlt er, bleibt der String leer
    #[serde(default)]
    pub visitor_name: String,
}

impl RingPayload {
    pub fn new(visitor_name: String) -> Self {
        Self { visitor_name }
    }
}

/// Annahme durch den Besitzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptPayload {
    pub call_id: String,
}

impl AcceptPayload {
    pub fn new(call_id: String) -> Self {
        Self { call_id }
    }
}

/// Ablehnung durch den Besitzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl RejectPayload {
    pub fn new(call_id: String) -> Self {
        Self {
            call_id: Some(call_id),
        }
    }
}

/// SDP Offer des Besuchers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferPayload {
    pub sdp: SessionDescription,
}

impl OfferPayload {
    pub fn new(sdp: SessionDescription) -> Self {
        Self { sdp }
    }
}

/// SDP Answer des Besitzers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub sdp: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl AnswerPayload {
    pub fn new(sdp: SessionDescription, call_id: String) -> Self {
        Self {
            sdp,
            call_id: Some(call_id),
        }
    }
}

/// ICE-Candidate einer Seite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: NetworkCandidate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl CandidatePayload {
    pub fn new(candidate: NetworkCandidate, call_id: String) -> Self {
        Self {
            candidate,
            call_id: Some(call_id),
        }
    }
}

/// Gesprächsende einer Seite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Gesprächsdauer in Sekunden, 0 wenn die Verhandlung nie begann
    #[serde(default)]
    pub duration_seconds: u64,
}

impl EndPayload {
    pub fn new(call_id: String, duration_seconds: u64) -> Self {
        Self {
            call_id: Some(call_id),
            duration_seconds,
        }
    }
}

// ============================================================================
// DECODED SIGNAL
// ============================================================================

/// Dekodierte Signaling-Nachricht
///
/// Die Variante bestimmt die Nachrichtenart, die Payload ist bereits
/// auf Pflichtfelder geprüft.
#[derive(Debug, Clone)]
pub enum Signal {
    Ring(RingPayload),
    Accept(AcceptPayload),
    Reject(RejectPayload),
    Offer(OfferPayload),
    Answer(AnswerPayload),
    Candidate(CandidatePayload),
    End(EndPayload),
}

impl Signal {
    /// Nachrichtenart dieses Signals
    pub fn kind(&self) -> MessageKind {
        match self {
            Signal::Ring(_) => MessageKind::Ring,
            Signal::Accept(_) => MessageKind::Accept,
            Signal::Reject(_) => MessageKind::Reject,
            Signal::Offer(_) => MessageKind::Offer,
            Signal::Answer(_) => MessageKind::Answer,
            Signal::Candidate(_) => MessageKind::IceCandidate,
            Signal::End(_) => MessageKind::End,
        }
    }

    /// Kodiert die Payload als JSON-Objekt für den Umschlag
    pub fn to_payload(&self) -> Result<serde_json::Value, CodecError> {
        let encode = |v: Result<serde_json::Value, serde_json::Error>| {
            v.map_err(|e| CodecError::Encode {
                kind: self.kind(),
                detail: e.to_string(),
            })
        };

        match self {
            Signal::Ring(p) => encode(serde_json::to_value(p)),
            Signal::Accept(p) => encode(serde_json::to_value(p)),
            Signal::Reject(p) => encode(serde_json::to_value(p)),
            Signal::Offer(p) => encode(serde_json::to_value(p)),
            Signal::Answer(p) => encode(serde_json::to_value(p)),
            Signal::Candidate(p) => encode(serde_json::to_value(p)),
            Signal::End(p) => encode(serde_json::to_value(p)),
        }
    }

    /// Dekodiert einen Umschlag in ein typisiertes Signal
    ///
    /// Schlägt nur fehl, wenn Pflichtfelder der jeweiligen Art fehlen
    /// (z.B. `offer` ohne SDP, `ice-candidate` ohne Candidate). Unbekannte
    /// Zusatzfelder werden ignoriert.
    pub fn decode(envelope: &Envelope) -> Result<Signal, CodecError> {
        fn parse<T: serde::de::DeserializeOwned>(
            kind: MessageKind,
            payload: &serde_json::Value,
        ) -> Result<T, CodecError> {
            serde_json::from_value(payload.clone()).map_err(|e| CodecError::Malformed {
                kind,
                detail: e.to_string(),
            })
        }

        let kind = envelope.kind;
        let payload = &envelope.payload;

        Ok(match kind {
            MessageKind::Ring => Signal::Ring(parse(kind, payload)?),
            MessageKind::Accept => Signal::Accept(parse(kind, payload)?),
            MessageKind::Reject => Signal::Reject(parse(kind, payload)?),
            MessageKind::Offer => Signal::Offer(parse(kind, payload)?),
            MessageKind::Answer => Signal::Answer(parse(kind, payload)?),
            MessageKind::IceCandidate => Signal::Candidate(parse(kind, payload)?),
            MessageKind::End => Signal::End(parse(kind, payload)?),
        })
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Vom Relay gespeicherte und zugestellte Nachricht
///
/// `id` und `created_at` vergibt das Relay beim Senden; die `id` des
/// `ring`-Umschlags dient beiden Seiten als Call-ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub room_id: String,
    #[serde(rename = "sender_type")]
    pub sender: SenderRole,
    #[serde(rename = "message_type")]
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    /// Baut einen Umschlag mit frischem Zeitstempel (Relay-Seite)
    pub fn new(
        id: String,
        room_id: String,
        sender: SenderRole,
        signal: &Signal,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            id,
            room_id,
            sender,
            kind: signal.kind(),
            payload: signal.to_payload()?,
            created_at: Utc::now(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
