//! Klingel - Anrufsignalisierung für eine QR-Code-Türklingel
//!
//! Besucher erreichen den Besitzer einer Klingel per WebRTC-Anruf, ohne
//! installierte App und ohne direkte Verbindung zwischen den Geräten:
//! - Store-and-Forward-Relay als einziger Transport (Polling über REST)
//! - Signal-Codec für ring/accept/reject/offer/answer/ice-candidate/end
//! - je eine Zustandsmaschine für Besucher- und Besitzerseite
//! - WebRTC hinter austauschbaren Medien-Traits
//!
//! Einstieg sind die beiden Controller: [`VisitorCallController`]
//! klingelt und führt das Gespräch, [`OwnerCallController`] lauscht auf
//! Klingeln und nimmt an oder lehnt ab. Beide sprechen dasselbe Relay
//! ([`HttpRelay`] im Betrieb, [`MemoryRelay`] in Tests).

pub mod call_engine;
pub mod config;
pub mod media;
pub mod signaling;

pub use call_engine::{
    CallError, CallEvent, CallState, OwnerCallController, VisitorCallController,
};
pub use config::{CallConfig, RelayConfig};
pub use media::{MediaBackend, WebRtcBackend};
pub use signaling::{DoorbellDirectory, HttpRelay, MemoryRelay, RelayChannel, SenderRole};
