//! Signaling Module - Relay-Kommunikation zwischen Besucher und Besitzer
//!
//! Dieses Modul verwaltet den Nachrichtenfluss über das Store-and-Forward-Relay:
//! - Wire-Format kodieren und dekodieren
//! - Umschläge senden und per Polling abholen
//! - Klingel-Infos nachschlagen
//!

mod memory;
mod messages;
mod relay;

pub use memory::MemoryRelay;
pub use messages::*;
pub use relay::{
    CallInfo, DirectoryError, DoorbellDirectory, HttpRelay, RelayChannel, RelayError,
};
