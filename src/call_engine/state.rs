//! Zustände, Events und Fehler eines Anrufversuchs
//!
//! Beide Rollen teilen sich denselben Zustandsraum; welche Übergänge
//! erlaubt sind, entscheiden die Controller in [`super::owner`] und
//! [`super::visitor`]. Aus einem Endzustand führt kein Übergang heraus,
//! ein neues Klingeln startet immer eine frische Session.

use thiserror::Error;

use crate::media::MediaError;
use crate::signaling::RelayError;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("Visitor name must not be empty")]
    NameRequired,

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufversuchs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Kein aktiver Versuch
    Idle,
    /// Besucher hat geklingelt und wartet auf Antwort
    Ringing { call_id: String },
    /// Klingeln wartet beim Besitzer auf Annahme oder Ablehnung
    Incoming {
        call_id: String,
        visitor_name: String,
    },
    /// SDP/ICE-Austausch läuft
    Negotiating { call_id: String },
    /// Medien fließen in beide Richtungen
    Connected { call_id: String },
    /// Besitzer hat abgelehnt (Endzustand)
    Rejected,
    /// Niemand hat rechtzeitig geantwortet (Endzustand)
    TimedOut,
    /// Gespräch beendet oder Versuch abgebrochen (Endzustand)
    Ended,
}

impl CallState {
    /// Kleingeschriebener Name für Logs und Oberflächen
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Ringing { .. } => "ringing",
            CallState::Incoming { .. } => "incoming",
            CallState::Negotiating { .. } => "negotiating",
            CallState::Connected { .. } => "connected",
            CallState::Rejected => "rejected",
            CallState::TimedOut => "timed_out",
            CallState::Ended => "ended",
        }
    }

    /// Endzustände: aus ihnen führt kein Übergang mehr heraus
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Rejected | CallState::TimedOut | CallState::Ended
        )
    }

    /// Call-ID des Versuchs, falls der Zustand eine trägt
    pub fn call_id(&self) -> Option<&str> {
        match self {
            CallState::Ringing { call_id }
            | CallState::Incoming { call_id, .. }
            | CallState::Negotiating { call_id }
            | CallState::Connected { call_id } => Some(call_id),
            _ => None,
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CALL EVENTS
// ============================================================================

/// Events die von den Call-Controllern ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Zustandswechsel des aktuellen Versuchs
    StateChanged(CallState),

    /// Neues Klingeln wartet auf der Besitzerseite
    IncomingRing {
        call_id: String,
        visitor_name: String,
    },

    /// Fehler, der dem Benutzer angezeigt werden soll
    Error(String),
}

// ============================================================================
// TESTS
// ============================================================================
