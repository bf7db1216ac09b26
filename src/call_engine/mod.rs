//! Call Engine - Zustandsmaschine und Controller beider Rollen
//!
//! Dieses Modul verwaltet:
//! - den Lebenszyklus eines Anrufversuchs ([`CallState`], [`CallSession`])
//! - die Pufferung von ICE-Candidates bis zur Remote-Description
//! - die Besucherseite ([`VisitorCallController`]: klingeln, verhandeln)
//! - die Besitzerseite ([`OwnerCallController`]: lauschen, annehmen, ablehnen)

mod owner;
mod session;
mod state;
mod visitor;

#[cfg(test)]
pub(crate) mod testkit;

pub use owner::OwnerCallController;
pub use session::{CallSession, CandidateBuffer};
pub use state::{CallError, CallEvent, CallState};
pub use visitor::VisitorCallController;
