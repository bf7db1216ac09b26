//! Laufender Anrufversuch: Call-ID, Zustand, Medien und Candidate-Puffer
//!
//! Eine [`CallSession`] lebt hinter dem Session-Lock des jeweiligen
//! Controllers. Alle Übergänge laufen unter diesem Lock zu Ende, damit
//! Poll-Schleife, Timer und Link-Events sich nie ins Gehege kommen.

use std::sync::Arc;
use std::time::Instant;

use crate::media::{LocalMedia, MediaError, PeerLink};
use crate::signaling::{NetworkCandidate, SessionDescription};

use super::state::CallState;

// ============================================================================
// CANDIDATE BUFFER
// ============================================================================

/// Puffert ICE-Candidates der Gegenseite bis die Remote-Description steht
///
/// Candidates können vor der zugehörigen Offer/Answer eintreffen. Der
/// Puffer hält sie in Ankunftsreihenfolge fest; nach [`unlock`] werden
/// neue Candidates direkt durchgereicht.
///
/// [`unlock`]: CandidateBuffer::unlock
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    unlocked: bool,
    pending: Vec<NetworkCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nimmt einen Candidate entgegen
    ///
    /// Liefert `Some` wenn er sofort angewendet werden darf, `None` wenn
    /// er bis zum [`unlock`](CandidateBuffer::unlock) festgehalten wird.
    pub fn route(&mut self, candidate: NetworkCandidate) -> Option<NetworkCandidate> {
        if self.unlocked {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// Öffnet den Puffer und liefert alle festgehaltenen Candidates
    /// in Ankunftsreihenfolge; weitere Aufrufe liefern nichts mehr
    pub fn unlock(&mut self) -> Vec<NetworkCandidate> {
        self.unlocked = true;
        std::mem::take(&mut self.pending)
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Zustand und Ressourcen eines einzelnen Anrufversuchs
pub struct CallSession {
    call_id: String,
    state: CallState,
    media: Option<Box<dyn LocalMedia>>,
    link: Option<Arc<dyn PeerLink>>,
    buffer: CandidateBuffer,
    negotiation_started_at: Option<Instant>,
}

impl CallSession {
    pub fn new(call_id: String, state: CallState) -> Self {
        Self {
            call_id,
            state,
            media: None,
            link: None,
            buffer: CandidateBuffer::new(),
            negotiation_started_at: None,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn set_state(&mut self, state: CallState) {
        self.state = state;
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn attach_media(&mut self, media: Box<dyn LocalMedia>) {
        self.media = Some(media);
    }

    pub fn attach_link(&mut self, link: Arc<dyn PeerLink>) {
        self.link = Some(link);
    }

    pub fn link(&self) -> Option<Arc<dyn PeerLink>> {
        self.link.clone()
    }

    /// Merkt sich den Verhandlungsbeginn für die spätere Dauerberechnung
    ///
    /// Die Uhr startet beim Eintritt in `negotiating`, nicht erst beim
    /// ersten Medienpaket; ein zweiter Aufruf verschiebt sie nicht.
    pub fn begin_negotiation(&mut self) {
        if self.negotiation_started_at.is_none() {
            self.negotiation_started_at = Some(Instant::now());
        }
    }

    /// Gesprächsdauer in ganzen Sekunden, 0 wenn nie verhandelt wurde
    pub fn duration_seconds(&self) -> u64 {
        self.negotiation_started_at
            .map(|started| started.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Wendet die Beschreibung der Gegenseite an und entleert den Puffer
    ///
    /// Gepufferte Candidates werden in Ankunftsreihenfolge nachgezogen.
    /// Ein einzelner fehlgeschlagener Candidate bricht den Anruf nicht ab.
    pub async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let link = self
            .link
            .clone()
            .ok_or_else(|| MediaError::Backend("No active peer link".to_string()))?;

        link.set_remote_description(description).await?;

        let held = self.buffer.unlock();
        if !held.is_empty() {
            tracing::debug!("Applying {} buffered ICE candidates", held.len());
        }
        for candidate in held {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply buffered ICE candidate: {}", e);
            }
        }
        Ok(())
    }

    /// Candidate der Gegenseite: sofort anwenden oder festhalten
    pub async fn handle_remote_candidate(&mut self, candidate: NetworkCandidate) {
        if let Some(ready) = self.buffer.route(candidate) {
            match &self.link {
                Some(link) => {
                    if let Err(e) = link.add_ice_candidate(ready).await {
                        tracing::warn!("Failed to apply ICE candidate: {}", e);
                    }
                }
                None => tracing::warn!("Dropping ICE candidate: no active peer link"),
            }
        }
    }

    /// Gibt Medien und Verbindung frei; mehrfacher Aufruf ist wirkungslos
    pub async fn teardown(&mut self) {
        if let Some(mut media) = self.media.take() {
            media.stop();
        }
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("state", &self.state)
            .field("has_media", &self.media.is_some())
            .field("has_link", &self.link.is_some())
            .field("buffered_candidates", &self.buffer.pending_len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testkit::{MockLink, MockMedia};

    fn candidate(label: &str) -> NetworkCandidate {
        NetworkCandidate {
            candidate: label.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn test_buffer_holds_until_unlocked() {
        let mut buffer = CandidateBuffer::new();
        assert!(!buffer.is_unlocked());
        assert!(buffer.route(candidate("a")).is_none());
        assert!(buffer.route(candidate("b")).is_none());
        assert_eq!(buffer.pending_len(), 2);
    }

    #[test]
    fn test_unlock_preserves_arrival_order() {
        let mut buffer = CandidateBuffer::new();
        buffer.route(candidate("a"));
        buffer.route(candidate("b"));
        buffer.route(candidate("c"));

        let held: Vec<String> = buffer
            .unlock()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(held, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unlock_is_idempotent() {
        let mut buffer = CandidateBuffer::new();
        buffer.route(candidate("a"));

        assert_eq!(buffer.unlock().len(), 1);
        assert!(buffer.unlock().is_empty());
        assert!(buffer.is_unlocked());
    }

    #[test]
    fn test_passthrough_after_unlock() {
        let mut buffer = CandidateBuffer::new();
        buffer.route(candidate("early"));
        buffer.unlock();

        let routed = buffer.route(candidate("late"));
        assert_eq!(routed.map(|c| c.candidate), Some("late".to_string()));
        assert_eq!(buffer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_apply_remote_description_flushes_buffer_in_order() {
        let mut session = CallSession::new(
            "c-1".to_string(),
            CallState::Negotiating {
                call_id: "c-1".to_string(),
            },
        );
        let link = MockLink::new();
        session.attach_link(link.clone());

        session.handle_remote_candidate(candidate("a")).await;
        session.handle_remote_candidate(candidate("b")).await;
        assert!(link.added_candidates().is_empty());

        session
            .apply_remote_description(SessionDescription::answer("v=0\r\n".to_string()))
            .await
            .unwrap();
        assert_eq!(link.added_candidates(), vec!["a", "b"]);

        // Nach dem Entsperren gehen Candidates direkt durch
        session.handle_remote_candidate(candidate("c")).await;
        assert_eq!(link.added_candidates(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failed_remote_description_keeps_gate_closed() {
        let mut session = CallSession::new(
            "c-1".to_string(),
            CallState::Negotiating {
                call_id: "c-1".to_string(),
            },
        );
        let link = MockLink::new();
        session.attach_link(link.clone());
        link.set_fail_set_remote(true);

        session.handle_remote_candidate(candidate("a")).await;
        let result = session
            .apply_remote_description(SessionDescription::answer("v=0\r\n".to_string()))
            .await;
        assert!(result.is_err());

        // Das Tor bleibt zu, weitere Candidates werden weiter gepuffert
        session.handle_remote_candidate(candidate("b")).await;
        assert!(link.added_candidates().is_empty());

        // Ein späterer erfolgreicher Versuch liefert alles in Reihenfolge nach
        link.set_fail_set_remote(false);
        session
            .apply_remote_description(SessionDescription::answer("v=0\r\n".to_string()))
            .await
            .unwrap();
        assert_eq!(link.added_candidates(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_teardown_releases_exactly_once() {
        let mut session = CallSession::new(
            "c-1".to_string(),
            CallState::Connected {
                call_id: "c-1".to_string(),
            },
        );
        let media = MockMedia::new();
        let stops = media.stop_count();
        let link = MockLink::new();

        session.attach_media(Box::new(media));
        session.attach_link(link.clone());

        session.teardown().await;
        session.teardown().await;

        assert_eq!(stops.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(link.close_count(), 1);
    }

    #[test]
    fn test_duration_zero_without_negotiation() {
        let session = CallSession::new(
            "c-1".to_string(),
            CallState::Ringing {
                call_id: "c-1".to_string(),
            },
        );
        assert_eq!(session.duration_seconds(), 0);
    }
}
