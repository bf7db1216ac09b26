//! Besucherseite: klingeln, auf Antwort warten, Gespräch führen
//!
//! Der Controller bildet den kompletten Ablauf eines Besucher-Anrufs ab:
//! - `ring` legt den Versuch an und startet Poll-Schleife und Antwort-Timer
//! - eingehende Umschläge treiben die Zustandsmaschine an
//! - `hangup` beendet den Versuch aus jedem nicht-finalen Zustand
//!
//! Alle Übergänge laufen unter dem Session-Lock zu Ende. Timer und
//! Poll-Schleife prüfen den Zustand grundsätzlich unter dem Lock, nie
//! auf Basis eines früheren Schnappschusses.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::config::CallConfig;
use crate::media::{LinkEvent, MediaBackend};
use crate::signaling::{
    AcceptPayload, AnswerPayload, CandidatePayload, EndPayload, Envelope, OfferPayload,
    RejectPayload, RelayChannel, RingPayload, SenderRole, Signal,
};

use super::session::CallSession;
use super::state::{CallError, CallEvent, CallState};

// ============================================================================
// VISITOR CONTROLLER
// ============================================================================

/// Anrufsteuerung der Besucherseite
///
/// Klonen ist billig, alle Klone teilen sich denselben Versuch.
#[derive(Clone)]
pub struct VisitorCallController {
    inner: Arc<VisitorInner>,
}

struct VisitorInner {
    relay: Arc<dyn RelayChannel>,
    backend: Arc<dyn MediaBackend>,
    config: CallConfig,
    /// Raum-ID == Benutzer-ID des Klingel-Besitzers
    room_id: String,
    /// Aktueller Versuch; jede Transition läuft unter diesem Lock zu Ende
    session: AsyncMutex<Option<CallSession>>,
    /// Spiegel des Zustands für synchrone Abfragen
    state: Mutex<CallState>,
    event_tx: broadcast::Sender<CallEvent>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
}

impl VisitorCallController {
    /// Erstellt einen Controller für die Klingel eines Besitzers
    pub fn new(
        relay: Arc<dyn RelayChannel>,
        backend: Arc<dyn MediaBackend>,
        room_id: String,
        config: CallConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(VisitorInner {
                relay,
                backend,
                config,
                room_id,
                session: AsyncMutex::new(None),
                state: Mutex::new(CallState::Idle),
                event_tx,
                poll_task: Mutex::new(None),
                timer_task: Mutex::new(None),
            }),
        }
    }

    /// Empfängt Zustandswechsel und Fehler
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Aktueller Zustand
    pub fn state(&self) -> CallState {
        self.inner.state.lock().clone()
    }

    /// Läuft die Poll-Schleife des aktuellen Versuchs noch?
    pub fn is_polling(&self) -> bool {
        self.inner
            .poll_task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Klingelt an der Tür und startet den Anrufversuch
    ///
    /// Liefert die Call-ID, also die Message-ID des `ring`-Umschlags.
    /// Schlägt fehl wenn der Name leer ist oder bereits ein Versuch läuft.
    pub async fn ring(&self, visitor_name: &str) -> Result<String, CallError> {
        let name = visitor_name.trim();
        if name.is_empty() {
            return Err(CallError::NameRequired);
        }

        let mut guard = self.inner.session.lock().await;
        if guard.as_ref().map(|s| !s.is_terminal()).unwrap_or(false) {
            return Err(CallError::AlreadyInCall);
        }

        // Reste eines früheren Versuchs wegräumen
        if let Some(old) = self.inner.poll_task.lock().take() {
            old.abort();
        }
        abort_timer(&self.inner);

        let signal = Signal::Ring(RingPayload::new(name.to_string()));
        let call_id = self
            .inner
            .relay
            .send(&self.inner.room_id, SenderRole::Visitor, &signal)
            .await?;

        tracing::info!(
            "Ringing doorbell {} as {} (call_id={})",
            self.inner.room_id,
            name,
            call_id
        );

        let ringing = CallState::Ringing {
            call_id: call_id.clone(),
        };
        *guard = Some(CallSession::new(call_id.clone(), ringing.clone()));
        *self.inner.state.lock() = ringing.clone();
        let _ = self.inner.event_tx.send(CallEvent::StateChanged(ringing));
        drop(guard);

        spawn_poll_loop(Arc::clone(&self.inner));
        spawn_ring_timer(Arc::clone(&self.inner), call_id.clone());

        Ok(call_id)
    }

    /// Beendet den laufenden Versuch; ohne aktiven Versuch wirkungslos
    pub async fn hangup(&self) {
        let mut guard = self.inner.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return;
        };
        if session.is_terminal() {
            return;
        }
        tracing::info!("Hanging up call {}", session.call_id());
        finish_local_end(&self.inner, session).await;
    }
}

impl std::fmt::Debug for VisitorCallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitorCallController")
            .field("room_id", &self.inner.room_id)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

fn spawn_poll_loop(inner: Arc<VisitorInner>) {
    let handle = tokio::spawn({
        let inner = Arc::clone(&inner);
        async move {
            let mut failing_since: Option<Instant> = None;
            loop {
                tokio::time::sleep(inner.config.poll_interval).await;

                if inner.state.lock().is_terminal() {
                    break;
                }

                match inner.relay.poll(&inner.room_id, SenderRole::Visitor).await {
                    Err(e) => {
                        tracing::warn!("Relay poll failed: {}", e);
                        let since = failing_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= inner.config.ring_timeout {
                            abandon_attempt(&inner).await;
                            break;
                        }
                    }
                    Ok(batch) => {
                        failing_since = None;
                        for envelope in batch {
                            handle_envelope(&inner, envelope).await;
                        }
                        if inner.state.lock().is_terminal() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Visitor poll loop stopped");
        }
    });
    *inner.poll_task.lock() = Some(handle);
}

fn spawn_ring_timer(inner: Arc<VisitorInner>, call_id: String) {
    let handle = tokio::spawn({
        let inner = Arc::clone(&inner);
        async move {
            tokio::time::sleep(inner.config.ring_timeout).await;

            // Massgeblich ist der Zustand unter dem Lock, nicht der Anlass
            let mut guard = inner.session.lock().await;
            let Some(session) = guard.as_mut() else {
                return;
            };
            let still_ringing = matches!(session.state(), CallState::Ringing { .. })
                && session.call_id() == call_id;
            if !still_ringing {
                return;
            }

            tracing::info!(
                "Call {} timed out after {:?}",
                call_id,
                inner.config.ring_timeout
            );
            session.teardown().await;
            transition(&inner, session, CallState::TimedOut);
        }
    });
    *inner.timer_task.lock() = Some(handle);
}

/// Reicht Link-Events an Relay und Zustandsmaschine weiter
fn spawn_link_forwarder(
    inner: Arc<VisitorInner>,
    mut events: broadcast::Receiver<LinkEvent>,
    call_id: String,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LinkEvent::IceCandidate(candidate)) => {
                    let signal =
                        Signal::Candidate(CandidatePayload::new(candidate, call_id.clone()));
                    if let Err(e) = inner
                        .relay
                        .send(&inner.room_id, SenderRole::Visitor, &signal)
                        .await
                    {
                        tracing::warn!("Failed to send ICE candidate: {}", e);
                    }
                }
                Ok(LinkEvent::RemoteTrack { mime_type }) => {
                    let mut guard = inner.session.lock().await;
                    if let Some(session) = guard.as_mut() {
                        if session.call_id() == call_id
                            && matches!(session.state(), CallState::Negotiating { .. })
                        {
                            tracing::info!("Remote track received ({})", mime_type);
                            transition(
                                &inner,
                                session,
                                CallState::Connected {
                                    call_id: call_id.clone(),
                                },
                            );
                        }
                    }
                }
                Ok(LinkEvent::Closed) => {
                    let mut guard = inner.session.lock().await;
                    if let Some(session) = guard.as_mut() {
                        if session.call_id() == call_id && !session.is_terminal() {
                            tracing::info!("Peer connection closed, ending call {}", call_id);
                            finish_local_end(&inner, session).await;
                        }
                    }
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Link event stream lagged, skipped {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// ============================================================================
// MESSAGE HANDLING
// ============================================================================

async fn handle_envelope(inner: &Arc<VisitorInner>, envelope: Envelope) {
    let signal = match Signal::decode(&envelope) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::debug!("Dropping malformed envelope {}: {}", envelope.id, e);
            return;
        }
    };

    let mut guard = inner.session.lock().await;
    let Some(session) = guard.as_mut() else {
        tracing::debug!("Ignoring {} without active call", envelope.kind);
        return;
    };
    if session.is_terminal() {
        tracing::debug!("Ignoring {} after call end", envelope.kind);
        return;
    }

    match signal {
        Signal::Accept(payload) => handle_accept(inner, session, payload).await,
        Signal::Reject(payload) => handle_reject(inner, session, payload).await,
        Signal::Answer(payload) => handle_answer(inner, session, payload).await,
        Signal::Candidate(payload) => handle_candidate(session, payload).await,
        Signal::End(_) => finish_remote_end(inner, session).await,
        Signal::Ring(_) | Signal::Offer(_) => {
            tracing::debug!("Ignoring unexpected {} on visitor side", envelope.kind);
        }
    }
}

/// Besitzer hat angenommen: Medien beschaffen, Offer erzeugen und senden
async fn handle_accept(
    inner: &Arc<VisitorInner>,
    session: &mut CallSession,
    payload: AcceptPayload,
) {
    if !matches!(session.state(), CallState::Ringing { .. }) {
        tracing::debug!("Ignoring accept in state {}", session.state().as_str());
        return;
    }
    if payload.call_id != session.call_id() {
        tracing::debug!(
            "Ignoring accept for foreign call {} (current: {})",
            payload.call_id,
            session.call_id()
        );
        return;
    }

    // Der Antwort-Timer ist ab jetzt gegenstandslos
    abort_timer(inner);

    let call_id = session.call_id().to_string();
    tracing::info!("Owner accepted call {}", call_id);
    session.begin_negotiation();
    transition(
        inner,
        session,
        CallState::Negotiating {
            call_id: call_id.clone(),
        },
    );

    // Medien beschaffen; scheitert das, ist nur dieser Versuch verloren
    let mut media = match inner.backend.acquire_local_media().await {
        Ok(media) => media,
        Err(e) => {
            tracing::error!("Media acquisition failed: {}", e);
            let _ = inner.event_tx.send(CallEvent::Error(e.to_string()));
            finish_local_end(inner, session).await;
            return;
        }
    };

    let link = match inner
        .backend
        .create_connection(media.as_ref(), &inner.config.ice_servers)
        .await
    {
        Ok(link) => link,
        Err(e) => {
            tracing::error!("Peer connection setup failed: {}", e);
            media.stop();
            let _ = inner.event_tx.send(CallEvent::Error(e.to_string()));
            finish_local_end(inner, session).await;
            return;
        }
    };

    session.attach_media(media);
    session.attach_link(Arc::clone(&link));

    // Erst abonnieren, dann verhandeln: keine frühen Candidates verlieren
    let events = link.subscribe();
    spawn_link_forwarder(Arc::clone(inner), events, call_id.clone());

    let offer = match link.create_offer().await {
        Ok(offer) => offer,
        Err(e) => {
            tracing::error!("Failed to create offer: {}", e);
            let _ = inner.event_tx.send(CallEvent::Error(e.to_string()));
            finish_local_end(inner, session).await;
            return;
        }
    };

    let signal = Signal::Offer(OfferPayload::new(offer));
    if let Err(e) = inner
        .relay
        .send(&inner.room_id, SenderRole::Visitor, &signal)
        .await
    {
        tracing::error!("Failed to send offer: {}", e);
        let _ = inner.event_tx.send(CallEvent::Error(e.to_string()));
        finish_local_end(inner, session).await;
        return;
    }
    tracing::debug!("Sent offer for call {}", call_id);
}

async fn handle_reject(
    inner: &Arc<VisitorInner>,
    session: &mut CallSession,
    payload: RejectPayload,
) {
    if !matches!(session.state(), CallState::Ringing { .. }) {
        tracing::debug!("Ignoring reject in state {}", session.state().as_str());
        return;
    }
    if stale_call_id(payload.call_id.as_deref(), session) {
        return;
    }

    abort_timer(inner);
    tracing::info!("Call {} was rejected", session.call_id());
    session.teardown().await;
    transition(inner, session, CallState::Rejected);
}

async fn handle_answer(
    inner: &Arc<VisitorInner>,
    session: &mut CallSession,
    payload: AnswerPayload,
) {
    if !matches!(session.state(), CallState::Negotiating { .. }) {
        tracing::debug!("Ignoring answer in state {}", session.state().as_str());
        return;
    }
    if stale_call_id(payload.call_id.as_deref(), session) {
        return;
    }

    match session.apply_remote_description(payload.sdp).await {
        Ok(()) => tracing::info!("Applied answer for call {}", session.call_id()),
        Err(e) => {
            tracing::error!("Failed to apply answer: {}", e);
            let _ = inner.event_tx.send(CallEvent::Error(e.to_string()));
        }
    }
}

async fn handle_candidate(session: &mut CallSession, payload: CandidatePayload) {
    if stale_call_id(payload.call_id.as_deref(), session) {
        return;
    }
    session.handle_remote_candidate(payload.candidate).await;
}

// ============================================================================
// TERMINAL TRANSITIONS
// ============================================================================

/// Beendet den Versuch lokal und informiert Gegenseite und Relay
async fn finish_local_end(inner: &Arc<VisitorInner>, session: &mut CallSession) {
    let call_id = session.call_id().to_string();
    let duration = session.duration_seconds();

    session.teardown().await;
    transition(inner, session, CallState::Ended);
    abort_timer(inner);

    let signal = Signal::End(EndPayload::new(call_id.clone(), duration));
    if let Err(e) = inner
        .relay
        .send(&inner.room_id, SenderRole::Visitor, &signal)
        .await
    {
        tracing::warn!("Failed to send end signal: {}", e);
    }
    if let Err(e) = inner.relay.end_call(&call_id, duration).await {
        tracing::warn!("Failed to report call end: {}", e);
    }
    if duration > 0 {
        tracing::info!("Call {} ended after {} seconds", call_id, duration);
    }
}

/// Gegenseite hat beendet: lokal abschließen und das eigene `end` echoen
///
/// Die Dauer meldet nur die auslösende Seite über `end_call`, das Echo
/// dient allein der symmetrischen Abschluss-Transition.
async fn finish_remote_end(inner: &Arc<VisitorInner>, session: &mut CallSession) {
    let call_id = session.call_id().to_string();
    let duration = session.duration_seconds();
    tracing::info!("Call {} ended by the other side", call_id);

    session.teardown().await;
    transition(inner, session, CallState::Ended);
    abort_timer(inner);

    let signal = Signal::End(EndPayload::new(call_id, duration));
    if let Err(e) = inner
        .relay
        .send(&inner.room_id, SenderRole::Visitor, &signal)
        .await
    {
        tracing::warn!("Failed to send end acknowledgement: {}", e);
    }
}

/// Bricht den Versuch ab wenn das Relay dauerhaft nicht erreichbar ist
async fn abandon_attempt(inner: &Arc<VisitorInner>) {
    let mut guard = inner.session.lock().await;
    let Some(session) = guard.as_mut() else {
        return;
    };
    if session.is_terminal() {
        return;
    }

    tracing::error!("Abandoning call {}: relay unreachable", session.call_id());
    let _ = inner
        .event_tx
        .send(CallEvent::Error("Connection to relay lost".to_string()));

    session.teardown().await;
    transition(inner, session, CallState::Ended);
    abort_timer(inner);
}

// ============================================================================
// HELPERS
// ============================================================================

fn transition(inner: &Arc<VisitorInner>, session: &mut CallSession, new_state: CallState) {
    tracing::debug!("Call {}: {}", session.call_id(), new_state.as_str());
    session.set_state(new_state.clone());
    *inner.state.lock() = new_state.clone();
    let _ = inner.event_tx.send(CallEvent::StateChanged(new_state));
}

fn abort_timer(inner: &VisitorInner) {
    if let Some(timer) = inner.timer_task.lock().take() {
        timer.abort();
    }
}

/// `true` wenn eine mitgeschickte Call-ID nicht zum laufenden Versuch passt
fn stale_call_id(claimed: Option<&str>, session: &CallSession) -> bool {
    match claimed {
        Some(id) if id != session.call_id() => {
            tracing::debug!("Ignoring message for foreign call {}", id);
            true
        }
        _ => false,
    }
}

// ============================================================================
// TESTS
// ============================================================================
