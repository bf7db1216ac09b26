//! Besitzerseite: auf Klingeln lauschen, annehmen oder ablehnen
//!
//! Der Controller betreibt eine Dauerschleife über den eigenen Raum:
//! - ein `ring` wird als eingehender Anruf gemeldet (höchstens einer)
//! - `accept` beschafft erst Medien und sendet dann die Annahme
//! - `reject` lehnt ab, ohne je Medien anzufassen
//!
//! Nach jedem Gesprächsende kehrt der Controller in den Wartezustand
//! zurück und lauscht weiter; die Schleife endet erst mit `shutdown`.

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

/// Anzeigename wenn der Besucher keinen angegeben hat
const UNKNOWN_VISITOR: &str = "Unknown Visitor";

// ============================================================================
// OWNER CONTROLLER
// ============================================================================

/// Anrufsteuerung der Besitzerseite
///
/// Klonen ist billig, alle Klone teilen sich denselben Versuch.
#[derive(Clone)]
pub struct OwnerCallController {
    inner: Arc<OwnerInner>,
}

struct OwnerInner {
    relay: Arc<dyn RelayChannel>,
    backend: Arc<dyn MediaBackend>,
    config: CallConfig,
    /// Raum-ID == eigene Benutzer-ID
    room_id: String,
    /// Aktueller Versuch; jede Transition läuft unter diesem Lock zu Ende
    session: AsyncMutex<Option<CallSession>>,
    /// Spiegel des Zustands für synchrone Abfragen
    state: Mutex<CallState>,
    event_tx: broadcast::Sender<CallEvent>,
    listen_task: Mutex<Option<JoinHandle<()>>>,
}

impl OwnerCallController {
    /// Erstellt einen Controller für den eigenen Raum
    pub fn new(
        relay: Arc<dyn RelayChannel>,
        backend: Arc<dyn MediaBackend>,
        room_id: String,
        config: CallConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(OwnerInner {
                relay,
                backend,
                config,
                room_id,
                session: AsyncMutex::new(None),
                state: Mutex::new(CallState::Idle),
                event_tx,
                listen_task: Mutex::new(None),
            }),
        }
    }

    /// Empfängt Zustandswechsel, eingehende Klingeln und Fehler
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Aktueller Zustand
    pub fn state(&self) -> CallState {
        self.inner.state.lock().clone()
    }

    /// Läuft die Lausch-Schleife?
    pub fn is_listening(&self) -> bool {
        self.inner
            .listen_task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Startet die Dauerschleife über den eigenen Raum
    ///
    /// Im Wartezustand wird gemächlich gepollt, während eines Versuchs
    /// enger. Ein erneuter Aufruf ersetzt die laufende Schleife.
    pub fn listen(&self) {
        if let Some(old) = self.inner.listen_task.lock().take() {
            old.abort();
        }

        let handle = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            async move {
                let mut failing_since: Option<Instant> = None;
                loop {
                    let busy = matches!(
                        *inner.state.lock(),
                        CallState::Incoming { .. }
                            | CallState::Negotiating { .. }
                            | CallState::Connected { .. }
                    );
                    let cadence = if busy {
                        inner.config.poll_interval
                    } else {
                        inner.config.listen_interval
                    };
                    tokio::time::sleep(cadence).await;

                    match inner.relay.poll(&inner.room_id, SenderRole::Owner).await {
                        Err(e) => {
                            tracing::warn!("Relay poll failed: {}", e);
                            let since = failing_since.get_or_insert_with(Instant::now);
                            if since.elapsed() >= inner.config.ring_timeout {
                                abandon_active_attempt(&inner).await;
                                // Die Schleife lauscht weiter, die nächste
                                // Störung zählt von vorn
                                failing_since = None;
                            }
                        }
                        Ok(batch) => {
                            failing_since = None;
                            for envelope in batch {
                                handle_envelope(&inner, envelope).await;
                            }
                        }
                    }
                }
            }
        });
        *self.inner.listen_task.lock() = Some(handle);
        tracing::info!("Listening for rings in room {}", self.inner.room_id);
    }

    /// Nimmt das wartende Klingeln an
    ///
    /// Reihenfolge: erst Medien und Peer-Verbindung, dann `accept` senden.
    /// Scheitert der Medienzugriff, geht kein accept raus und der Besucher
    /// läuft in seinen Antwort-Timer.
    pub async fn accept(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let mut guard = inner.session.lock().await;

        let (call_id, visitor_name) = match guard.as_ref().map(|s| s.state()) {
            Some(CallState::Incoming {
                call_id,
                visitor_name,
            }) => (call_id.clone(), visitor_name.clone()),
            _ => return Err(CallError::NoIncomingCall),
        };

        tracing::info!("Accepting call {} from {}", call_id, visitor_name);

        let mut media = match inner.backend.acquire_local_media().await {
            Ok(media) => media,
            Err(e) => {
                tracing::error!("Media acquisition failed: {}", e);
                fail_accept(inner, &mut guard, e.to_string()).await;
                return Err(CallError::Media(e));
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
                fail_accept(inner, &mut guard, e.to_string()).await;
                return Err(CallError::Media(e));
            }
        };

        // Erst abonnieren, dann accept senden: keine frühen Candidates verlieren
        let events = link.subscribe();

        let signal = Signal::Accept(AcceptPayload::new(call_id.clone()));
        if let Err(e) = inner
            .relay
            .send(&inner.room_id, SenderRole::Owner, &signal)
            .await
        {
            tracing::error!("Failed to send accept: {}", e);
            media.stop();
            link.close().await;
            fail_accept(inner, &mut guard, e.to_string()).await;
            return Err(CallError::Relay(e));
        }

        let Some(session) = guard.as_mut() else {
            return Err(CallError::NoIncomingCall);
        };
        session.attach_media(media);
        session.attach_link(Arc::clone(&link));
        session.begin_negotiation();

        let negotiating = CallState::Negotiating {
            call_id: call_id.clone(),
        };
        session.set_state(negotiating.clone());
        publish(inner, negotiating);

        spawn_link_forwarder(Arc::clone(inner), events, call_id);
        Ok(())
    }

    /// Lehnt das wartende Klingeln ab; Medien wurden nie angefasst
    pub async fn reject(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let mut guard = inner.session.lock().await;

        let call_id = match guard.as_ref().map(|s| s.state()) {
            Some(CallState::Incoming { call_id, .. }) => call_id.clone(),
            _ => return Err(CallError::NoIncomingCall),
        };

        tracing::info!("Rejecting call {}", call_id);
        let signal = Signal::Reject(RejectPayload::new(call_id));
        inner
            .relay
            .send(&inner.room_id, SenderRole::Owner, &signal)
            .await?;

        publish(inner, CallState::Rejected);
        *guard = None;
        publish(inner, CallState::Idle);
        Ok(())
    }

    /// Beendet den laufenden Anruf; ohne aktiven Anruf wirkungslos
    pub async fn hangup(&self) {
        let mut guard = self.inner.session.lock().await;
        match guard.as_ref() {
            None => return,
            Some(session) if session.is_terminal() => {
                *guard = None;
                return;
            }
            Some(session) => {
                tracing::info!("Hanging up call {}", session.call_id());
            }
        }
        finish_local_end(&self.inner, &mut guard).await;
    }

    /// Hält die Lausch-Schleife an und beendet einen laufenden Anruf
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.listen_task.lock().take() {
            task.abort();
        }
        self.hangup().await;
        tracing::info!("Owner controller stopped");
    }
}

impl std::fmt::Debug for OwnerCallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerCallController")
            .field("room_id", &self.inner.room_id)
            .field("state", &self.state())
            .field("listening", &self.is_listening())
            .finish()
    }
}

// ============================================================================
// MESSAGE HANDLING
// ============================================================================

async fn handle_envelope(inner: &Arc<OwnerInner>, envelope: Envelope) {
    let signal = match Signal::decode(&envelope) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::debug!("Dropping malformed envelope {}: {}", envelope.id, e);
            return;
        }
    };

    let mut guard = inner.session.lock().await;

    match signal {
        Signal::Ring(payload) => handle_ring(inner, &mut guard, &envelope, payload),
        Signal::Offer(payload) => {
            if let Some(session) = active_session(&mut guard, &envelope) {
                handle_offer(inner, session, payload).await;
            }
        }
        Signal::Candidate(payload) => {
            if let Some(session) = active_session(&mut guard, &envelope) {
                if !stale_call_id(payload.call_id.as_deref(), session) {
                    session.handle_remote_candidate(payload.candidate).await;
                }
            }
        }
        Signal::End(_) => {
            if active_session(&mut guard, &envelope).is_some() {
                finish_remote_end(inner, &mut guard).await;
            }
        }
        Signal::Accept(_) | Signal::Reject(_) | Signal::Answer(_) => {
            tracing::debug!("Ignoring unexpected {} on owner side", envelope.kind);
        }
    }
}

/// Neues Klingeln: als eingehender Anruf übernehmen, höchstens eines
fn handle_ring(
    inner: &Arc<OwnerInner>,
    slot: &mut Option<CallSession>,
    envelope: &Envelope,
    payload: RingPayload,
) {
    if let Some(session) = slot.as_ref() {
        if !session.is_terminal() {
            tracing::debug!("Ignoring ring while call {} is active", session.call_id());
            return;
        }
    }

    // Die Call-ID ist die Message-ID des ring-Umschlags
    let call_id = envelope.id.clone();
    let trimmed = payload.visitor_name.trim();
    let visitor_name = if trimmed.is_empty() {
        UNKNOWN_VISITOR.to_string()
    } else {
        trimmed.to_string()
    };

    tracing::info!("Incoming ring from {} (call_id={})", visitor_name, call_id);

    let incoming = CallState::Incoming {
        call_id: call_id.clone(),
        visitor_name: visitor_name.clone(),
    };
    *slot = Some(CallSession::new(call_id.clone(), incoming.clone()));
    publish(inner, incoming);
    let _ = inner.event_tx.send(CallEvent::IncomingRing {
        call_id,
        visitor_name,
    });
}

/// Offer des Besuchers: anwenden, Puffer entleeren, Answer zurücksenden
async fn handle_offer(inner: &Arc<OwnerInner>, session: &mut CallSession, payload: OfferPayload) {
    if !matches!(session.state(), CallState::Negotiating { .. }) {
        tracing::debug!("Ignoring offer in state {}", session.state().as_str());
        return;
    }

    if let Err(e) = session.apply_remote_description(payload.sdp).await {
        tracing::error!("Failed to apply offer: {}", e);
        let _ = inner.event_tx.send(CallEvent::Error(e.to_string()));
        return;
    }

    let Some(link) = session.link() else {
        tracing::warn!("No peer link while negotiating call {}", session.call_id());
        return;
    };

    let answer = match link.create_answer().await {
        Ok(answer) => answer,
        Err(e) => {
            tracing::error!("Failed to create answer: {}", e);
            let _ = inner.event_tx.send(CallEvent::Error(e.to_string()));
            return;
        }
    };

    let call_id = session.call_id().to_string();
    let signal = Signal::Answer(AnswerPayload::new(answer, call_id.clone()));
    if let Err(e) = inner
        .relay
        .send(&inner.room_id, SenderRole::Owner, &signal)
        .await
    {
        tracing::error!("Failed to send answer: {}", e);
        let _ = inner.event_tx.send(CallEvent::Error(e.to_string()));
        return;
    }
    tracing::debug!("Sent answer for call {}", call_id);
}

// ============================================================================
// TERMINAL TRANSITIONS
// ============================================================================

/// Beendet den Anruf lokal, informiert Gegenseite und Relay,
/// danach geht es zurück in den Wartezustand
async fn finish_local_end(inner: &Arc<OwnerInner>, slot: &mut Option<CallSession>) {
    let Some(session) = slot.as_mut() else {
        return;
    };
    let call_id = session.call_id().to_string();
    let duration = session.duration_seconds();

    session.teardown().await;
    publish(inner, CallState::Ended);

    let signal = Signal::End(EndPayload::new(call_id.clone(), duration));
    if let Err(e) = inner
        .relay
        .send(&inner.room_id, SenderRole::Owner, &signal)
        .await
    {
        tracing::warn!("Failed to send end signal: {}", e);
    }
    if let Err(e) = inner.relay.end_call(&call_id, duration).await {
        tracing::warn!("Failed to report call end: {}", e);
    }

    *slot = None;
    publish(inner, CallState::Idle);
    if duration > 0 {
        tracing::info!("Call {} ended after {} seconds", call_id, duration);
    }
}

/// Gegenseite hat beendet: lokal abschließen und das eigene `end` echoen
///
/// Die Dauer meldet nur die auslösende Seite über `end_call`.
async fn finish_remote_end(inner: &Arc<OwnerInner>, slot: &mut Option<CallSession>) {
    let Some(session) = slot.as_mut() else {
        return;
    };
    let call_id = session.call_id().to_string();
    let duration = session.duration_seconds();
    tracing::info!("Call {} ended by the other side", call_id);

    session.teardown().await;
    publish(inner, CallState::Ended);

    let signal = Signal::End(EndPayload::new(call_id, duration));
    if let Err(e) = inner
        .relay
        .send(&inner.room_id, SenderRole::Owner, &signal)
        .await
    {
        tracing::warn!("Failed to send end acknowledgement: {}", e);
    }

    *slot = None;
    publish(inner, CallState::Idle);
}

/// Accept ist gescheitert: Versuch beenden, zurück in den Wartezustand
async fn fail_accept(inner: &Arc<OwnerInner>, slot: &mut Option<CallSession>, detail: String) {
    let _ = inner.event_tx.send(CallEvent::Error(detail));
    if let Some(session) = slot.as_mut() {
        session.teardown().await;
    }
    publish(inner, CallState::Ended);
    *slot = None;
    publish(inner, CallState::Idle);
}

/// Räumt einen aktiven Versuch ab wenn das Relay dauerhaft wegbleibt
async fn abandon_active_attempt(inner: &Arc<OwnerInner>) {
    let mut guard = inner.session.lock().await;
    let Some(session) = guard.as_mut() else {
        return;
    };
    if session.is_terminal() {
        *guard = None;
        return;
    }

    tracing::error!("Abandoning call {}: relay unreachable", session.call_id());
    let _ = inner
        .event_tx
        .send(CallEvent::Error("Connection to relay lost".to_string()));

    session.teardown().await;
    publish(inner, CallState::Ended);
    *guard = None;
    publish(inner, CallState::Idle);
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Reicht Link-Events an Relay und Zustandsmaschine weiter
fn spawn_link_forwarder(
    inner: Arc<OwnerInner>,
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
                        .send(&inner.room_id, SenderRole::Owner, &signal)
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
                            let connected = CallState::Connected {
                                call_id: call_id.clone(),
                            };
                            session.set_state(connected.clone());
                            publish(&inner, connected);
                        }
                    }
                }
                Ok(LinkEvent::Closed) => {
                    let mut guard = inner.session.lock().await;
                    let active = guard
                        .as_ref()
                        .map(|s| s.call_id() == call_id && !s.is_terminal())
                        .unwrap_or(false);
                    if active {
                        tracing::info!("Peer connection closed, ending call {}", call_id);
                        finish_local_end(&inner, &mut guard).await;
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
// HELPERS
// ============================================================================

fn publish(inner: &OwnerInner, state: CallState) {
    *inner.state.lock() = state.clone();
    let _ = inner.event_tx.send(CallEvent::StateChanged(state));
}

/// Session nur wenn ein nicht-finaler Versuch läuft, sonst Debug-Log
fn active_session<'a>(
    slot: &'a mut Option<CallSession>,
    envelope: &Envelope,
) -> Option<&'a mut CallSession> {
    match slot.as_mut() {
        Some(session) if !session.is_terminal() => Some(session),
        Some(_) => {
            tracing::debug!("Ignoring {} after call end", envelope.kind);
            None
        }
        None => {
            tracing::debug!("Ignoring {} without active call", envelope.kind);
            None
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::call_engine::testkit::{test_config, wait_for, MockBackend};
    use crate::signaling::{MemoryRelay, MessageKind, NetworkCandidate, SessionDescription};

    fn controller(relay: &Arc<MemoryRelay>, backend: &Arc<MockBackend>) -> OwnerCallController {
        OwnerCallController::new(
            relay.clone(),
            backend.clone(),
            "room-1".to_string(),
            test_config(),
        )
    }

    fn candidate(label: &str) -> NetworkCandidate {
        NetworkCandidate {
            candidate: label.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn send_as_visitor(relay: &MemoryRelay, signal: Signal) -> String {
        relay
            .send("room-1", SenderRole::Visitor, &signal)
            .await
            .unwrap()
    }

    async fn ring(relay: &MemoryRelay, name: &str) -> String {
        send_as_visitor(relay, Signal::Ring(RingPayload::new(name.to_string()))).await
    }

    /// Pollt die Besucher-Post bis ein Umschlag der gesuchten Art auftaucht
    async fn visitor_receives(relay: &MemoryRelay, kind: MessageKind) -> Envelope {
        for _ in 0..200 {
            let batch = relay.poll("room-1", SenderRole::Visitor).await.unwrap();
            if let Some(envelope) = batch.into_iter().find(|e| e.kind == kind) {
                return envelope;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("No {} envelope arrived for the visitor", kind);
    }

    fn drain(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Bis in den Zustand `incoming`: Klingeln senden und lauschen
    async fn ring_and_listen(
        relay: &Arc<MemoryRelay>,
        owner: &OwnerCallController,
    ) -> String {
        let call_id = ring(relay, "Alex").await;
        owner.listen();
        wait_for("incoming ring", || {
            matches!(owner.state(), CallState::Incoming { .. })
        })
        .await;
        call_id
    }

    #[tokio::test]
    async fn test_ring_surfaces_incoming() {
        let relay = Arc::new(MemoryRelay::new());
        let owner = controller(&relay, &MockBackend::new());
        let mut rx = owner.subscribe();

        let call_id = ring_and_listen(&relay, &owner).await;

        match owner.state() {
            CallState::Incoming {
                call_id: incoming_id,
                visitor_name,
            } => {
                assert_eq!(incoming_id, call_id);
                assert_eq!(visitor_name, "Alex");
            }
            other => panic!("Expected incoming, got {}", other),
        }
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, CallEvent::IncomingRing { .. })));

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_ring_ignored() {
        let relay = Arc::new(MemoryRelay::new());
        let owner = controller(&relay, &MockBackend::new());
        let mut rx = owner.subscribe();

        let first = ring(&relay, "Alex").await;
        ring(&relay, "Benni").await;
        owner.listen();

        wait_for("incoming ring", || {
            matches!(owner.state(), CallState::Incoming { .. })
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Nur das erste Klingeln wird verfolgt
        assert_eq!(owner.state().call_id(), Some(first.as_str()));
        let rings = drain(&mut rx)
            .iter()
            .filter(|event| matches!(event, CallEvent::IncomingRing { .. }))
            .count();
        assert_eq!(rings, 1);

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_blank_visitor_name_gets_placeholder() {
        let relay = Arc::new(MemoryRelay::new());
        let owner = controller(&relay, &MockBackend::new());

        ring(&relay, "   ").await;
        owner.listen();
        wait_for("incoming ring", || {
            matches!(owner.state(), CallState::Incoming { .. })
        })
        .await;

        match owner.state() {
            CallState::Incoming { visitor_name, .. } => {
                assert_eq!(visitor_name, UNKNOWN_VISITOR);
            }
            other => panic!("Expected incoming, got {}", other),
        }

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_accept_emits_accept_and_negotiates() {
        let relay = Arc::new(MemoryRelay::new());
        let backend = MockBackend::new();
        let owner = controller(&relay, &backend);

        let call_id = ring_and_listen(&relay, &owner).await;
        owner.accept().await.unwrap();

        assert!(matches!(owner.state(), CallState::Negotiating { .. }));
        assert_eq!(backend.acquire_calls(), 1);

        let envelope = visitor_receives(&relay, MessageKind::Accept).await;
        match Signal::decode(&envelope).unwrap() {
            Signal::Accept(payload) => assert_eq!(payload.call_id, call_id),
            other => panic!("Expected accept, got {:?}", other.kind()),
        }

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_offer_triggers_answer() {
        let relay = Arc::new(MemoryRelay::new());
        let backend = MockBackend::new();
        let owner = controller(&relay, &backend);

        let call_id = ring_and_listen(&relay, &owner).await;
        owner.accept().await.unwrap();

        send_as_visitor(
            &relay,
            Signal::Offer(OfferPayload::new(SessionDescription::offer(
                "v=0\r\noffer\r\n".to_string(),
            ))),
        )
        .await;

        let envelope = visitor_receives(&relay, MessageKind::Answer).await;
        match Signal::decode(&envelope).unwrap() {
            Signal::Answer(payload) => {
                assert_eq!(payload.sdp.sdp, "v=0\r\nmock-answer\r\n");
                assert_eq!(payload.call_id.as_deref(), Some(call_id.as_str()));
            }
            other => panic!("Expected answer, got {:?}", other.kind()),
        }
        assert!(backend.last_link().unwrap().remote_description().is_some());

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_offer_before_accept_ignored() {
        let relay = Arc::new(MemoryRelay::new());
        let backend = MockBackend::new();
        let owner = controller(&relay, &backend);

        ring_and_listen(&relay, &owner).await;
        send_as_visitor(
            &relay,
            Signal::Offer(OfferPayload::new(SessionDescription::offer(
                "v=0\r\noffer\r\n".to_string(),
            ))),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Ohne accept bleibt das Klingeln unbeantwortet stehen
        assert!(matches!(owner.state(), CallState::Incoming { .. }));
        assert_eq!(relay.pending_count("room-1", SenderRole::Visitor), 0);

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_offer_applied() {
        let relay = Arc::new(MemoryRelay::new());
        let backend = MockBackend::new();
        let owner = controller(&relay, &backend);

        let call_id = ring_and_listen(&relay, &owner).await;
        owner.accept().await.unwrap();
        let link = backend.last_link().unwrap();

        for label in ["v1", "v2"] {
            send_as_visitor(
                &relay,
                Signal::Candidate(CandidatePayload::new(candidate(label), call_id.clone())),
            )
            .await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(link.added_candidates().is_empty());

        send_as_visitor(
            &relay,
            Signal::Offer(OfferPayload::new(SessionDescription::offer(
                "v=0\r\noffer\r\n".to_string(),
            ))),
        )
        .await;
        wait_for("buffered candidates applied", || {
            link.added_candidates() == vec!["v1", "v2"]
        })
        .await;

        send_as_visitor(
            &relay,
            Signal::Candidate(CandidatePayload::new(candidate("v3"), call_id)),
        )
        .await;
        wait_for("late candidate applied", || {
            link.added_candidates() == vec!["v1", "v2", "v3"]
        })
        .await;

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_reject_goes_back_to_idle() {
        let relay = Arc::new(MemoryRelay::new());
        let backend = MockBackend::new();
        let owner = controller(&relay, &backend);
        let mut rx = owner.subscribe();

        let call_id = ring_and_listen(&relay, &owner).await;
        owner.reject().await.unwrap();

        assert_eq!(owner.state(), CallState::Idle);
        assert_eq!(backend.acquire_calls(), 0);

        let envelope = visitor_receives(&relay, MessageKind::Reject).await;
        match Signal::decode(&envelope).unwrap() {
            Signal::Reject(payload) => {
                assert_eq!(payload.call_id.as_deref(), Some(call_id.as_str()));
            }
            other => panic!("Expected reject, got {:?}", other.kind()),
        }
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, CallEvent::StateChanged(CallState::Rejected))));

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_accept_without_ring_fails() {
        let relay = Arc::new(MemoryRelay::new());
        let owner = controller(&relay, &MockBackend::new());

        let result = owner.accept().await;
        assert!(matches!(result, Err(CallError::NoIncomingCall)));
        assert_eq!(owner.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_media_failure_keeps_accept_unsent() {
        let relay = Arc::new(MemoryRelay::new());
        let backend = MockBackend::new();
        backend.set_fail_acquire(true);
        let owner = controller(&relay, &backend);
        let mut rx = owner.subscribe();

        ring_and_listen(&relay, &owner).await;
        let result = owner.accept().await;

        assert!(matches!(result, Err(CallError::Media(_))));
        assert_eq!(owner.state(), CallState::Idle);
        // Ohne Medien geht kein accept raus
        let batch = relay.poll("room-1", SenderRole::Visitor).await.unwrap();
        assert!(batch.is_empty());
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, CallEvent::Error(_))));

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_accept_send_failure_releases_resources() {
        let relay = Arc::new(MemoryRelay::new());
        let backend = MockBackend::new();
        let owner = controller(&relay, &backend);
        let mut rx = owner.subscribe();

        ring_and_listen(&relay, &owner).await;
        relay.set_send_failure(true);
        let result = owner.accept().await;

        assert!(matches!(result, Err(CallError::Relay(_))));
        assert_eq!(owner.state(), CallState::Idle);
        assert_eq!(backend.last_link().unwrap().close_count(), 1);
        for stops in backend.media_stop_counts() {
            assert_eq!(stops.load(Ordering::SeqCst), 1);
        }
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, CallEvent::Error(_))));

        // Beim Besucher ist nie ein accept angekommen
        relay.set_send_failure(false);
        let batch = relay.poll("room-1", SenderRole::Visitor).await.unwrap();
        assert!(batch.is_empty());

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_end_returns_to_listening() {
        let relay = Arc::new(MemoryRelay::new());
        let backend = MockBackend::new();
        let owner = controller(&relay, &backend);

        ring_and_listen(&relay, &owner).await;
        owner.accept().await.unwrap();
        let link = backend.last_link().unwrap();

        send_as_visitor(
            &relay,
            Signal::End(EndPayload::new("whatever".to_string(), 0)),
        )
        .await;
        wait_for("owner back to idle", || owner.state() == CallState::Idle).await;

        // Reaktive Seite: end-Echo ja, Dauer-Meldung nein
        visitor_receives(&relay, MessageKind::End).await;
        assert!(relay.ended_calls().is_empty());
        assert_eq!(link.close_count(), 1);
        for stops in backend.media_stop_counts() {
            assert_eq!(stops.load(Ordering::SeqCst), 1);
        }

        // Die Schleife lauscht weiter: ein neues Klingeln kommt durch
        assert!(owner.is_listening());
        ring(&relay, "Benni").await;
        wait_for("next incoming ring", || {
            matches!(owner.state(), CallState::Incoming { .. })
        })
        .await;

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_hangup_reports_duration() {
        let relay = Arc::new(MemoryRelay::new());
        let backend = MockBackend::new();
        let owner = controller(&relay, &backend);

        let call_id = ring_and_listen(&relay, &owner).await;
        owner.accept().await.unwrap();
        owner.hangup().await;

        assert_eq!(owner.state(), CallState::Idle);
        visitor_receives(&relay, MessageKind::End).await;
        assert_eq!(relay.ended_calls().get(&call_id), Some(&0));

        owner.shutdown().await;
    }

    #[tokio::test]
    async fn test_relay_outage_abandons_call_but_keeps_listening() {
        let relay = Arc::new(MemoryRelay::new());
        let backend = MockBackend::new();
        let owner = controller(&relay, &backend);
        let mut rx = owner.subscribe();

        ring_and_listen(&relay, &owner).await;
        owner.accept().await.unwrap();

        relay.set_poll_failure(true);
        wait_for("attempt abandoned", || owner.state() == CallState::Idle).await;
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, CallEvent::Error(_))));
        assert_eq!(backend.last_link().unwrap().close_count(), 1);

        // Nach der Störung geht das Lauschen weiter
        relay.set_poll_failure(false);
        ring(&relay, "Benni").await;
        wait_for("next incoming ring", || {
            matches!(owner.state(), CallState::Incoming { .. })
        })
        .await;

        owner.shutdown().await;
    }
}
