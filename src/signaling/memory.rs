//! In-Prozess-Relay für Tests und lokale Läufe
//!
//! Erfüllt denselben Vertrag wie `HttpRelay`, nur ohne Netz: zwei
//! FIFO-Fächer pro Raum (eines je Empfängerrolle), Message-IDs per UUID,
//! Zustellung konsumierend in Ankunftsreihenfolge. Zusätzlich lassen sich
//! Klingel-Infos registrieren, gemeldete Gesprächsdauern auslesen und
//! Transportfehler für Tests simulieren.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::messages::{Envelope, SenderRole, Signal};
use super::relay::{CallInfo, DirectoryError, DoorbellDirectory, RelayChannel, RelayError};

// ============================================================================
// ROOM STATE
// ============================================================================

#[derive(Default)]
struct RoomInbox {
    for_visitor: VecDeque<Envelope>,
    for_owner: VecDeque<Envelope>,
}

impl RoomInbox {
    fn queue_mut(&mut self, receiver: SenderRole) -> &mut VecDeque<Envelope> {
        match receiver {
            SenderRole::Visitor => &mut self.for_visitor,
            SenderRole::Owner => &mut self.for_owner,
        }
    }
}

struct DoorbellEntry {
    info: CallInfo,
    blocked: bool,
}

// ============================================================================
// MEMORY RELAY
// ============================================================================

/// Store-and-Forward-Relay im Prozessspeicher
#[derive(Default)]
pub struct MemoryRelay {
    rooms: Mutex<HashMap<String, RoomInbox>>,
    doorbells: Mutex<HashMap<String, DoorbellEntry>>,
    ended: Mutex<HashMap<String, u64>>,
    fail_polls: AtomicBool,
    fail_sends: AtomicBool,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registriert eine Klingel für den Nachschlagedienst
    pub fn register_doorbell(&self, owner_id: &str, info: CallInfo) {
        self.doorbells.lock().insert(
            owner_id.to_string(),
            DoorbellEntry {
                info,
                blocked: false,
            },
        );
    }

    /// Markiert eine registrierte Klingel als für Anrufer gesperrt
    pub fn set_blocked(&self, owner_id: &str, blocked: bool) {
        if let Some(entry) = self.doorbells.lock().get_mut(owner_id) {
            entry.blocked = blocked;
        }
    }

    /// Gemeldete Gesprächsdauern (`end_call`-Aufrufe), Call-ID → Sekunden
    pub fn ended_calls(&self) -> HashMap<String, u64> {
        self.ended.lock().clone()
    }

    /// Anzahl noch nicht abgeholter Umschläge für eine Rolle
    pub fn pending_count(&self, room_id: &str, receiver: SenderRole) -> usize {
        self.rooms
            .lock()
            .get_mut(room_id)
            .map(|inbox| inbox.queue_mut(receiver).len())
            .unwrap_or(0)
    }

    /// Lässt alle folgenden `poll`-Aufrufe fehlschlagen (Transportfehler-Simulation)
    pub fn set_poll_failure(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    /// Lässt alle folgenden `send`-Aufrufe fehlschlagen
    pub fn set_send_failure(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayChannel for MemoryRelay {
    async fn send(
        &self,
        room_id: &str,
        sender: SenderRole,
        signal: &Signal,
    ) -> Result<String, RelayError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RelayError::Transport("simulated send failure".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let envelope = Envelope::new(id.clone(), room_id.to_string(), sender, signal)
            .map_err(|e| RelayError::Encode(e.to_string()))?;

        let mut rooms = self.rooms.lock();
        let inbox = rooms.entry(room_id.to_string()).or_default();
        // Zustellung immer nur an die Gegenrolle
        inbox.queue_mut(sender.opposite()).push_back(envelope);

        Ok(id)
    }

    async fn poll(&self, room_id: &str, as_role: SenderRole) -> Result<Vec<Envelope>, RelayError> {
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(RelayError::Transport("simulated poll failure".to_string()));
        }

        let mut rooms = self.rooms.lock();
        let batch = rooms
            .get_mut(room_id)
            .map(|inbox| inbox.queue_mut(as_role).drain(..).collect())
            .unwrap_or_default();

        Ok(batch)
    }

    async fn end_call(&self, call_id: &str, duration_seconds: u64) -> Result<(), RelayError> {
        self.ended
            .lock()
            .insert(call_id.to_string(), duration_seconds);
        Ok(())
    }
}

#[async_trait]
impl DoorbellDirectory for MemoryRelay {
    async fn call_info(&self, owner_id: &str) -> Result<CallInfo, DirectoryError> {
        let doorbells = self.doorbells.lock();
        match doorbells.get(owner_id) {
            None => Err(DirectoryError::NotFound),
            Some(entry) if entry.blocked => Err(DirectoryError::Blocked),
            Some(entry) => Ok(entry.info.clone()),
        }
    }
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("rooms", &self.rooms.lock().len())
            .field("doorbells", &self.doorbells.lock().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
