//! Test-Doubles für die Call-Controller
//!
//! [`MockBackend`] ersetzt den WebRTC-Stack durch aufzeichnende
//! Attrappen, damit Zustandsmaschine und Signalfluss ohne echte
//! Medienhardware getestet werden können.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::CallConfig;
use crate::media::{IceServer, LinkEvent, LocalMedia, MediaBackend, MediaError, PeerLink};
use crate::signaling::{NetworkCandidate, SessionDescription};

// ============================================================================
// MOCK MEDIA
// ============================================================================

pub struct MockMedia {
    stops: Arc<AtomicUsize>,
}

impl MockMedia {
    pub fn new() -> Self {
        Self {
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Zähler für `stop`-Aufrufe, bleibt auch nach dem Move gültig
    pub fn stop_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.stops)
    }
}

impl LocalMedia for MockMedia {
    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// ============================================================================
// MOCK PEER LINK
// ============================================================================

pub struct MockLink {
    event_tx: broadcast::Sender<LinkEvent>,
    added: Mutex<Vec<String>>,
    remote: Mutex<Option<SessionDescription>>,
    closes: AtomicUsize,
    fail_offer: AtomicBool,
    fail_set_remote: AtomicBool,
}

impl MockLink {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(100);
        Arc::new(Self {
            event_tx,
            added: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            closes: AtomicUsize::new(0),
            fail_offer: AtomicBool::new(false),
            fail_set_remote: AtomicBool::new(false),
        })
    }

    /// Speist ein Link-Event ein, als käme es vom echten Transport
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Angewendete Candidates in Anwendungsreihenfolge
    pub fn added_candidates(&self) -> Vec<String> {
        self.added.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_fail_offer(&self, fail: bool) {
        self.fail_offer.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_set_remote(&self, fail: bool) {
        self.fail_set_remote.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(MediaError::Backend("Simulated offer failure".to_string()));
        }
        Ok(SessionDescription::offer("v=0\r\nmock-offer\r\n".to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::answer("v=0\r\nmock-answer\r\n".to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        if self.fail_set_remote.load(Ordering::SeqCst) {
            return Err(MediaError::Backend(
                "Simulated set_remote_description failure".to_string(),
            ));
        }
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: NetworkCandidate) -> Result<(), MediaError> {
        self.added.lock().push(candidate.candidate);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let _ = self.event_tx.send(LinkEvent::Closed);
    }
}

// ============================================================================
// MOCK BACKEND
// ============================================================================

pub struct MockBackend {
    acquire_calls: AtomicUsize,
    fail_acquire: AtomicBool,
    fail_connect: AtomicBool,
    fail_offer: AtomicBool,
    media_stops: Mutex<Vec<Arc<AtomicUsize>>>,
    links: Mutex<Vec<Arc<MockLink>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            acquire_calls: AtomicUsize::new(0),
            fail_acquire: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_offer: AtomicBool::new(false),
            media_stops: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Neu erzeugte Links scheitern bei `create_offer`
    pub fn set_fail_offer(&self, fail: bool) {
        self.fail_offer.store(fail, Ordering::SeqCst);
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    /// Stop-Zähler aller bisher beschafften Medien-Handles
    pub fn media_stop_counts(&self) -> Vec<Arc<AtomicUsize>> {
        self.media_stops.lock().clone()
    }

    /// Zuletzt erzeugter Peer-Link
    pub fn last_link(&self) -> Option<Arc<MockLink>> {
        self.links.lock().last().cloned()
    }
}

#[async_trait]
impl MediaBackend for MockBackend {
    async fn acquire_local_media(&self) -> Result<Box<dyn LocalMedia>, MediaError> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let media = MockMedia::new();
        self.media_stops.lock().push(media.stop_count());
        Ok(Box::new(media))
    }

    async fn create_connection(
        &self,
        _media: &dyn LocalMedia,
        _ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerLink>, MediaError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MediaError::Backend(
                "Simulated connection failure".to_string(),
            ));
        }
        let link = MockLink::new();
        link.set_fail_offer(self.fail_offer.load(Ordering::SeqCst));
        self.links.lock().push(Arc::clone(&link));
        Ok(link)
    }
}

// ============================================================================
// TEST HELPERS
// ============================================================================

/// Kurze Intervalle, damit Tests nicht auf echte Klingelzeiten warten
pub fn test_config() -> CallConfig {
    CallConfig {
        ring_timeout: Duration::from_millis(250),
        poll_interval: Duration::from_millis(20),
        listen_interval: Duration::from_millis(20),
        ice_servers: Vec::new(),
    }
}

/// Pollt eine Bedingung bis sie zutrifft oder die Frist abläuft
pub async fn wait_for<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        if Instant::now() >= deadline {
            panic!("Timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("klingel=debug")
        .with_test_writer()
        .try_init();
}
