// Session lifecycle tests against a scripted mock backend. No radio
// involved: the mock implements the same seam the BlueZ backend does,
// and the tests drive advertisements, link losses and button presses
// by hand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use hass_itag_ble::ble::{Advertisement, BleBackend, BleConnection, DeviceAddress};
use hass_itag_ble::error::{Error, Result};
use hass_itag_ble::events::{EventSink, Signal};
use hass_itag_ble::manager::SessionManager;
use hass_itag_ble::session::{DeviceSession, UUID_ALERT, UUID_BATTERY, UUID_BUTTON};

const MAC: &str = "FF:14:08:00:2A:01";

fn recv_stream<T: Send + 'static>(mut rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
}

// === Mock connection ===

struct MockConnState {
    connected: AtomicBool,
    alert_instances: usize,
    /// (instance index, payload) per characteristic-handle write.
    writes: Mutex<Vec<(usize, Vec<u8>)>>,
    /// Writes that went through the by-UUID fallback.
    uuid_writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    battery: Mutex<Vec<u8>>,
    read_fails: AtomicBool,
    unsubscribed: AtomicBool,
    disconnect_called: AtomicBool,
    button_txs: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    disc_txs: Mutex<Vec<mpsc::UnboundedSender<()>>>,
}

impl MockConnState {
    fn new(alert_instances: usize) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            alert_instances,
            writes: Mutex::new(Vec::new()),
            uuid_writes: Mutex::new(Vec::new()),
            battery: Mutex::new(vec![85]),
            read_fails: AtomicBool::new(false),
            unsubscribed: AtomicBool::new(false),
            disconnect_called: AtomicBool::new(false),
            button_txs: Mutex::new(Vec::new()),
            disc_txs: Mutex::new(Vec::new()),
        })
    }

    fn press_button(&self) {
        for tx in self.button_txs.lock().unwrap().iter() {
            let _ = tx.send(Vec::new());
        }
    }

    fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for tx in self.disc_txs.lock().unwrap().iter() {
            let _ = tx.send(());
        }
    }

    fn alert_writes(&self) -> Vec<(usize, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }
}

struct MockConnection(Arc<MockConnState>);

#[async_trait]
impl BleConnection for MockConnection {
    type Char = usize;

    async fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }

    async fn characteristics_by_uuid(&self, uuid: Uuid) -> Result<Vec<usize>> {
        if uuid == UUID_ALERT {
            Ok((0..self.0.alert_instances).collect())
        } else {
            Ok(Vec::new())
        }
    }

    async fn write_characteristic(&self, ch: &usize, payload: &[u8]) -> Result<()> {
        self.0.writes.lock().unwrap().push((*ch, payload.to_vec()));
        Ok(())
    }

    async fn write_by_uuid(&self, uuid: Uuid, payload: &[u8]) -> Result<()> {
        self.0
            .uuid_writes
            .lock()
            .unwrap()
            .push((uuid, payload.to_vec()));
        Ok(())
    }

    async fn read_by_uuid(&self, uuid: Uuid) -> Result<Vec<u8>> {
        assert_eq!(uuid, UUID_BATTERY);
        if self.0.read_fails.load(Ordering::SeqCst) {
            return Err(Error::Transport("read failed".into()));
        }
        Ok(self.0.battery.lock().unwrap().clone())
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<BoxStream<'static, Vec<u8>>> {
        assert_eq!(uuid, UUID_BUTTON);
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.button_txs.lock().unwrap().push(tx);
        Ok(recv_stream(rx))
    }

    async fn unsubscribe(&self, _uuid: Uuid) -> Result<()> {
        self.0.unsubscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnections(&self) -> Result<BoxStream<'static, ()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.disc_txs.lock().unwrap().push(tx);
        Ok(recv_stream(rx))
    }

    async fn disconnect(&self) -> Result<()> {
        self.0.disconnect_called.store(true, Ordering::SeqCst);
        self.0.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// === Mock backend ===

struct MockBackend {
    known: AtomicBool,
    direct_ok: AtomicBool,
    alert_instances: usize,
    known_attempts: AtomicUsize,
    direct_attempts: AtomicUsize,
    connections: Mutex<Vec<Arc<MockConnState>>>,
    adv_subscribers: Mutex<Vec<mpsc::UnboundedSender<Advertisement>>>,
}

impl MockBackend {
    fn new(alert_instances: usize) -> Arc<Self> {
        Arc::new(Self {
            known: AtomicBool::new(true),
            direct_ok: AtomicBool::new(true),
            alert_instances,
            known_attempts: AtomicUsize::new(0),
            direct_attempts: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
            adv_subscribers: Mutex::new(Vec::new()),
        })
    }

    fn set_reachable(&self, known: bool, direct: bool) {
        self.known.store(known, Ordering::SeqCst);
        self.direct_ok.store(direct, Ordering::SeqCst);
    }

    fn advertise(&self, address: Option<&str>) {
        let adv = Advertisement {
            address: address.map(String::from),
        };
        for tx in self.adv_subscribers.lock().unwrap().iter() {
            let _ = tx.send(adv.clone());
        }
    }

    fn attempts(&self) -> usize {
        self.known_attempts.load(Ordering::SeqCst)
    }

    fn watchers(&self) -> usize {
        self.adv_subscribers.lock().unwrap().len()
    }

    fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    fn connection(&self, index: usize) -> Arc<MockConnState> {
        self.connections.lock().unwrap()[index].clone()
    }

    fn new_conn(&self) -> MockConnection {
        let state = MockConnState::new(self.alert_instances);
        self.connections.lock().unwrap().push(state.clone());
        MockConnection(state)
    }
}

#[async_trait]
impl BleBackend for MockBackend {
    type Conn = MockConnection;

    async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.adv_subscribers.lock().unwrap().push(tx);
        Ok(recv_stream(rx))
    }

    async fn connect_known(
        &self,
        _address: &DeviceAddress,
        _timeout: Duration,
    ) -> Result<Option<MockConnection>> {
        self.known_attempts.fetch_add(1, Ordering::SeqCst);
        if self.known.load(Ordering::SeqCst) {
            Ok(Some(self.new_conn()))
        } else {
            Ok(None)
        }
    }

    async fn connect_direct(
        &self,
        _address: &DeviceAddress,
        _timeout: Duration,
    ) -> Result<MockConnection> {
        self.direct_attempts.fetch_add(1, Ordering::SeqCst);
        if self.direct_ok.load(Ordering::SeqCst) {
            Ok(self.new_conn())
        } else {
            Err(Error::Transport("device unreachable".into()))
        }
    }
}

// === Recording event sink ===

#[derive(Default)]
struct RecordingSink {
    emitted: Mutex<Vec<(Signal, String)>>,
}

impl RecordingSink {
    fn count(&self, signal: Signal) -> usize {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == signal)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, signal: Signal, address: &DeviceAddress) {
        self.emitted
            .lock()
            .unwrap()
            .push((signal, address.to_string()));
    }
}

// === Helpers ===

fn address() -> DeviceAddress {
    MAC.parse().unwrap()
}

fn spawn_session(
    backend: &Arc<MockBackend>,
    interval: Duration,
) -> (Arc<DeviceSession>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let session = DeviceSession::spawn_with_interval(
        address(),
        backend.clone(),
        sink.clone() as Arc<dyn EventSink>,
        interval,
    );
    (session, sink)
}

/// Let the session task and its pumps drain their queues. Purely
/// cooperative; does not advance paused time.
async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

// === Tests ===

#[tokio::test(start_paused = true)]
async fn foreign_advertisements_never_schedule_connects() {
    let backend = MockBackend::new(1);
    let (session, _sink) = spawn_session(&backend, Duration::from_secs(3));

    session.start_watch();
    settle().await;

    for _ in 0..20 {
        backend.advertise(Some("AA:BB:CC:DD:EE:FF"));
    }
    backend.advertise(None); // sighting without an address
    settle().await;

    assert_eq!(backend.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn advertisement_burst_is_rate_limited() {
    let backend = MockBackend::new(1);
    backend.set_reachable(false, false); // stay disconnected throughout
    let (session, _sink) = spawn_session(&backend, Duration::from_secs(3));

    session.start_watch();
    settle().await;

    for _ in 0..100 {
        backend.advertise(Some(MAC));
    }
    settle().await;
    assert_eq!(backend.attempts(), 1, "one attempt per rate-limit window");

    // The next window admits exactly one more.
    tokio::time::advance(Duration::from_secs(3)).await;
    for _ in 0..100 {
        backend.advertise(Some(MAC));
    }
    settle().await;
    assert_eq!(backend.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn advertisement_match_is_case_insensitive() {
    let backend = MockBackend::new(1);
    backend.set_reachable(false, false);
    let (session, _sink) = spawn_session(&backend, Duration::from_secs(3));

    session.start_watch();
    settle().await;

    backend.advertise(Some(&MAC.to_ascii_lowercase()));
    settle().await;

    assert_eq!(backend.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn start_watch_is_idempotent_and_stop_unregisters() {
    let backend = MockBackend::new(1);
    backend.set_reachable(false, false);
    let (session, _sink) = spawn_session(&backend, Duration::ZERO);

    // Stopping before ever starting is a no-op.
    session.stop_watch();
    settle().await;

    session.start_watch();
    session.start_watch();
    settle().await;
    assert_eq!(backend.watchers(), 1, "second start_watch is a no-op");

    session.stop_watch();
    settle().await;
    backend.advertise(Some(MAC));
    settle().await;
    assert_eq!(backend.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn advertisements_while_connected_are_ignored() {
    let backend = MockBackend::new(1);
    let (session, _sink) = spawn_session(&backend, Duration::ZERO);

    session.connect().await;
    assert_eq!(backend.attempts(), 1);

    session.start_watch();
    settle().await;
    // Zero-length rate-limit window: only the connected check can
    // discard these.
    for _ in 0..10 {
        backend.advertise(Some(MAC));
    }
    settle().await;

    assert_eq!(backend.attempts(), 1);
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_establish_once() {
    let backend = MockBackend::new(1);
    let (session, sink) = spawn_session(&backend, Duration::from_secs(3));

    tokio::join!(session.connect(), session.connect());

    assert_eq!(backend.connection_count(), 1);
    assert_eq!(sink.count(Signal::Connected), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_falls_back_to_direct_transport() {
    let backend = MockBackend::new(1);
    backend.set_reachable(false, true); // not in the cache, reachable directly
    let (session, sink) = spawn_session(&backend, Duration::from_secs(3));

    session.connect().await;

    assert_eq!(backend.direct_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(sink.count(Signal::Connected), 1);
}

#[tokio::test(start_paused = true)]
async fn keepalive_writes_alert_off_every_interval() {
    let backend = MockBackend::new(1);
    let (session, _sink) = spawn_session(&backend, Duration::from_secs(3));

    session.connect().await;
    settle().await;
    let conn = backend.connection(0);

    // Post-connect silence plus the keepalive's first iteration.
    let baseline = conn.alert_writes().len();
    assert!(baseline >= 2);
    assert!(conn.alert_writes().iter().all(|(_, p)| p == &vec![0x00]));

    tokio::time::advance(Duration::from_secs(20)).await;
    settle().await;
    assert_eq!(conn.alert_writes().len(), baseline + 1);

    tokio::time::advance(Duration::from_secs(20)).await;
    settle().await;
    assert_eq!(conn.alert_writes().len(), baseline + 2);
}

#[tokio::test(start_paused = true)]
async fn link_loss_stops_keepalive_and_reconnects() {
    let backend = MockBackend::new(1);
    let (session, sink) = spawn_session(&backend, Duration::from_secs(3));

    session.connect().await;
    settle().await;
    let first = backend.connection(0);
    let frozen = first.alert_writes().len();

    first.drop_link();
    settle().await;

    // Self-healing: the disconnect handler re-armed a connect, which
    // produced a fresh connection and signals for both edges.
    assert_eq!(sink.count(Signal::Disconnected), 1);
    assert_eq!(sink.count(Signal::Connected), 2);
    assert_eq!(backend.connection_count(), 2);

    // The old connection's keepalive is gone for good.
    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(first.alert_writes().len(), frozen);
}

#[tokio::test(start_paused = true)]
async fn button_notifications_emit_signals() {
    let backend = MockBackend::new(1);
    let (session, sink) = spawn_session(&backend, Duration::from_secs(3));

    session.connect().await;
    settle().await;
    let conn = backend.connection(0);

    conn.press_button();
    conn.press_button();
    settle().await;

    assert_eq!(sink.count(Signal::ButtonPressed), 2);
}

#[tokio::test(start_paused = true)]
async fn beep_on_disconnected_session_connects_first() {
    let backend = MockBackend::new(1);
    let (session, sink) = spawn_session(&backend, Duration::from_secs(3));

    session.beep(true).await;

    assert_eq!(backend.connection_count(), 1);
    assert_eq!(sink.count(Signal::Connected), 1);
    let writes = backend.connection(0).alert_writes();
    // Post-connect silence first, then the requested high alert.
    assert_eq!(writes.first().unwrap().1, vec![0x00]);
    assert!(writes.iter().any(|(_, p)| p == &vec![0x02]));
}

#[tokio::test(start_paused = true)]
async fn beep_on_unreachable_device_does_nothing() {
    let backend = MockBackend::new(1);
    backend.set_reachable(false, false);
    let (session, sink) = spawn_session(&backend, Duration::from_secs(3));

    session.beep(true).await; // must not error or panic

    assert!(backend.attempts() >= 1);
    assert_eq!(backend.connection_count(), 0);
    assert_eq!(sink.count(Signal::Connected), 0);
}

#[tokio::test(start_paused = true)]
async fn beep_round_trip_writes_every_alert_instance() {
    let backend = MockBackend::new(2);
    let (session, _sink) = spawn_session(&backend, Duration::from_secs(3));

    session.connect().await;
    settle().await;
    let conn = backend.connection(0);
    let before = conn.alert_writes().len();

    session.beep(true).await;
    session.beep(false).await;

    let writes = conn.alert_writes()[before..].to_vec();
    assert_eq!(
        writes,
        vec![
            (0, vec![0x02]),
            (1, vec![0x02]),
            (0, vec![0x00]),
            (1, vec![0x00]),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn beep_falls_back_to_uuid_write_without_enumeration() {
    let backend = MockBackend::new(0); // enumeration finds nothing
    let (session, _sink) = spawn_session(&backend, Duration::from_secs(3));

    session.beep(true).await;
    settle().await;

    let conn = backend.connection(0);
    let uuid_writes = conn.uuid_writes.lock().unwrap().clone();
    assert!(uuid_writes.contains(&(UUID_ALERT, vec![0x02])));
    assert!(conn.alert_writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn read_battery_returns_value_when_connected() {
    let backend = MockBackend::new(1);
    let (session, _sink) = spawn_session(&backend, Duration::from_secs(3));

    assert_eq!(session.read_battery().await.unwrap(), Some(85));

    *backend.connection(0).battery.lock().unwrap() = vec![12, 99];
    assert_eq!(session.read_battery().await.unwrap(), Some(12));
}

#[tokio::test(start_paused = true)]
async fn read_battery_on_unreachable_device_is_no_value() {
    let backend = MockBackend::new(1);
    backend.set_reachable(false, false);
    let (session, _sink) = spawn_session(&backend, Duration::from_secs(3));

    assert_eq!(session.read_battery().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn read_battery_empty_read_is_no_value() {
    let backend = MockBackend::new(1);
    let (session, _sink) = spawn_session(&backend, Duration::from_secs(3));

    session.connect().await;
    *backend.connection(0).battery.lock().unwrap() = Vec::new();

    assert_eq!(session.read_battery().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn read_battery_failure_surfaces_to_the_adapter() {
    let backend = MockBackend::new(1);
    let (session, _sink) = spawn_session(&backend, Duration::from_secs(3));

    session.connect().await;
    backend.connection(0).read_fails.store(true, Ordering::SeqCst);

    assert!(session.read_battery().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_is_permanent() {
    let backend = MockBackend::new(1);
    let (session, sink) = spawn_session(&backend, Duration::from_secs(3));

    session.start_watch();
    session.connect().await;
    settle().await;
    let conn = backend.connection(0);
    let attempts = backend.attempts();

    session.disconnect().await;

    // Teardown silenced the beeper, unsubscribed and dropped the link.
    assert_eq!(conn.alert_writes().last().unwrap().1, vec![0x00]);
    assert!(conn.unsubscribed.load(Ordering::SeqCst));
    assert!(conn.disconnect_called.load(Ordering::SeqCst));

    // A late link-loss notification finds a disabled session: no signal,
    // no rescheduled connect, no resurrection.
    conn.drop_link();
    settle().await;
    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;

    assert_eq!(sink.count(Signal::Disconnected), 0);
    assert_eq!(backend.attempts(), attempts);
    assert_eq!(backend.connection_count(), 1);

    // Advertisements cannot revive it either.
    backend.advertise(Some(MAC));
    settle().await;
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn manager_shares_one_session_per_address() {
    let backend = MockBackend::new(1);
    let sink = Arc::new(RecordingSink::default());
    let manager = SessionManager::new(backend.clone(), sink.clone() as Arc<dyn EventSink>);
    let addr = address();

    let first = manager.session(&addr);
    let second = manager.session(&addr);
    assert!(Arc::ptr_eq(&first, &second));

    first.connect().await;
    assert_eq!(backend.connection_count(), 1);

    assert!(manager.teardown(&addr).await);
    assert!(manager.get(&addr).is_none());
    assert!(!manager.teardown(&addr).await);
    assert!(backend.connection(0).disconnect_called.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn keepalive_stops_within_one_cycle_of_disconnect() {
    let backend = MockBackend::new(1);
    let (session, _sink) = spawn_session(&backend, Duration::from_secs(3));

    session.connect().await;
    settle().await;
    let conn = backend.connection(0);

    session.disconnect().await;
    let frozen = conn.alert_writes().len();

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(conn.alert_writes().len(), frozen);
}
