//! Per-device connection lifecycle.
//!
//! Each peripheral gets one [`DeviceSession`]: a cheap handle in front of
//! a dedicated actor task that owns the connection slot, the keepalive
//! task and the advertisement watch. External stimuli (advertisement
//! sightings, button notifications, link-loss notifications) and entity
//! calls all arrive as messages on the actor's queues, so connect,
//! disconnect and keepalive management are serialized by construction —
//! there is no lock to hold across an await.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, warn};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::ble::{BleBackend, BleConnection, DeviceAddress};
use crate::error::{Error, Result};
use crate::events::{EventSink, Signal};

// GATT surface of an iTag-class peripheral.
pub const UUID_BUTTON: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);
pub const UUID_ALERT: Uuid = Uuid::from_u128(0x00002a06_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

pub const ALERT_OFF: [u8; 1] = [0x00];
pub const ALERT_HIGH: [u8; 1] = [0x02];

/// Bound on each connection tier.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Cadence of the link-loss-alarm suppression write.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
/// Anti-storm gate between advertisement-triggered connect attempts.
pub const DEFAULT_MIN_ATTEMPT_INTERVAL: Duration = Duration::from_secs(3);

// === Commands ===

enum Command {
    // Entity / host facing
    StartWatch,
    StopWatch,
    Connect { done: Option<oneshot::Sender<()>> },
    Beep { on: bool, reply: oneshot::Sender<Result<()>> },
    ReadBattery { reply: oneshot::Sender<Result<Option<u8>>> },
    Disconnect { done: oneshot::Sender<()> },

    // Internal, sent by pump tasks on the loopback queue
    AdvertisementSeen,
    ButtonPressed,
    LinkLost { generation: u64 },
}

// === Handle ===

/// Handle to one peripheral's session actor.
pub struct DeviceSession {
    address: DeviceAddress,
    inbox: mpsc::UnboundedSender<Command>,
}

impl DeviceSession {
    pub fn spawn<B: BleBackend>(
        address: DeviceAddress,
        backend: Arc<B>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Self::spawn_with_interval(address, backend, events, DEFAULT_MIN_ATTEMPT_INTERVAL)
    }

    pub fn spawn_with_interval<B: BleBackend>(
        address: DeviceAddress,
        backend: Arc<B>,
        events: Arc<dyn EventSink>,
        min_attempt_interval: Duration,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
        let actor = SessionActor {
            address: address.clone(),
            backend,
            events,
            inbox: inbox_rx,
            loopback_tx,
            loopback_rx,
            connection: None,
            generation: 0,
            keepalive: None,
            watch: None,
            bridges: Vec::new(),
            last_attempt: None,
            min_attempt_interval,
            disabled: false,
        };
        tokio::spawn(actor.run());
        Arc::new(Self {
            address,
            inbox: inbox_tx,
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Start auto-connect on advertisement sightings. Idempotent.
    pub fn start_watch(&self) {
        let _ = self.inbox.send(Command::StartWatch);
    }

    /// Stop auto-connect. No-op when not watching.
    pub fn stop_watch(&self) {
        let _ = self.inbox.send(Command::StopWatch);
    }

    /// Attempt a connection now; returns once the attempt has finished.
    /// Safe to call concurrently from any number of triggers: attempts
    /// are serialized by the session task and callers that arrive while
    /// a link is already up return immediately.
    pub async fn connect(&self) {
        let _ = self
            .request(|done| Command::Connect { done: Some(done) })
            .await;
    }

    /// Sound (`true`) or silence (`false`) the beeper. Connects first if
    /// needed; if the peripheral stays unreachable this does nothing.
    pub async fn beep(&self, on: bool) {
        match self.request(|reply| Command::Beep { on, reply }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("ITag[{}] beep write failed (ignored): {}", self.address, e),
            Err(e) => debug!("ITag[{}] beep failed (ignored): {}", self.address, e),
        }
    }

    /// Battery percentage, or `None` when the peripheral is unreachable
    /// or returned an empty read. Read failures on an established link
    /// surface as errors; the entity adapter maps them to "no value".
    pub async fn read_battery(&self) -> Result<Option<u8>> {
        self.request(|reply| Command::ReadBattery { reply }).await?
    }

    /// Permanent teardown: disables the session, stops the watch and the
    /// keepalive, silences the beeper and drops the link. A session is
    /// expected to be removed after this, not reused.
    pub async fn disconnect(&self) {
        let _ = self.request(|done| Command::Disconnect { done }).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> std::result::Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(make(tx)).map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }
}

// === Actor ===

struct SessionActor<B: BleBackend> {
    address: DeviceAddress,
    backend: Arc<B>,
    events: Arc<dyn EventSink>,
    inbox: mpsc::UnboundedReceiver<Command>,
    loopback_tx: mpsc::UnboundedSender<Command>,
    loopback_rx: mpsc::UnboundedReceiver<Command>,

    /// Active transport handle; replaced wholesale on reconnect.
    connection: Option<Arc<B::Conn>>,
    /// Bumped per established connection; link-loss messages carry the
    /// generation they belong to so a stale pump cannot tear down a
    /// newer link.
    generation: u64,
    keepalive: Option<JoinHandle<()>>,
    watch: Option<JoinHandle<()>>,
    bridges: Vec<JoinHandle<()>>,
    last_attempt: Option<Instant>,
    min_attempt_interval: Duration,
    /// Set by explicit teardown; a disabled session never reconnects.
    disabled: bool,
}

impl<B: BleBackend> SessionActor<B> {
    async fn run(mut self) {
        loop {
            select! {
                cmd = self.inbox.recv() => {
                    let Some(cmd) = cmd else {
                        break; // handle dropped, session removed
                    };
                    self.handle(cmd).await;
                }
                Some(cmd) = self.loopback_rx.recv() => {
                    self.handle(cmd).await;
                }
            }
        }
        self.teardown().await;
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::StartWatch => self.start_watch().await,
            Command::StopWatch => self.stop_watch(),
            Command::Connect { done } => {
                self.connect_if_needed().await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Command::Beep { on, reply } => {
                let _ = reply.send(self.beep(on).await);
            }
            Command::ReadBattery { reply } => {
                let _ = reply.send(self.read_battery().await);
            }
            Command::Disconnect { done } => {
                self.teardown().await;
                let _ = done.send(());
            }
            Command::AdvertisementSeen => self.on_advertisement().await,
            Command::ButtonPressed => self.events.emit(Signal::ButtonPressed, &self.address),
            Command::LinkLost { generation } => self.on_link_lost(generation),
        }
    }

    // --- advertisement watch ---

    async fn start_watch(&mut self) {
        if self.watch.as_ref().is_some_and(|t| !t.is_finished()) {
            return; // already registered
        }
        let stream = match self.backend.advertisements().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("ITag[{}] advertisement watch unavailable: {}", self.address, e);
                return;
            }
        };
        let address = self.address.clone();
        let tx = self.loopback_tx.clone();
        // The scanner reports every sighting on the air; filter by
        // address here and leave rate limiting to the session task.
        self.watch = Some(tokio::spawn(async move {
            let mut stream = stream;
            while let Some(adv) = stream.next().await {
                let Some(addr) = adv.address.as_deref() else {
                    continue;
                };
                if !address.matches(addr) {
                    continue;
                }
                if tx.send(Command::AdvertisementSeen).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_watch(&mut self) {
        if let Some(task) = self.watch.take() {
            task.abort();
        }
    }

    async fn on_advertisement(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < self.min_attempt_interval {
                return;
            }
        }
        // Stamp before the attempt is scheduled: a burst of sightings
        // gets at most one attempt per window.
        self.last_attempt = Some(now);

        if self.is_connected().await {
            return;
        }
        debug!("ITag[{}] advertisement seen, scheduling connect", self.address);
        let _ = self.loopback_tx.send(Command::Connect { done: None });
    }

    // --- connect / reconnect ---

    async fn is_connected(&self) -> bool {
        match &self.connection {
            Some(conn) => conn.is_connected().await,
            None => false,
        }
    }

    async fn connect_if_needed(&mut self) {
        if self.disabled {
            return;
        }
        if self.is_connected().await {
            return; // another trigger already established the link
        }
        debug!("ITag[{}] connect() start", self.address);
        if let Err(e) = self.try_connect().await {
            debug!(
                "ITag[{}] connect failed, waiting for next stimulus: {}",
                self.address, e
            );
        }
    }

    async fn try_connect(&mut self) -> Result<()> {
        // Tier 1: managed connection through the shared device cache.
        match self
            .backend
            .connect_known(&self.address, CONNECT_TIMEOUT)
            .await
        {
            Ok(Some(conn)) => match self.finish_connect(conn).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!("ITag[{}] managed connect failed: {}", self.address, e),
            },
            Ok(None) => debug!("ITag[{}] not in adapter cache", self.address),
            Err(e) => debug!("ITag[{}] managed connect failed: {}", self.address, e),
        }

        // Tier 2: direct connection bypassing the cache.
        let conn = self
            .backend
            .connect_direct(&self.address, CONNECT_TIMEOUT)
            .await?;
        self.finish_connect(conn).await
    }

    /// Post-connect sequence shared by both tiers. On error the half-open
    /// link is dropped and the session stays cleanly disconnected.
    async fn finish_connect(&mut self, conn: B::Conn) -> Result<()> {
        let conn = Arc::new(conn);
        self.generation += 1;
        let generation = self.generation;
        self.bridges.retain(|t| !t.is_finished());

        match conn.disconnections().await {
            Ok(stream) => self.spawn_link_loss_bridge(stream, generation),
            Err(e) => debug!(
                "ITag[{}] link-loss watch unavailable (ignored): {}",
                self.address, e
            ),
        }

        match conn.subscribe(UUID_BUTTON).await {
            Ok(stream) => self.spawn_button_bridge(stream),
            Err(e) => {
                let _ = conn.disconnect().await;
                return Err(e);
            }
        }

        // Let the subscription settle before the first write.
        tokio::task::yield_now().await;

        // Silence any link-loss buzzer state inherited from the tag.
        if let Err(e) = write_alert_all(conn.as_ref(), &ALERT_OFF).await {
            debug!("ITag[{}] initial alert-off failed (ignored): {}", self.address, e);
        }

        self.connection = Some(conn);
        // The previous loop, if any, served the replaced connection.
        self.stop_keepalive();
        self.start_keepalive();
        debug!("ITag[{}] connected + notify", self.address);
        self.events.emit(Signal::Connected, &self.address);
        Ok(())
    }

    fn spawn_link_loss_bridge(&mut self, mut stream: BoxStream<'static, ()>, generation: u64) {
        let tx = self.loopback_tx.clone();
        self.bridges.push(tokio::spawn(async move {
            if stream.next().await.is_some() {
                // Hop back onto the session task before touching state.
                let _ = tx.send(Command::LinkLost { generation });
            }
        }));
    }

    fn spawn_button_bridge(&mut self, mut stream: BoxStream<'static, Vec<u8>>) {
        let tx = self.loopback_tx.clone();
        self.bridges.push(tokio::spawn(async move {
            while stream.next().await.is_some() {
                // No payload to parse; the notification is the event.
                if tx.send(Command::ButtonPressed).is_err() {
                    break;
                }
            }
        }));
    }

    // --- disconnect handling ---

    fn on_link_lost(&mut self, generation: u64) {
        if generation != self.generation {
            return; // stale notification from a replaced connection
        }
        if self.disabled {
            return; // explicit teardown already ran
        }
        debug!("ITag[{}] disconnected", self.address);
        self.stop_keepalive();
        self.connection = None;
        self.events.emit(Signal::Disconnected, &self.address);
        // Self-healing: re-arm immediately instead of waiting for the
        // next advertisement.
        let _ = self.loopback_tx.send(Command::Connect { done: None });
    }

    async fn teardown(&mut self) {
        debug!("ITag[{}] disconnect()", self.address);
        // Disabled first: a link-loss notification racing this teardown
        // must not reschedule a connect.
        self.disabled = true;
        self.stop_watch();
        self.stop_keepalive();
        // Clear the slot before touching the transport so the link-loss
        // path cannot observe a live connection.
        if let Some(conn) = self.connection.take() {
            if let Err(e) = write_alert_all(conn.as_ref(), &ALERT_OFF).await {
                debug!("ITag[{}] final alert-off failed (ignored): {}", self.address, e);
            }
            if let Err(e) = conn.unsubscribe(UUID_BUTTON).await {
                debug!("ITag[{}] unsubscribe failed (ignored): {}", self.address, e);
            }
            if let Err(e) = conn.disconnect().await {
                debug!(
                    "ITag[{}] transport disconnect failed (ignored): {}",
                    self.address, e
                );
            }
        }
        for bridge in self.bridges.drain(..) {
            bridge.abort();
        }
    }

    // --- keepalive ---

    fn start_keepalive(&mut self) {
        if self.keepalive.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let Some(conn) = self.connection.clone() else {
            return;
        };
        let address = self.address.clone();
        self.keepalive = Some(tokio::spawn(async move {
            debug!("ITag[{}] keepalive start", address);
            while conn.is_connected().await {
                if let Err(e) = write_alert_all(conn.as_ref(), &ALERT_OFF).await {
                    debug!("ITag[{}] keepalive write failed (ignored): {}", address, e);
                }
                sleep(KEEPALIVE_INTERVAL).await;
            }
            debug!("ITag[{}] keepalive stop", address);
        }));
    }

    fn stop_keepalive(&mut self) {
        // Abort usually lands in the sleep; that is normal termination.
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
    }

    // --- entity-facing operations ---

    async fn beep(&mut self, on: bool) -> Result<()> {
        if !self.is_connected().await {
            self.connect_if_needed().await;
        }
        if !self.is_connected().await {
            return Ok(()); // still unreachable: silently do nothing
        }
        let Some(conn) = self.connection.clone() else {
            return Ok(());
        };
        let payload: &[u8] = if on { &ALERT_HIGH } else { &ALERT_OFF };
        write_alert_all(conn.as_ref(), payload).await
    }

    async fn read_battery(&mut self) -> Result<Option<u8>> {
        if !self.is_connected().await {
            self.connect_if_needed().await;
        }
        if !self.is_connected().await {
            return Ok(None);
        }
        let Some(conn) = self.connection.clone() else {
            return Ok(None);
        };
        let value = conn.read_by_uuid(UUID_BATTERY).await?;
        Ok(value.first().copied())
    }
}

/// Write `payload` to every discovered instance of the alert
/// characteristic; some tags expose it under several services and only
/// react reliably when all of them are written. Falls back to a write
/// addressed by UUID alone when enumeration finds nothing.
async fn write_alert_all<C: BleConnection>(conn: &C, payload: &[u8]) -> Result<()> {
    let targets = conn.characteristics_by_uuid(UUID_ALERT).await?;
    if targets.is_empty() {
        return conn.write_by_uuid(UUID_ALERT, payload).await;
    }
    for ch in &targets {
        conn.write_characteristic(ch, payload).await?;
    }
    Ok(())
}
