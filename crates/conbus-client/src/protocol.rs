//! Client protocol engine.
//!
//! [`ConbusConnection`] owns exactly one TCP connection to the gateway and
//! everything attached to it: the FIFO send queue with randomized pacing,
//! the optional dedup window, the rolling inactivity timeout and the
//! signal surface services subscribe to.
//!
//! The engine is a single cooperative task. [`run`](ConbusConnection::run)
//! drives the socket, the queue drainer and the timers from one
//! `select!` loop; signal handlers run synchronously inside that loop, so
//! every handler completes before the next event is taken and no locking
//! is needed anywhere on this path. The engine is deliberately `!Send`:
//! await `run()` directly, do not spawn it.
//!
//! Send methods only enqueue; they are safe to call from any handler.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use conbus_proto::{
    DatapointId, EventKind, FrameParser, SerialNumber, SystemFunction, Telegram, display_bytes,
    payload_bytes,
};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant, sleep_until, timeout};

use crate::config::ClientConfig;
use crate::dedup::{DEFAULT_WINDOW, DedupWindow};
use crate::error::ClientError;
use crate::signal::Signal;

/// Bounds of the uniform random delay between queued sends.
///
/// The pause keeps slow relay hardware from being overwhelmed by
/// back-to-back telegrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Shortest inter-send delay.
    pub min: Duration,
    /// Longest inter-send delay.
    pub max: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self { min: Duration::from_millis(10), max: Duration::from_millis(80) }
    }
}

impl Pacing {
    /// A fixed, non-random pacing. Handy for tests.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self { min: delay, max: delay }
    }

    /// One delay drawn uniformly from the bounds.
    #[must_use]
    pub fn jitter(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Gateway host.
    pub host: String,
    /// Gateway TCP port.
    pub port: u16,
    /// Rolling inactivity timeout.
    pub timeout: Duration,
    /// Inter-send pacing bounds.
    pub pacing: Pacing,
    /// Dedup window; `None` disables suppression.
    pub dedup_window: Option<Duration>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: conbus_proto::GATEWAY_PORT,
            timeout: Duration::from_secs(5),
            pacing: Pacing::default(),
            dedup_window: Some(DEFAULT_WINDOW),
        }
    }
}

impl From<&ClientConfig> for ProtocolConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            host: config.conbus.ip.clone(),
            port: config.conbus.port,
            timeout: config.timeout(),
            ..Self::default()
        }
    }
}

/// Observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet started.
    Idle,
    /// TCP connect in flight.
    Connecting,
    /// Connected, queue empty.
    Connected,
    /// Connected, queue draining.
    Draining,
    /// Rolling timeout fired.
    TimedOut,
    /// Established connection dropped.
    Disconnected,
    /// TCP connect failed.
    Failed,
    /// Loop ended.
    Stopped,
}

/// The single-connection client protocol engine.
pub struct ConbusConnection {
    host: String,
    port: u16,
    timeout: Cell<Duration>,
    pacing: Pacing,
    dedup: Option<RefCell<DedupWindow>>,
    queue: RefCell<VecDeque<Vec<u8>>>,
    queue_wake: Notify,
    stop_wake: Notify,
    stop_requested: Cell<bool>,
    running: Cell<bool>,
    state: Cell<ConnectionState>,

    /// TCP connect completed.
    pub connection_made: Signal<()>,
    /// A frame left through the transport; carries the frame as text.
    pub telegram_sent: Signal<String>,
    /// One complete frame arrived, checksum-checked but never dropped.
    pub telegram_received: Signal<Telegram>,
    /// The rolling inactivity timeout fired; the loop stops after this.
    pub timed_out: Signal<()>,
    /// TCP could not be established.
    pub connection_failed: Signal<String>,
    /// An established connection dropped.
    pub connection_lost: Signal<String>,
    /// Any failure, as one user-facing message.
    pub failed: Signal<String>,
}

impl ConbusConnection {
    /// Create an engine; nothing connects until [`run`](Self::run).
    #[must_use]
    pub fn new(config: ProtocolConfig) -> Rc<Self> {
        Rc::new(Self {
            host: config.host,
            port: config.port,
            timeout: Cell::new(config.timeout),
            pacing: config.pacing,
            dedup: config.dedup_window.map(|w| RefCell::new(DedupWindow::new(w))),
            queue: RefCell::new(VecDeque::new()),
            queue_wake: Notify::new(),
            stop_wake: Notify::new(),
            stop_requested: Cell::new(false),
            running: Cell::new(false),
            state: Cell::new(ConnectionState::Idle),
            connection_made: Signal::new(),
            telegram_sent: Signal::new(),
            telegram_received: Signal::new(),
            timed_out: Signal::new(),
            connection_failed: Signal::new(),
            connection_lost: Signal::new(),
            failed: Signal::new(),
        })
    }

    /// The `host:port` this engine connects to.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Current engine state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Replace the rolling inactivity timeout.
    ///
    /// Takes effect at the next timer reset (connect or inbound traffic).
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout.set(timeout);
    }

    /// The configured rolling timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout.get()
    }

    /// Enqueue a System telegram.
    pub fn send_telegram(
        &self,
        serial: SerialNumber,
        function: SystemFunction,
        datapoint: Option<DatapointId>,
        data: &[u8],
    ) {
        self.enqueue(Telegram::system(serial, function, datapoint, data).frame().to_vec());
    }

    /// Enqueue an Event telegram.
    pub fn send_event_telegram(&self, module_type: u8, link: u8, input: u8, kind: EventKind) {
        self.enqueue(Telegram::event(module_type, link, input, kind).frame().to_vec());
    }

    /// Enqueue a pre-built payload; the checksum and markers are added.
    pub fn send_raw_telegram(&self, payload: &str) {
        self.enqueue(Telegram::from_payload(payload_bytes(payload)).frame().to_vec());
    }

    /// Enqueue complete on-wire frame bytes, verbatim.
    pub fn send_frame(&self, frame: Vec<u8>) {
        self.enqueue(frame);
    }

    /// Stop the loop: cancel the timers, close the transport, drop any
    /// frames still queued. Idempotent.
    pub fn stop(&self) {
        self.stop_requested.set(true);
        self.stop_wake.notify_one();
    }

    /// Drive the connection until timeout, stop or failure.
    ///
    /// Returns `Ok` for the normal ends (rolling timeout, [`stop`](Self::stop))
    /// and `Err` when the TCP connection failed or dropped; either way the
    /// corresponding signals have fired before this returns.
    pub async fn run(&self) -> Result<(), ClientError> {
        if self.running.replace(true) {
            return Err(ClientError::AlreadyRunning);
        }
        self.stop_requested.set(false);
        let result = self.drive().await;
        self.queue.borrow_mut().clear();
        self.running.set(false);
        self.state.set(ConnectionState::Stopped);
        result
    }

    async fn drive(&self) -> Result<(), ClientError> {
        self.state.set(ConnectionState::Connecting);
        let address = self.address();
        tracing::debug!(%address, "connecting to gateway");
        let stream = match timeout(self.timeout.get(), TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return self.fail_connect(error.to_string()),
            Err(_) => return self.fail_connect("connect timed out".to_owned()),
        };
        if let Err(error) = stream.set_nodelay(true) {
            tracing::debug!(%error, "cannot disable Nagle");
        }
        tracing::info!(%address, "connection established");
        self.state.set(ConnectionState::Connected);
        self.connection_made.emit(&());

        let (mut reader, mut writer) = stream.into_split();
        let mut parser = FrameParser::new();
        let mut read_buf = vec![0u8; 4096];
        let mut deadline = Instant::now() + self.timeout.get();
        let mut next_send = Instant::now();
        let mut next_evict = Instant::now() + self.evict_period();

        loop {
            if self.stop_requested.get() {
                tracing::debug!("stop requested");
                return Ok(());
            }
            let queue_ready = !self.queue.borrow().is_empty();
            self.state.set(if queue_ready {
                ConnectionState::Draining
            } else {
                ConnectionState::Connected
            });

            tokio::select! {
                () = self.stop_wake.notified() => {}
                read = reader.read(&mut read_buf) => match read {
                    Ok(0) => return self.lose_connection("closed by peer".to_owned()),
                    Ok(n) => {
                        // Any inbound byte counts as remote activity.
                        deadline = Instant::now() + self.timeout.get();
                        parser.push(&read_buf[..n]);
                        while let Some(telegram) = parser.next_frame() {
                            tracing::trace!(frame = %telegram.frame_display(), "telegram received");
                            self.telegram_received.emit(&telegram);
                        }
                    }
                    Err(error) => return self.lose_connection(error.to_string()),
                },
                () = sleep_until(next_send), if queue_ready => {
                    let frame = self.queue.borrow_mut().pop_front();
                    if let Some(frame) = frame {
                        if self.suppressed(&frame) {
                            tracing::debug!(
                                frame = %display_bytes(&frame),
                                "duplicate frame suppressed"
                            );
                        } else {
                            if let Err(error) = writer.write_all(&frame).await {
                                return self.lose_connection(error.to_string());
                            }
                            let sent_frame_display = display_bytes(&frame);
                            tracing::trace!(frame = %sent_frame_display, "telegram sent");
                            self.telegram_sent.emit(&sent_frame_display);
                            next_send = Instant::now() + self.pacing.jitter();
                        }
                    }
                }
                () = self.queue_wake.notified(), if !queue_ready => {}
                () = sleep_until(deadline) => {
                    tracing::debug!(timeout = ?self.timeout.get(), "inactivity timeout");
                    self.state.set(ConnectionState::TimedOut);
                    self.timed_out.emit(&());
                    return Ok(());
                }
                () = sleep_until(next_evict), if self.dedup.is_some() => {
                    if let Some(window) = &self.dedup {
                        window.borrow_mut().evict(Instant::now());
                    }
                    next_evict = Instant::now() + self.evict_period();
                }
            }
        }
    }

    fn enqueue(&self, frame: Vec<u8>) {
        self.queue.borrow_mut().push_back(frame);
        self.queue_wake.notify_one();
    }

    fn suppressed(&self, frame: &[u8]) -> bool {
        match &self.dedup {
            Some(window) => window.borrow_mut().check_and_record(frame, Instant::now()),
            None => false,
        }
    }

    fn evict_period(&self) -> Duration {
        self.dedup
            .as_ref()
            .map_or(Duration::from_secs(3600), |w| w.borrow().window() * 2)
    }

    fn fail_connect(&self, reason: String) -> Result<(), ClientError> {
        tracing::warn!(%reason, "connection failed");
        self.state.set(ConnectionState::Failed);
        self.connection_failed.emit(&reason);
        self.failed.emit(&format!("connection failed: {reason}"));
        Err(ClientError::ConnectionFailed(reason))
    }

    fn lose_connection(&self, reason: String) -> Result<(), ClientError> {
        tracing::warn!(%reason, "connection lost");
        self.state.set(ConnectionState::Disconnected);
        self.connection_lost.emit(&reason);
        self.failed.emit(&format!("connection lost: {reason}"));
        Err(ClientError::ConnectionLost(reason))
    }
}

impl std::fmt::Debug for ConbusConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConbusConnection")
            .field("address", &self.address())
            .field("state", &self.state.get())
            .field("queued", &self.queue.borrow().len())
            .finish()
    }
}
