//! LED blink control.
//!
//! `F05` starts the module LED blinking, `F06` stops it; the device
//! answers with an `F18` acknowledge. [`BlinkAllService`] discovers first
//! and then blinks every responder.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use conbus_proto::{DatapointId, SerialNumber, SystemFunction, Telegram};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use super::{Exchange, ResponseStatus, ServiceScope, WireLog, connect_scoped, track_wire};
use crate::protocol::ConbusConnection;
use crate::signal::Signal;

fn blink_function(on: bool) -> SystemFunction {
    if on { SystemFunction::Blink } else { SystemFunction::Unblink }
}

/// Result of one blink or unblink.
#[derive(Debug, Clone, Serialize)]
pub struct BlinkResponse {
    /// Addressed device.
    pub serial: SerialNumber,
    /// True for blink, false for unblink.
    pub on: bool,
    /// Whether the device acknowledged.
    pub acked: bool,
    /// Shared outcome fields.
    #[serde(flatten)]
    pub exchange: Exchange,
}

/// Blinks or unblinks one module LED.
pub struct BlinkService {
    connection: Rc<ConbusConnection>,
    serial: SerialNumber,
    on: bool,
    acked: Cell<bool>,

    /// Fires once with the final response.
    pub on_finish: Signal<BlinkResponse>,
}

impl BlinkService {
    /// Create a blink service; `on` selects blink or unblink.
    #[must_use]
    pub fn new(connection: Rc<ConbusConnection>, serial: SerialNumber, on: bool) -> Rc<Self> {
        Rc::new(Self { connection, serial, on, acked: Cell::new(false), on_finish: Signal::new() })
    }

    /// Replace the acknowledge window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Run one blink scope.
    pub async fn run(self: Rc<Self>) -> BlinkResponse {
        self.acked.set(false);
        let started = Instant::now();
        let log = Rc::new(RefCell::new(WireLog::default()));
        let mut scope = ServiceScope::default();
        track_wire(&mut scope, &self.connection, &log);

        let conn = Rc::clone(&self.connection);
        let (serial, on) = (self.serial, self.on);
        connect_scoped(&mut scope, &self.connection, |c| &c.connection_made, move |_: &()| {
            conn.send_telegram(serial, blink_function(on), Some(DatapointId::ModuleTypeCode), b"");
        });

        let me = Rc::clone(&self);
        connect_scoped(&mut scope, &self.connection, |c| &c.telegram_received, move |t: &Telegram| {
            if me.acked.get() || !t.is_ack_from(me.serial) {
                return;
            }
            if !t.checksum_valid() {
                tracing::warn!(serial = %me.serial, "acknowledge with bad checksum accepted");
            }
            me.acked.set(true);
            me.connection.stop();
        });

        let own = Rc::clone(&self);
        scope.defer(move || own.on_finish.clear());

        let outcome = self.connection.run().await;
        let status = match outcome {
            Err(_) => ResponseStatus::FailedConnection,
            Ok(()) if self.acked.get() => ResponseStatus::Ok,
            Ok(()) => {
                log.borrow_mut()
                    .error
                    .get_or_insert_with(|| "no acknowledge before timeout".to_owned());
                ResponseStatus::FailedWrite
            }
        };
        let response = BlinkResponse {
            serial: self.serial,
            on: self.on,
            acked: self.acked.get(),
            exchange: log.borrow().to_exchange(status, started),
        };
        self.on_finish.emit(&response);
        response
    }
}

/// Result of a blink-all run.
#[derive(Debug, Clone, Serialize)]
pub struct BlinkAllResponse {
    /// True for blink, false for unblink.
    pub on: bool,
    /// Every discovered serial, sorted.
    pub devices: Vec<SerialNumber>,
    /// The subset that acknowledged, sorted.
    pub acked: Vec<SerialNumber>,
    /// Shared outcome fields.
    #[serde(flatten)]
    pub exchange: Exchange,
}

/// Discovers the bus and blinks every responder.
pub struct BlinkAllService {
    connection: Rc<ConbusConnection>,
    on: bool,
    devices: RefCell<BTreeSet<SerialNumber>>,
    acked: RefCell<BTreeSet<SerialNumber>>,

    /// Fires per newly discovered device.
    pub on_device_found: Signal<SerialNumber>,
    /// Fires once with the final response.
    pub on_finish: Signal<BlinkAllResponse>,
}

impl BlinkAllService {
    /// Create a blink-all service; `on` selects blink or unblink.
    #[must_use]
    pub fn new(connection: Rc<ConbusConnection>, on: bool) -> Rc<Self> {
        Rc::new(Self {
            connection,
            on,
            devices: RefCell::new(BTreeSet::new()),
            acked: RefCell::new(BTreeSet::new()),
            on_device_found: Signal::new(),
            on_finish: Signal::new(),
        })
    }

    /// Replace the operation window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Run one blink-all scope.
    pub async fn run(self: Rc<Self>) -> BlinkAllResponse {
        self.devices.borrow_mut().clear();
        self.acked.borrow_mut().clear();
        let started = Instant::now();
        let log = Rc::new(RefCell::new(WireLog::default()));
        let mut scope = ServiceScope::default();
        track_wire(&mut scope, &self.connection, &log);

        let conn = Rc::clone(&self.connection);
        connect_scoped(&mut scope, &self.connection, |c| &c.connection_made, move |_: &()| {
            conn.send_telegram(
                SerialNumber::BROADCAST,
                SystemFunction::Discover,
                Some(DatapointId::ModuleTypeCode),
                b"",
            );
        });

        let me = Rc::clone(&self);
        connect_scoped(&mut scope, &self.connection, |c| &c.telegram_received, move |t: &Telegram| {
            me.on_telegram(t);
        });

        let own = Rc::clone(&self);
        scope.defer(move || {
            own.on_device_found.clear();
            own.on_finish.clear();
        });

        let outcome = self.connection.run().await;
        let devices: Vec<SerialNumber> = self.devices.borrow().iter().copied().collect();
        let acked: Vec<SerialNumber> = self.acked.borrow().iter().copied().collect();
        let status = match outcome {
            Err(_) => ResponseStatus::FailedConnection,
            Ok(()) if devices.is_empty() => ResponseStatus::FailedNoDevices,
            Ok(()) if acked.len() == devices.len() => ResponseStatus::Ok,
            Ok(()) => ResponseStatus::PartialTimeout,
        };
        let response = BlinkAllResponse {
            on: self.on,
            devices,
            acked,
            exchange: log.borrow().to_exchange(status, started),
        };
        self.on_finish.emit(&response);
        response
    }

    fn on_telegram(&self, telegram: &Telegram) {
        let Some(serial) = telegram.serial() else { return };
        if telegram.is_reply(serial, SystemFunction::Discover) {
            if self.devices.borrow_mut().insert(serial) {
                self.on_device_found.emit(&serial);
                self.connection.send_telegram(
                    serial,
                    blink_function(self.on),
                    Some(DatapointId::ModuleTypeCode),
                    b"",
                );
            }
        } else if telegram.is_ack_from(serial) && self.devices.borrow().contains(&serial) {
            self.acked.borrow_mut().insert(serial);
            let complete = {
                let devices = self.devices.borrow();
                let acked = self.acked.borrow();
                !devices.is_empty() && acked.len() == devices.len()
            };
            // Late discover replies may still arrive; only stop once the
            // discovery window went quiet enough that counts match.
            if complete {
                self.connection.stop();
            }
        }
    }
}
