//! Device discovery.
//!
//! Broadcasts one `F01D00` request and collects every `F01` reply until
//! the rolling timeout closes the window. Each new responder fires
//! `on_device_found`; the final response carries the sorted serial list.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use conbus_proto::{DatapointId, SerialNumber, SystemFunction, Telegram};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use super::{Exchange, ResponseStatus, ServiceScope, WireLog, connect_scoped, track_wire};
use crate::protocol::ConbusConnection;
use crate::signal::Signal;

/// Result of a discovery run.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoverResponse {
    /// Responding serials, sorted.
    pub devices: Vec<SerialNumber>,
    /// Shared outcome fields.
    #[serde(flatten)]
    pub exchange: Exchange,
}

/// Discovery service.
pub struct DiscoverService {
    connection: Rc<ConbusConnection>,
    devices: RefCell<BTreeSet<SerialNumber>>,

    /// Fires once per newly seen responder.
    pub on_device_found: Signal<SerialNumber>,
    /// Fires once with the final response.
    pub on_finish: Signal<DiscoverResponse>,
}

impl DiscoverService {
    /// Create a discovery service over an engine.
    #[must_use]
    pub fn new(connection: Rc<ConbusConnection>) -> Rc<Self> {
        Rc::new(Self {
            connection,
            devices: RefCell::new(BTreeSet::new()),
            on_device_found: Signal::new(),
            on_finish: Signal::new(),
        })
    }

    /// Replace the discovery window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Ask the engine to stop early.
    pub fn stop_reactor(&self) {
        self.connection.stop();
    }

    /// Run one discovery scope.
    pub async fn run(self: Rc<Self>) -> DiscoverResponse {
        self.devices.borrow_mut().clear();
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
            let Some(serial) = t.serial() else { return };
            if !t.is_reply(serial, SystemFunction::Discover) {
                return;
            }
            if me.devices.borrow_mut().insert(serial) {
                tracing::debug!(%serial, "device found");
                me.on_device_found.emit(&serial);
            }
        });

        let own = Rc::clone(&self);
        scope.defer(move || {
            own.on_device_found.clear();
            own.on_finish.clear();
        });

        let outcome = self.connection.run().await;
        let status = match outcome {
            Err(_) => ResponseStatus::FailedConnection,
            Ok(()) => ResponseStatus::Ok,
        };
        let response = DiscoverResponse {
            devices: self.devices.borrow().iter().copied().collect(),
            exchange: log.borrow().to_exchange(status, started),
        };
        self.on_finish.emit(&response);
        response
    }
}
