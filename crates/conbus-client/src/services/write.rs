//! Configuration datapoint writes.
//!
//! One `F04` write followed by one `F18` acknowledge from the same serial
//! is a successful operation. Link number, module number, auto-report and
//! light level are all this one service with different ids and values.
//! An acknowledge with a broken checksum is logged and accepted.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use conbus_proto::{DatapointId, SerialNumber, SystemFunction, Telegram};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use super::{Exchange, ResponseStatus, ServiceScope, WireLog, connect_scoped, track_wire};
use crate::protocol::ConbusConnection;
use crate::signal::Signal;

/// Result of one configuration write.
#[derive(Debug, Clone, Serialize)]
pub struct WriteDatapointResponse {
    /// Written device.
    pub serial: SerialNumber,
    /// Written datapoint name.
    pub datapoint: &'static str,
    /// Value as sent on the wire.
    pub value: String,
    /// Whether the device acknowledged.
    pub acked: bool,
    /// Shared outcome fields.
    #[serde(flatten)]
    pub exchange: Exchange,
}

/// Writes one configuration datapoint and awaits the acknowledge.
pub struct WriteDatapointService {
    connection: Rc<ConbusConnection>,
    serial: SerialNumber,
    datapoint: DatapointId,
    value: String,
    acked: Cell<bool>,

    /// Fires once with the final response.
    pub on_finish: Signal<WriteDatapointResponse>,
}

impl WriteDatapointService {
    /// Create a write service for `(serial, datapoint, value)`.
    #[must_use]
    pub fn new(
        connection: Rc<ConbusConnection>,
        serial: SerialNumber,
        datapoint: DatapointId,
        value: impl Into<String>,
    ) -> Rc<Self> {
        Rc::new(Self {
            connection,
            serial,
            datapoint,
            value: value.into(),
            acked: Cell::new(false),
            on_finish: Signal::new(),
        })
    }

    /// Replace the acknowledge window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Run one write scope.
    pub async fn run(self: Rc<Self>) -> WriteDatapointResponse {
        self.acked.set(false);
        let started = Instant::now();
        let log = Rc::new(RefCell::new(WireLog::default()));
        let mut scope = ServiceScope::default();
        track_wire(&mut scope, &self.connection, &log);

        let conn = Rc::clone(&self.connection);
        let (serial, datapoint) = (self.serial, self.datapoint);
        let value = conbus_proto::payload_bytes(&self.value);
        connect_scoped(&mut scope, &self.connection, |c| &c.connection_made, move |_: &()| {
            conn.send_telegram(serial, SystemFunction::WriteConfig, Some(datapoint), &value);
        });

        let me = Rc::clone(&self);
        connect_scoped(&mut scope, &self.connection, |c| &c.telegram_received, move |t: &Telegram| {
            me.on_telegram(t);
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
        let response = WriteDatapointResponse {
            serial: self.serial,
            datapoint: self.datapoint.name(),
            value: self.value.clone(),
            acked: self.acked.get(),
            exchange: log.borrow().to_exchange(status, started),
        };
        self.on_finish.emit(&response);
        response
    }

    fn on_telegram(&self, telegram: &Telegram) {
        if self.acked.get() || !telegram.is_ack_from(self.serial) {
            return;
        }
        if !telegram.checksum_valid() {
            tracing::warn!(serial = %self.serial, "acknowledge with bad checksum accepted");
        }
        self.acked.set(true);
        self.connection.stop();
    }
}
