//! Relay output control.
//!
//! Drives one relay channel by writing the output-state datapoint:
//! `F04D12{output:02}{0|1}`, acknowledged like every configuration write.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use conbus_proto::{DatapointId, SerialNumber, SystemFunction, Telegram};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use super::{Exchange, ResponseStatus, ServiceScope, WireLog, connect_scoped, track_wire};
use crate::protocol::ConbusConnection;
use crate::signal::Signal;

/// Result of one output switch.
#[derive(Debug, Clone, Serialize)]
pub struct OutputResponse {
    /// Addressed device.
    pub serial: SerialNumber,
    /// Output channel index.
    pub output: u8,
    /// Requested state.
    pub on: bool,
    /// Whether the device acknowledged.
    pub acked: bool,
    /// Shared outcome fields.
    #[serde(flatten)]
    pub exchange: Exchange,
}

/// Switches one relay output on or off.
pub struct OutputService {
    connection: Rc<ConbusConnection>,
    serial: SerialNumber,
    output: u8,
    on: bool,
    acked: Cell<bool>,

    /// Fires once with the final response.
    pub on_finish: Signal<OutputResponse>,
}

impl OutputService {
    /// Create an output service for `(serial, output, state)`.
    #[must_use]
    pub fn new(
        connection: Rc<ConbusConnection>,
        serial: SerialNumber,
        output: u8,
        on: bool,
    ) -> Rc<Self> {
        Rc::new(Self {
            connection,
            serial,
            output,
            on,
            acked: Cell::new(false),
            on_finish: Signal::new(),
        })
    }

    /// Replace the acknowledge window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Run one output scope.
    pub async fn run(self: Rc<Self>) -> OutputResponse {
        self.acked.set(false);
        let started = Instant::now();
        let log = Rc::new(RefCell::new(WireLog::default()));
        let mut scope = ServiceScope::default();
        track_wire(&mut scope, &self.connection, &log);

        let conn = Rc::clone(&self.connection);
        let (serial, output, on) = (self.serial, self.output, self.on);
        connect_scoped(&mut scope, &self.connection, |c| &c.connection_made, move |_: &()| {
            let data = format!("{:02}{}", output, u8::from(on));
            conn.send_telegram(
                serial,
                SystemFunction::WriteConfig,
                Some(DatapointId::OutputState),
                data.as_bytes(),
            );
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
        let response = OutputResponse {
            serial: self.serial,
            output: self.output,
            on: self.on,
            acked: self.acked.get(),
            exchange: log.borrow().to_exchange(status, started),
        };
        self.on_finish.emit(&response);
        response
    }
}
