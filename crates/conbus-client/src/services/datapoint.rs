//! Single datapoint read.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use conbus_proto::datapoint::{self, DatapointValue};
use conbus_proto::{DatapointId, SerialNumber, SystemFunction, Telegram, display_bytes};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use super::{Exchange, ResponseStatus, ServiceScope, WireLog, connect_scoped, track_wire};
use crate::protocol::ConbusConnection;
use crate::signal::Signal;

/// Result of one datapoint read.
#[derive(Debug, Clone, Serialize)]
pub struct ReadDatapointResponse {
    /// Queried device.
    pub serial: SerialNumber,
    /// Queried datapoint name.
    pub datapoint: &'static str,
    /// Raw reply data, when a reply arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    /// Parsed value, when the reply matched the registry grammar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<DatapointValue>,
    /// Shared outcome fields.
    #[serde(flatten)]
    pub exchange: Exchange,
}

/// Reads one datapoint from one module.
pub struct ReadDatapointService {
    connection: Rc<ConbusConnection>,
    serial: SerialNumber,
    datapoint: DatapointId,
    reading: RefCell<Option<(String, Option<DatapointValue>)>>,
    parse_error: RefCell<Option<String>>,
    done: Cell<bool>,

    /// Fires once with the final response.
    pub on_finish: Signal<ReadDatapointResponse>,
}

impl ReadDatapointService {
    /// Create a read service for `(serial, datapoint)`.
    #[must_use]
    pub fn new(
        connection: Rc<ConbusConnection>,
        serial: SerialNumber,
        datapoint: DatapointId,
    ) -> Rc<Self> {
        Rc::new(Self {
            connection,
            serial,
            datapoint,
            reading: RefCell::new(None),
            parse_error: RefCell::new(None),
            done: Cell::new(false),
            on_finish: Signal::new(),
        })
    }

    /// Replace the reply window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Run one read scope.
    pub async fn run(self: Rc<Self>) -> ReadDatapointResponse {
        *self.reading.borrow_mut() = None;
        *self.parse_error.borrow_mut() = None;
        self.done.set(false);
        let started = Instant::now();
        let log = Rc::new(RefCell::new(WireLog::default()));
        let mut scope = ServiceScope::default();
        track_wire(&mut scope, &self.connection, &log);

        let conn = Rc::clone(&self.connection);
        let (serial, datapoint) = (self.serial, self.datapoint);
        connect_scoped(&mut scope, &self.connection, |c| &c.connection_made, move |_: &()| {
            conn.send_telegram(serial, SystemFunction::ReadDatapoint, Some(datapoint), b"");
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
            Ok(()) if self.done.get() => ResponseStatus::Ok,
            Ok(()) => {
                log.borrow_mut().error.get_or_insert_with(|| "no reply before timeout".to_owned());
                ResponseStatus::Failed
            }
        };
        let mut exchange = log.borrow().to_exchange(status, started);
        if let Some(parse_error) = self.parse_error.borrow().clone() {
            exchange.error.get_or_insert(parse_error);
        }
        let reading = self.reading.borrow().clone();
        let response = ReadDatapointResponse {
            serial: self.serial,
            datapoint: self.datapoint.name(),
            raw: reading.as_ref().map(|(raw, _)| raw.clone()),
            value: reading.and_then(|(_, value)| value),
            exchange,
        };
        self.on_finish.emit(&response);
        response
    }

    fn on_telegram(&self, telegram: &Telegram) {
        if self.done.get()
            || !telegram.is_reply(self.serial, SystemFunction::ReadDatapoint)
            || telegram.datapoint() != Some(self.datapoint)
        {
            return;
        }
        let data = telegram.data().unwrap_or_default();
        let raw = display_bytes(data);
        let value = match datapoint::parse_value(self.datapoint, data) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(%error, "reply did not match the datapoint grammar");
                *self.parse_error.borrow_mut() = Some(error.to_string());
                None
            }
        };
        *self.reading.borrow_mut() = Some((raw, value));
        self.done.set(true);
        self.connection.stop();
    }
}
