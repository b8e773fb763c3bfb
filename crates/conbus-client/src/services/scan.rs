//! Full datapoint scan of one module.
//!
//! Queries every registry datapoint of a single serial and reports each
//! answer, parsed where the grammar allows. Finishes early once every id
//! answered; otherwise the rolling timeout delivers a partial scan.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use conbus_proto::datapoint::{self, DatapointValue};
use conbus_proto::{DatapointId, SerialNumber, SystemFunction, Telegram, display_bytes};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use super::{Exchange, ResponseStatus, ServiceScope, WireLog, connect_scoped, track_wire};
use crate::protocol::ConbusConnection;
use crate::signal::Signal;

/// One answered datapoint in a scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReading {
    /// Datapoint name.
    pub datapoint: &'static str,
    /// Wire id.
    pub id: u8,
    /// Raw reply data.
    pub raw: String,
    /// Parsed value, when the grammar matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<DatapointValue>,
    /// Parse failure text otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

/// Result of a scan run.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResponse {
    /// Scanned device.
    pub serial: SerialNumber,
    /// Answered datapoints in id order.
    pub readings: Vec<ScanReading>,
    /// Shared outcome fields.
    #[serde(flatten)]
    pub exchange: Exchange,
}

/// Scans every known datapoint of one module.
pub struct ScanService {
    connection: Rc<ConbusConnection>,
    serial: SerialNumber,
    readings: RefCell<BTreeMap<u8, ScanReading>>,

    /// Fires per answered datapoint.
    pub on_progress: Signal<ScanReading>,
    /// Fires once with the final response.
    pub on_finish: Signal<ScanResponse>,
}

impl ScanService {
    /// Create a scan service for one serial.
    #[must_use]
    pub fn new(connection: Rc<ConbusConnection>, serial: SerialNumber) -> Rc<Self> {
        Rc::new(Self {
            connection,
            serial,
            readings: RefCell::new(BTreeMap::new()),
            on_progress: Signal::new(),
            on_finish: Signal::new(),
        })
    }

    /// Replace the reply window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Run one scan scope.
    pub async fn run(self: Rc<Self>) -> ScanResponse {
        self.readings.borrow_mut().clear();
        let started = Instant::now();
        let log = Rc::new(RefCell::new(WireLog::default()));
        let mut scope = ServiceScope::default();
        track_wire(&mut scope, &self.connection, &log);

        let conn = Rc::clone(&self.connection);
        let serial = self.serial;
        connect_scoped(&mut scope, &self.connection, |c| &c.connection_made, move |_: &()| {
            for id in DatapointId::KNOWN {
                conn.send_telegram(serial, SystemFunction::ReadDatapoint, Some(id), b"");
            }
        });

        let me = Rc::clone(&self);
        connect_scoped(&mut scope, &self.connection, |c| &c.telegram_received, move |t: &Telegram| {
            me.on_telegram(t);
        });

        let own = Rc::clone(&self);
        scope.defer(move || {
            own.on_progress.clear();
            own.on_finish.clear();
        });

        let outcome = self.connection.run().await;
        let status = match outcome {
            Err(_) => ResponseStatus::FailedConnection,
            Ok(()) if self.complete() => ResponseStatus::Ok,
            Ok(()) => ResponseStatus::PartialTimeout,
        };
        let response = ScanResponse {
            serial: self.serial,
            readings: self.readings.borrow().values().cloned().collect(),
            exchange: log.borrow().to_exchange(status, started),
        };
        self.on_finish.emit(&response);
        response
    }

    fn complete(&self) -> bool {
        self.readings.borrow().len() == DatapointId::KNOWN.len()
    }

    fn on_telegram(&self, telegram: &Telegram) {
        if !telegram.is_reply(self.serial, SystemFunction::ReadDatapoint) {
            return;
        }
        let Some(id) = telegram.datapoint() else { return };
        if !DatapointId::KNOWN.contains(&id) {
            return;
        }
        let data = telegram.data().unwrap_or_default();
        let reading = match datapoint::parse_value(id, data) {
            Ok(value) => ScanReading {
                datapoint: id.name(),
                id: id.code(),
                raw: display_bytes(data),
                value: Some(value),
                parse_error: None,
            },
            Err(error) => ScanReading {
                datapoint: id.name(),
                id: id.code(),
                raw: display_bytes(data),
                value: None,
                parse_error: Some(error.to_string()),
            },
        };
        let fresh = self.readings.borrow_mut().insert(id.code(), reading.clone()).is_none();
        if fresh {
            self.on_progress.emit(&reading);
        }
        if self.complete() {
            self.connection.stop();
        }
    }
}
