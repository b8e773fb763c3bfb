//! Custom telegram exchange.
//!
//! Builds one System telegram from caller-chosen function, datapoint and
//! data, then collects every reply from the addressed serial until the
//! rolling timeout. The escape hatch for functions the richer services do
//! not model.

use std::cell::RefCell;
use std::rc::Rc;

use conbus_proto::{DatapointId, SerialNumber, SystemFunction, Telegram, payload_bytes};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use super::{Exchange, ResponseStatus, ServiceScope, WireLog, connect_scoped, track_wire};
use crate::protocol::ConbusConnection;
use crate::signal::Signal;

/// Result of a custom exchange.
#[derive(Debug, Clone, Serialize)]
pub struct CustomResponse {
    /// Addressed device.
    pub serial: SerialNumber,
    /// Function code sent.
    pub function: u8,
    /// Replies from the addressed serial, as text.
    pub replies: Vec<String>,
    /// Shared outcome fields.
    #[serde(flatten)]
    pub exchange: Exchange,
}

/// Sends one caller-built telegram and listens for its replies.
pub struct CustomService {
    connection: Rc<ConbusConnection>,
    serial: SerialNumber,
    function: SystemFunction,
    datapoint: Option<DatapointId>,
    data: String,
    replies: RefCell<Vec<String>>,

    /// Fires once with the final response.
    pub on_finish: Signal<CustomResponse>,
}

impl CustomService {
    /// Create a custom service for one telegram.
    #[must_use]
    pub fn new(
        connection: Rc<ConbusConnection>,
        serial: SerialNumber,
        function: SystemFunction,
        datapoint: Option<DatapointId>,
        data: impl Into<String>,
    ) -> Rc<Self> {
        Rc::new(Self {
            connection,
            serial,
            function,
            datapoint,
            data: data.into(),
            replies: RefCell::new(Vec::new()),
            on_finish: Signal::new(),
        })
    }

    /// Replace the listen window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Run one custom scope.
    pub async fn run(self: Rc<Self>) -> CustomResponse {
        self.replies.borrow_mut().clear();
        let started = Instant::now();
        let log = Rc::new(RefCell::new(WireLog::default()));
        let mut scope = ServiceScope::default();
        track_wire(&mut scope, &self.connection, &log);

        let conn = Rc::clone(&self.connection);
        let (serial, function, datapoint) = (self.serial, self.function, self.datapoint);
        let data = payload_bytes(&self.data);
        connect_scoped(&mut scope, &self.connection, |c| &c.connection_made, move |_: &()| {
            conn.send_telegram(serial, function, datapoint, &data);
        });

        let me = Rc::clone(&self);
        connect_scoped(&mut scope, &self.connection, |c| &c.telegram_received, move |t: &Telegram| {
            if t.serial() == Some(me.serial)
                && t.telegram_type() == conbus_proto::TelegramType::Reply
            {
                me.replies.borrow_mut().push(t.frame_display());
            }
        });

        let own = Rc::clone(&self);
        scope.defer(move || own.on_finish.clear());

        let outcome = self.connection.run().await;
        let replies = self.replies.borrow().clone();
        let status = match outcome {
            Err(_) => ResponseStatus::FailedConnection,
            Ok(()) if replies.is_empty() => ResponseStatus::PartialTimeout,
            Ok(()) => ResponseStatus::Ok,
        };
        let response = CustomResponse {
            serial: self.serial,
            function: self.function.code(),
            replies,
            exchange: log.borrow().to_exchange(status, started),
        };
        self.on_finish.emit(&response);
        response
    }
}
