//! Operation services.
//!
//! Each service composes one meaningful operation out of the protocol
//! engine's signals: it installs handlers, drives a small state machine
//! (send, await responses, finalize) and surfaces a typed response. All
//! services follow the same scoped lifecycle:
//!
//! - `run()` resets state, connects exactly the handlers it needs and
//!   awaits the engine's reactor;
//! - the operation ends on completion (the service stops the reactor), on
//!   the rolling timeout, or on a connection failure;
//! - `on_finish` fires at most once, then every handler this scope
//!   installed is disconnected and the service's own signals are cleared,
//!   on every exit path.
//!
//! A service in its finished state is inert until run again.

use std::rc::Rc;

use conbus_proto::Telegram;
use serde::Serialize;
use tokio::time::Instant;

use crate::protocol::ConbusConnection;
use crate::signal::Signal;

pub mod actiontable;
pub mod blink;
pub mod custom;
pub mod datapoint;
pub mod discover;
pub mod export;
pub mod ms_actiontable;
pub mod output;
pub mod raw;
pub mod scan;
pub mod write;

pub use actiontable::{
    ActionTableDownloadService, ActionTableResponse, ActionTableUploadService, UploadResponse,
};
pub use blink::{BlinkAllResponse, BlinkAllService, BlinkResponse, BlinkService};
pub use custom::{CustomResponse, CustomService};
pub use datapoint::{ReadDatapointResponse, ReadDatapointService};
pub use discover::{DiscoverResponse, DiscoverService};
pub use export::{ExportResponse, ExportService};
pub use ms_actiontable::{MsActionTableResponse, MsActionTableService};
pub use output::{OutputResponse, OutputService};
pub use raw::{RawResponse, RawService};
pub use scan::{ScanReading, ScanResponse, ScanService};
pub use write::{WriteDatapointResponse, WriteDatapointService};

/// Outcome tag of a finished operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    /// Everything the operation asked for arrived.
    Ok,
    /// The rolling timeout fired first; partial results are included.
    PartialTimeout,
    /// Discovery-based operation found no devices at all.
    FailedNoDevices,
    /// A write was not acknowledged, or an output file could not be
    /// written.
    FailedWrite,
    /// TCP failed before or during the operation.
    FailedConnection,
    /// Any other declared failure; see the error text.
    Failed,
}

impl ResponseStatus {
    /// True only for [`ResponseStatus::Ok`].
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// The part every response record shares.
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    /// Outcome tag.
    pub status: ResponseStatus,
    /// True iff `status` is `OK`.
    pub success: bool,
    /// Frames written to the transport during this scope, as text.
    pub sent_telegrams: Vec<String>,
    /// Frames received during this scope, as text.
    pub received_telegrams: Vec<String>,
    /// Failure text, when any failure signal fired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the scope in milliseconds.
    pub elapsed_ms: u64,
}

/// Per-run wire traffic accumulated through the engine's signals.
#[derive(Debug, Default)]
pub(crate) struct WireLog {
    pub sent: Vec<String>,
    pub received: Vec<String>,
    pub error: Option<String>,
}

impl WireLog {
    pub fn to_exchange(&self, status: ResponseStatus, started: Instant) -> Exchange {
        Exchange {
            status,
            success: status.is_ok(),
            sent_telegrams: self.sent.clone(),
            received_telegrams: self.received.clone(),
            error: self.error.clone(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Deferred cleanup that runs on every exit path of a service scope.
#[derive(Default)]
pub(crate) struct ServiceScope {
    cleanup: Vec<Box<dyn FnOnce()>>,
}

impl ServiceScope {
    /// Register cleanup to run when the scope drops.
    pub fn defer(&mut self, cleanup: impl FnOnce() + 'static) {
        self.cleanup.push(Box::new(cleanup));
    }
}

impl Drop for ServiceScope {
    fn drop(&mut self) {
        for cleanup in self.cleanup.drain(..) {
            cleanup();
        }
    }
}

/// Connect `handler` to one of the engine's signals for the lifetime of
/// `scope`.
pub(crate) fn connect_scoped<T: 'static>(
    scope: &mut ServiceScope,
    connection: &Rc<ConbusConnection>,
    signal: fn(&ConbusConnection) -> &Signal<T>,
    handler: impl Fn(&T) + 'static,
) {
    let id = signal(connection).connect(handler);
    let connection = Rc::clone(connection);
    scope.defer(move || {
        signal(&connection).disconnect(id);
    });
}

/// Mirror sent/received/failed traffic into a [`WireLog`] for the lifetime
/// of `scope`.
pub(crate) fn track_wire(
    scope: &mut ServiceScope,
    connection: &Rc<ConbusConnection>,
    log: &Rc<std::cell::RefCell<WireLog>>,
) {
    let sent_log = Rc::clone(log);
    connect_scoped(scope, connection, |c| &c.telegram_sent, move |frame: &String| {
        sent_log.borrow_mut().sent.push(frame.clone());
    });
    let received_log = Rc::clone(log);
    connect_scoped(scope, connection, |c| &c.telegram_received, move |t: &Telegram| {
        received_log.borrow_mut().received.push(t.frame_display());
    });
    let error_log = Rc::clone(log);
    connect_scoped(scope, connection, |c| &c.failed, move |message: &String| {
        let mut log = error_log.borrow_mut();
        if log.error.is_none() {
            log.error = Some(message.clone());
        }
    });
}
