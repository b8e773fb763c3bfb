//! Family-aware action-table download.
//!
//! Devices encode their tables per family, so this service first reads
//! `MODULE_TYPE_CODE`, picks the matching serializer and only then walks
//! the rows like the plain download. Modules without table storage fail
//! the operation up front.

use std::cell::RefCell;
use std::rc::Rc;

use conbus_proto::action_table::{ActionTable, ActionTableEntry, serializer_for};
use conbus_proto::module_type::{self, ActionTableFamily};
use conbus_proto::{
    DatapointId, SerialNumber, SystemFunction, Telegram, datapoint, display_bytes,
};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use super::{Exchange, ResponseStatus, ServiceScope, WireLog, connect_scoped, track_wire};
use crate::protocol::ConbusConnection;
use crate::signal::Signal;

/// Result of a family-aware download.
#[derive(Debug, Clone, Serialize)]
pub struct MsActionTableResponse {
    /// Queried device.
    pub serial: SerialNumber,
    /// Resolved module-type name, when the identity read answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_type: Option<String>,
    /// Decoded table, terminator excluded.
    pub table: ActionTable,
    /// Raw row bodies as received.
    pub raw_rows: Vec<String>,
    /// Human lines, one per entry.
    pub short_lines: Vec<String>,
    /// Shared outcome fields.
    #[serde(flatten)]
    pub exchange: Exchange,
}

#[derive(Default)]
struct MsState {
    family: Option<ActionTableFamily>,
    module_type: Option<String>,
    entries: Vec<ActionTableEntry>,
    raw_rows: Vec<String>,
    next_row: u8,
    complete: bool,
    error: Option<String>,
}

/// Downloads an action table after resolving the device family.
pub struct MsActionTableService {
    connection: Rc<ConbusConnection>,
    serial: SerialNumber,
    state: RefCell<MsState>,

    /// Fires with the short line of every decoded row.
    pub on_progress: Signal<String>,
    /// Fires once with the final response.
    pub on_finish: Signal<MsActionTableResponse>,
}

impl MsActionTableService {
    /// Create a family-aware download service.
    #[must_use]
    pub fn new(connection: Rc<ConbusConnection>, serial: SerialNumber) -> Rc<Self> {
        Rc::new(Self {
            connection,
            serial,
            state: RefCell::new(MsState::default()),
            on_progress: Signal::new(),
            on_finish: Signal::new(),
        })
    }

    /// Replace the per-step window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Run one download scope.
    pub async fn run(self: Rc<Self>) -> MsActionTableResponse {
        *self.state.borrow_mut() = MsState::default();
        let started = Instant::now();
        let log = Rc::new(RefCell::new(WireLog::default()));
        let mut scope = ServiceScope::default();
        track_wire(&mut scope, &self.connection, &log);

        let conn = Rc::clone(&self.connection);
        let serial = self.serial;
        connect_scoped(&mut scope, &self.connection, |c| &c.connection_made, move |_: &()| {
            conn.send_telegram(
                serial,
                SystemFunction::ReadDatapoint,
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
            own.on_progress.clear();
            own.on_finish.clear();
        });

        let outcome = self.connection.run().await;
        let state = self.state.borrow();
        let status = match outcome {
            Err(_) => ResponseStatus::FailedConnection,
            Ok(()) if state.error.is_some() => ResponseStatus::Failed,
            Ok(()) if state.complete => ResponseStatus::Ok,
            Ok(()) => ResponseStatus::PartialTimeout,
        };
        let mut exchange = log.borrow().to_exchange(status, started);
        if let Some(error) = state.error.clone() {
            exchange.error.get_or_insert(error);
        }
        let table = ActionTable { entries: state.entries.clone() };
        let response = MsActionTableResponse {
            serial: self.serial,
            module_type: state.module_type.clone(),
            short_lines: table.short_lines(),
            table,
            raw_rows: state.raw_rows.clone(),
            exchange,
        };
        drop(state);
        self.on_finish.emit(&response);
        response
    }

    fn on_telegram(&self, telegram: &Telegram) {
        let mut state = self.state.borrow_mut();
        if state.complete || state.error.is_some() {
            return;
        }
        if state.family.is_none() {
            // Step one: resolve the family from the identity read.
            if !telegram.is_reply(self.serial, SystemFunction::ReadDatapoint)
                || telegram.datapoint() != Some(DatapointId::ModuleTypeCode)
            {
                return;
            }
            let data = telegram.data().unwrap_or_default();
            let code = match datapoint::parse_value(DatapointId::ModuleTypeCode, data) {
                Ok(datapoint::DatapointValue::Int(code)) => u8::try_from(code).ok(),
                _ => None,
            };
            let Some(code) = code else {
                state.error = Some(format!("bad module type reply {:?}", display_bytes(data)));
                self.connection.stop();
                return;
            };
            state.module_type =
                module_type::by_code(code).map(|info| info.name.to_owned());
            match module_type::family_of(code) {
                Some(family) => {
                    state.family = Some(family);
                    drop(state);
                    self.request_row(0);
                }
                None => {
                    state.error = Some(format!("module type {code} stores no action table"));
                    self.connection.stop();
                }
            }
            return;
        }
        if telegram.is_reply(self.serial, SystemFunction::EndOfTable) {
            state.complete = true;
            self.connection.stop();
            return;
        }
        if !telegram.is_reply(self.serial, SystemFunction::ReadActionTable) {
            return;
        }
        let family = state.family.unwrap_or(ActionTableFamily::Xp20);
        let row = telegram.data().unwrap_or_default();
        match serializer_for(family).decode_row(row) {
            Ok(entry) if entry.is_terminator() => {
                state.complete = true;
                self.connection.stop();
            }
            Ok(entry) => {
                state.raw_rows.push(display_bytes(row));
                state.entries.push(entry);
                state.next_row = state.next_row.saturating_add(1);
                let next = state.next_row;
                drop(state);
                self.on_progress.emit(&entry.short_line());
                self.request_row(next);
            }
            Err(error) => {
                tracing::warn!(%error, "undecodable action table row");
                state.error = Some(error.to_string());
                self.connection.stop();
            }
        }
    }

    fn request_row(&self, row: u8) {
        self.connection.send_telegram(
            self.serial,
            SystemFunction::ReadActionTable,
            Some(DatapointId::from_code(row)),
            b"",
        );
    }
}
