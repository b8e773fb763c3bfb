//! Action-table download and upload.
//!
//! Download walks the table row by row: `F11D{row}` requests, one decoded
//! entry per reply, until the device answers `F12` end-of-table or sends
//! the all-zero terminator row. Upload mirrors it with `F13D{row}{data}`
//! writes, one in flight at a time, each acknowledged, closed by an
//! `F12D{count}` marker; the CRC32-nibble of the concatenated rows is
//! reported for integrity logging.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use conbus_proto::action_table::{
    ActionTable, ActionTableEntry, ActionTableSerializer, serializer_for,
};
use conbus_proto::checksum::crc32_nibble;
use conbus_proto::module_type::ActionTableFamily;
use conbus_proto::{DatapointId, SerialNumber, SystemFunction, Telegram, display_bytes};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use super::{Exchange, ResponseStatus, ServiceScope, WireLog, connect_scoped, track_wire};
use crate::protocol::ConbusConnection;
use crate::signal::Signal;

/// Result of an action-table download.
#[derive(Debug, Clone, Serialize)]
pub struct ActionTableResponse {
    /// Queried device.
    pub serial: SerialNumber,
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
struct DownloadState {
    entries: Vec<ActionTableEntry>,
    raw_rows: Vec<String>,
    next_row: u8,
    complete: bool,
    decode_error: Option<String>,
}

/// Downloads the action table of one module.
pub struct ActionTableDownloadService {
    connection: Rc<ConbusConnection>,
    serial: SerialNumber,
    family: ActionTableFamily,
    state: RefCell<DownloadState>,

    /// Fires with the short line of every decoded row.
    pub on_progress: Signal<String>,
    /// Fires once with the final response.
    pub on_finish: Signal<ActionTableResponse>,
}

impl ActionTableDownloadService {
    /// Create a download service; the family picks the row serializer.
    #[must_use]
    pub fn new(
        connection: Rc<ConbusConnection>,
        serial: SerialNumber,
        family: ActionTableFamily,
    ) -> Rc<Self> {
        Rc::new(Self {
            connection,
            serial,
            family,
            state: RefCell::new(DownloadState::default()),
            on_progress: Signal::new(),
            on_finish: Signal::new(),
        })
    }

    /// Replace the per-row window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Run one download scope.
    pub async fn run(self: Rc<Self>) -> ActionTableResponse {
        *self.state.borrow_mut() = DownloadState::default();
        let started = Instant::now();
        let log = Rc::new(RefCell::new(WireLog::default()));
        let mut scope = ServiceScope::default();
        track_wire(&mut scope, &self.connection, &log);

        let conn = Rc::clone(&self.connection);
        let serial = self.serial;
        connect_scoped(&mut scope, &self.connection, |c| &c.connection_made, move |_: &()| {
            request_row(&conn, serial, 0);
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
            Ok(()) if state.decode_error.is_some() => ResponseStatus::Failed,
            Ok(()) if state.complete => ResponseStatus::Ok,
            Ok(()) => ResponseStatus::PartialTimeout,
        };
        let mut exchange = log.borrow().to_exchange(status, started);
        if let Some(decode_error) = state.decode_error.clone() {
            exchange.error.get_or_insert(decode_error);
        }
        let table = ActionTable { entries: state.entries.clone() };
        let response = ActionTableResponse {
            serial: self.serial,
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
        if state.complete || state.decode_error.is_some() {
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
        let row = telegram.data().unwrap_or_default();
        match serializer_for(self.family).decode_row(row) {
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
                request_row(&self.connection, self.serial, next);
            }
            Err(error) => {
                tracing::warn!(%error, "undecodable action table row");
                state.decode_error = Some(error.to_string());
                self.connection.stop();
            }
        }
    }
}

fn request_row(connection: &ConbusConnection, serial: SerialNumber, row: u8) {
    connection.send_telegram(
        serial,
        SystemFunction::ReadActionTable,
        Some(DatapointId::from_code(row)),
        b"",
    );
}

/// Result of an action-table upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    /// Written device.
    pub serial: SerialNumber,
    /// Rows written.
    pub rows: usize,
    /// CRC32-nibble of the concatenated encoded rows.
    pub integrity: String,
    /// Shared outcome fields.
    #[serde(flatten)]
    pub exchange: Exchange,
}

#[derive(Default)]
struct UploadState {
    next_row: usize,
    end_sent: bool,
    complete: bool,
}

/// Uploads an action table to one module, one acknowledged row at a time.
pub struct ActionTableUploadService {
    connection: Rc<ConbusConnection>,
    serial: SerialNumber,
    family: ActionTableFamily,
    entries: Vec<ActionTableEntry>,
    state: RefCell<UploadState>,
    acked_rows: Cell<usize>,

    /// Fires with the short line of every acknowledged row.
    pub on_progress: Signal<String>,
    /// Fires once with the final response.
    pub on_finish: Signal<UploadResponse>,
}

impl ActionTableUploadService {
    /// Create an upload service for the given entries.
    #[must_use]
    pub fn new(
        connection: Rc<ConbusConnection>,
        serial: SerialNumber,
        family: ActionTableFamily,
        entries: Vec<ActionTableEntry>,
    ) -> Rc<Self> {
        Rc::new(Self {
            connection,
            serial,
            family,
            entries,
            state: RefCell::new(UploadState::default()),
            acked_rows: Cell::new(0),
            on_progress: Signal::new(),
            on_finish: Signal::new(),
        })
    }

    /// Replace the per-row window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    fn serializer(&self) -> &'static dyn ActionTableSerializer {
        serializer_for(self.family)
    }

    /// Run one upload scope.
    pub async fn run(self: Rc<Self>) -> UploadResponse {
        *self.state.borrow_mut() = UploadState::default();
        self.acked_rows.set(0);
        let started = Instant::now();
        let log = Rc::new(RefCell::new(WireLog::default()));
        let mut scope = ServiceScope::default();
        track_wire(&mut scope, &self.connection, &log);

        let me = Rc::clone(&self);
        connect_scoped(&mut scope, &self.connection, |c| &c.connection_made, move |_: &()| {
            me.send_next();
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
        let complete = self.state.borrow().complete;
        let status = match outcome {
            Err(_) => ResponseStatus::FailedConnection,
            Ok(()) if complete => ResponseStatus::Ok,
            Ok(()) => {
                log.borrow_mut().error.get_or_insert_with(|| {
                    format!(
                        "{} of {} rows acknowledged before timeout",
                        self.acked_rows.get(),
                        self.entries.len()
                    )
                });
                ResponseStatus::FailedWrite
            }
        };
        let encoded: Vec<u8> =
            self.entries.iter().flat_map(|e| self.serializer().encode_row(e)).collect();
        let response = UploadResponse {
            serial: self.serial,
            rows: self.entries.len(),
            integrity: display_bytes(&crc32_nibble(&encoded)),
            exchange: log.borrow().to_exchange(status, started),
        };
        self.on_finish.emit(&response);
        response
    }

    /// Send the next pending row, or the end marker once rows ran out.
    fn send_next(&self) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = self.entries.get(state.next_row) {
            let row = state.next_row;
            let body = self.serializer().encode_row(entry);
            state.next_row += 1;
            drop(state);
            self.connection.send_telegram(
                self.serial,
                SystemFunction::WriteActionTable,
                Some(DatapointId::from_code(u8::try_from(row).unwrap_or(u8::MAX))),
                &body,
            );
        } else if !state.end_sent {
            state.end_sent = true;
            drop(state);
            let count = u8::try_from(self.entries.len()).unwrap_or(u8::MAX);
            self.connection.send_telegram(
                self.serial,
                SystemFunction::EndOfTable,
                Some(DatapointId::from_code(count)),
                b"",
            );
        }
    }

    fn on_telegram(&self, telegram: &Telegram) {
        if self.state.borrow().complete || !telegram.is_ack_from(self.serial) {
            return;
        }
        if !telegram.checksum_valid() {
            tracing::warn!(serial = %self.serial, "acknowledge with bad checksum accepted");
        }
        let (finished, progressed) = {
            let state = self.state.borrow();
            if state.end_sent {
                (true, None)
            } else {
                let row = self.acked_rows.get();
                (false, self.entries.get(row).map(ActionTableEntry::short_line))
            }
        };
        if finished {
            self.state.borrow_mut().complete = true;
            self.connection.stop();
        } else {
            self.acked_rows.set(self.acked_rows.get() + 1);
            if let Some(line) = progressed {
                self.on_progress.emit(&line);
            }
            self.send_next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_integrity_is_stable_for_same_rows() {
        let entries: Vec<ActionTableEntry> =
            vec!["XP20 10 0 > 0 OFF".parse().unwrap(), "XP20 10 1 > 1 ON".parse().unwrap()];
        let encoded: Vec<u8> = entries
            .iter()
            .flat_map(|e| serializer_for(ActionTableFamily::Xp20).encode_row(e))
            .collect();
        let a = display_bytes(&crc32_nibble(&encoded));
        let b = display_bytes(&crc32_nibble(&encoded));
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }
}
