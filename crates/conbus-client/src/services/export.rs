//! Bus inventory export.
//!
//! Discovery followed by an identity fan-out: for every responder the
//! seven identity datapoints are queried, completion is tracked per
//! serial, and the result is written as a module-list YAML document in
//! the same shape the emulator consumes, so an exported bus can be
//! replayed. Devices that answered only partially are emitted with just
//! the fields observed.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use conbus_proto::datapoint::DatapointValue;
use conbus_proto::{
    DatapointId, ModuleDefinition, SerialNumber, SystemFunction, Telegram, datapoint,
};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use super::{Exchange, ResponseStatus, ServiceScope, WireLog, connect_scoped, track_wire};
use crate::protocol::ConbusConnection;
use crate::signal::Signal;

/// Identity answers collected for one device.
#[derive(Debug, Default, Clone)]
struct DeviceIdentity {
    module_type_code: Option<u8>,
    module_type: Option<String>,
    link_number: Option<u8>,
    module_number: Option<u16>,
    sw_version: Option<String>,
    hw_version: Option<String>,
    auto_report: Option<bool>,
}

impl DeviceIdentity {
    fn complete(&self) -> bool {
        self.module_type_code.is_some()
            && self.module_type.is_some()
            && self.link_number.is_some()
            && self.module_number.is_some()
            && self.sw_version.is_some()
            && self.hw_version.is_some()
            && self.auto_report.is_some()
    }

    fn into_definition(self, serial: SerialNumber) -> ModuleDefinition {
        let mut definition = ModuleDefinition::bare(serial);
        definition.module_type_code = self.module_type_code;
        definition.module_type = self.module_type;
        definition.link_number = self.link_number;
        definition.module_number = self.module_number;
        definition.sw_version = self.sw_version;
        definition.hw_version = self.hw_version;
        definition.auto_report_status =
            self.auto_report.map(|on| if on { "on".to_owned() } else { "off".to_owned() });
        definition
    }
}

/// Result of an export run.
#[derive(Debug, Clone, Serialize)]
pub struct ExportResponse {
    /// Output file.
    pub path: PathBuf,
    /// Exported records, sorted by link number with unknowns last.
    pub devices: Vec<ModuleDefinition>,
    /// Shared outcome fields.
    #[serde(flatten)]
    pub exchange: Exchange,
}

/// Exports the live bus inventory to a module-list YAML file.
pub struct ExportService {
    connection: Rc<ConbusConnection>,
    path: PathBuf,
    devices: RefCell<BTreeMap<SerialNumber, DeviceIdentity>>,

    /// Fires per newly discovered device.
    pub on_device_found: Signal<SerialNumber>,
    /// Fires once with the final response.
    pub on_finish: Signal<ExportResponse>,
}

impl ExportService {
    /// Create an export service writing to `path`.
    #[must_use]
    pub fn new(connection: Rc<ConbusConnection>, path: impl Into<PathBuf>) -> Rc<Self> {
        Rc::new(Self {
            connection,
            path: path.into(),
            devices: RefCell::new(BTreeMap::new()),
            on_device_found: Signal::new(),
            on_finish: Signal::new(),
        })
    }

    /// Replace the operation window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Run one export scope.
    pub async fn run(self: Rc<Self>) -> ExportResponse {
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
            me.on_telegram(t);
        });

        let own = Rc::clone(&self);
        scope.defer(move || {
            own.on_device_found.clear();
            own.on_finish.clear();
        });

        let outcome = self.connection.run().await;
        let all_complete = {
            let devices = self.devices.borrow();
            !devices.is_empty() && devices.values().all(DeviceIdentity::complete)
        };
        let records = self.sorted_records();
        let status = match outcome {
            Err(_) => ResponseStatus::FailedConnection,
            Ok(()) if records.is_empty() => {
                log.borrow_mut().error.get_or_insert_with(|| "no devices answered".to_owned());
                ResponseStatus::FailedNoDevices
            }
            Ok(()) => match self.write_document(&records) {
                Err(error) => {
                    tracing::warn!(%error, path = %self.path.display(), "export write failed");
                    log.borrow_mut().error.get_or_insert(error);
                    ResponseStatus::FailedWrite
                }
                Ok(()) if all_complete => ResponseStatus::Ok,
                Ok(()) => ResponseStatus::PartialTimeout,
            },
        };
        let response = ExportResponse {
            path: self.path.clone(),
            devices: records,
            exchange: log.borrow().to_exchange(status, started),
        };
        self.on_finish.emit(&response);
        response
    }

    fn on_telegram(&self, telegram: &Telegram) {
        let Some(serial) = telegram.serial() else { return };
        if telegram.is_reply(serial, SystemFunction::Discover) {
            let fresh = {
                let mut devices = self.devices.borrow_mut();
                if devices.contains_key(&serial) {
                    false
                } else {
                    devices.insert(serial, DeviceIdentity::default());
                    true
                }
            };
            if fresh {
                self.on_device_found.emit(&serial);
                for id in DatapointId::IDENTITY {
                    self.connection.send_telegram(
                        serial,
                        SystemFunction::ReadDatapoint,
                        Some(id),
                        b"",
                    );
                }
            }
            return;
        }
        if !telegram.is_reply(serial, SystemFunction::ReadDatapoint) {
            return;
        }
        let Some(id) = telegram.datapoint() else { return };
        if !DatapointId::IDENTITY.contains(&id) {
            return;
        }
        let data = telegram.data().unwrap_or_default();
        let parsed = datapoint::parse_value(id, data);
        {
            let mut devices = self.devices.borrow_mut();
            let Some(identity) = devices.get_mut(&serial) else {
                tracing::warn!(%serial, "identity reply from undiscovered device");
                return;
            };
            match (id, parsed) {
                (DatapointId::ModuleTypeCode, Ok(DatapointValue::Int(code))) => {
                    identity.module_type_code = u8::try_from(code).ok();
                }
                (DatapointId::ModuleType, Ok(DatapointValue::Text(text))) => {
                    identity.module_type = Some(text);
                }
                (DatapointId::LinkNumber, Ok(DatapointValue::Int(link))) => {
                    identity.link_number = u8::try_from(link).ok();
                }
                (DatapointId::ModuleNumber, Ok(DatapointValue::Int(number))) => {
                    identity.module_number = u16::try_from(number).ok();
                }
                (DatapointId::SoftwareVersion, Ok(DatapointValue::Text(text))) => {
                    identity.sw_version = Some(text);
                }
                (DatapointId::HardwareVersion, Ok(DatapointValue::Text(text))) => {
                    identity.hw_version = Some(text);
                }
                (DatapointId::AutoReport, Ok(DatapointValue::Flag(on))) => {
                    identity.auto_report = Some(on);
                }
                (_, Err(error)) => {
                    tracing::warn!(%serial, %error, "identity reply did not parse");
                }
                _ => {}
            }
        }
        let devices = self.devices.borrow();
        if !devices.is_empty() && devices.values().all(DeviceIdentity::complete) {
            self.connection.stop();
        }
    }

    fn sorted_records(&self) -> Vec<ModuleDefinition> {
        let mut records: Vec<ModuleDefinition> = self
            .devices
            .borrow()
            .iter()
            .map(|(serial, identity)| identity.clone().into_definition(*serial))
            .collect();
        records.sort_by_key(|record| {
            (record.link_number.is_none(), record.link_number.unwrap_or(0), record.serial_number)
        });
        records
    }

    fn write_document(&self, records: &[ModuleDefinition]) -> Result<(), String> {
        let yaml = serde_yaml::to_string(records)
            .map_err(|e| format!("cannot serialize module list: {e}"))?;
        std::fs::write(&self.path, yaml)
            .map_err(|e| format!("cannot write {}: {e}", self.path.display()))
    }
}
