//! Emulated modules.
//!
//! Each configured module is a small state machine answering system
//! telegrams the way the real hardware does: discovery, datapoint reads
//! from canned or identity values, acknowledged configuration writes,
//! LED blinking and row-wise action-table access.
//!
//! Dimmer modules of the XP33 family additionally model the storm failure
//! mode: a read of datapoint `99` drops the module into `Storm`, where
//! every inbound frame except a `MODULE_ERROR_CODE` read triggers a burst
//! of 200 copies of the last normal reply. Reading the error code answers
//! `FE` once and restores normal operation.

use std::collections::{BTreeMap, BTreeSet};

use conbus_proto::action_table::{ActionTableEntry, ActionTableSerializer, serializer_for};
use conbus_proto::module_type::{self, ActionTableFamily};
use conbus_proto::{
    DatapointId, ModuleDefinition, SerialNumber, SystemFunction, Telegram, TelegramBody,
    display_bytes,
};
use tokio::time::Duration;

use crate::error::ServerError;

/// Datapoint id whose read triggers the storm failure mode.
const STORM_TRIGGER: u8 = 99;

/// Copies of the last reply emitted per storm burst.
const STORM_COPIES: usize = 200;

/// Spacing between storm copies.
const STORM_SPACING: Duration = Duration::from_millis(1);

/// One outbound effect of handling a telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReply {
    /// Broadcast one frame.
    Frame(Vec<u8>),
    /// Broadcast `copies` of `frame`, spaced by `spacing`.
    Burst {
        /// Frame to repeat.
        frame: Vec<u8>,
        /// Number of copies.
        copies: usize,
        /// Delay between copies.
        spacing: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Normal,
    Storm,
}

/// One emulated module.
#[derive(Debug)]
pub struct EmulatedModule {
    serial: SerialNumber,
    module_type_code: u8,
    module_type: String,
    link_number: u8,
    module_number: u16,
    sw_version: String,
    hw_version: String,
    auto_report: bool,
    led_blinking: bool,
    error_code: u8,
    datapoints: BTreeMap<u8, String>,
    silent: BTreeSet<u8>,
    action_table: Vec<ActionTableEntry>,
    state: DeviceState,
    last_reply: Vec<u8>,
}

impl EmulatedModule {
    /// Build a module from one configuration record.
    pub fn from_definition(definition: &ModuleDefinition) -> Result<Self, ServerError> {
        let serial = definition.serial_number;
        let module_type_code = definition.module_type_code.unwrap_or(0);
        let module_type = definition
            .module_type
            .clone()
            .or_else(|| module_type::by_code(module_type_code).map(|info| info.name.to_owned()))
            .unwrap_or_else(|| "NOMOD".to_owned());
        let action_table = definition
            .action_table
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|line| {
                line.parse::<ActionTableEntry>().map_err(|e| {
                    ServerError::Config(format!("module {serial}: bad action table line: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            serial,
            module_type_code,
            module_type,
            link_number: definition.link_number.unwrap_or(0),
            module_number: definition.module_number.unwrap_or(0),
            sw_version: definition.sw_version.clone().unwrap_or_else(|| "V0.00.00".to_owned()),
            hw_version: definition.hw_version.clone().unwrap_or_else(|| "HW_REV_A".to_owned()),
            auto_report: definition.auto_report_status.as_deref() == Some("on"),
            led_blinking: false,
            error_code: 0,
            datapoints: definition.datapoints.clone().unwrap_or_default(),
            silent: definition.silent_datapoints.iter().flatten().copied().collect(),
            action_table,
            state: DeviceState::Normal,
            // Seed so a storm has something to spew even before any
            // normal exchange happened.
            last_reply: Telegram::reply(serial, SystemFunction::Discover, None, b"")
                .frame()
                .to_vec(),
        })
    }

    /// This module's serial.
    #[must_use]
    pub fn serial(&self) -> SerialNumber {
        self.serial
    }

    /// Whether the module LED is currently blinking.
    #[must_use]
    pub fn blinking(&self) -> bool {
        self.led_blinking
    }

    fn family(&self) -> Option<ActionTableFamily> {
        module_type::family_of(self.module_type_code)
    }

    fn serializer(&self) -> &'static dyn ActionTableSerializer {
        serializer_for(self.family().unwrap_or(ActionTableFamily::Xp20))
    }

    /// Answer one inbound telegram.
    pub fn handle(&mut self, telegram: &Telegram) -> Vec<DeviceReply> {
        let TelegramBody::Addressed { serial, function, datapoint, data } = telegram.body() else {
            return Vec::new();
        };
        if *serial != self.serial && !serial.is_broadcast() {
            return Vec::new();
        }

        if self.state == DeviceState::Storm {
            return self.handle_storm(*function, *datapoint);
        }

        match function {
            SystemFunction::Discover => {
                self.reply(Telegram::reply(self.serial, SystemFunction::Discover, None, b""))
            }
            SystemFunction::ReadDatapoint => self.read_datapoint(*datapoint),
            SystemFunction::WriteConfig => self.write_config(*datapoint, data),
            SystemFunction::Blink => {
                self.led_blinking = true;
                self.ack()
            }
            SystemFunction::Unblink => {
                self.led_blinking = false;
                self.ack()
            }
            SystemFunction::ReadActionTable => self.read_action_table_row(*datapoint),
            SystemFunction::WriteActionTable => self.write_action_table_row(*datapoint, data),
            SystemFunction::EndOfTable => self.ack(),
            other => {
                tracing::debug!(serial = %self.serial, function = ?other, "unhandled function");
                Vec::new()
            }
        }
    }

    fn handle_storm(
        &mut self,
        function: SystemFunction,
        datapoint: Option<DatapointId>,
    ) -> Vec<DeviceReply> {
        if function == SystemFunction::ReadDatapoint
            && datapoint == Some(DatapointId::ModuleErrorCode)
        {
            tracing::info!(serial = %self.serial, "storm cleared by error code read");
            self.state = DeviceState::Normal;
            self.error_code = 0;
            let reply = Telegram::reply(
                self.serial,
                SystemFunction::ReadDatapoint,
                Some(DatapointId::ModuleErrorCode),
                b"FE",
            );
            // The FE answer is the storm's last word, not a reply to keep.
            return vec![DeviceReply::Frame(reply.frame().to_vec())];
        }
        vec![DeviceReply::Burst {
            frame: self.last_reply.clone(),
            copies: STORM_COPIES,
            spacing: STORM_SPACING,
        }]
    }

    fn read_datapoint(&mut self, datapoint: Option<DatapointId>) -> Vec<DeviceReply> {
        let Some(id) = datapoint else { return Vec::new() };
        if id.code() == STORM_TRIGGER && self.family() == Some(ActionTableFamily::Xp33) {
            tracing::info!(serial = %self.serial, "entering storm mode");
            self.state = DeviceState::Storm;
            self.error_code = 0xFE;
            return vec![DeviceReply::Burst {
                frame: self.last_reply.clone(),
                copies: STORM_COPIES,
                spacing: STORM_SPACING,
            }];
        }
        if self.silent.contains(&id.code()) {
            tracing::debug!(serial = %self.serial, id = id.code(), "configured to stay silent");
            return Vec::new();
        }
        let Some(value) = self.datapoint_value(id) else {
            tracing::debug!(serial = %self.serial, id = id.code(), "no value for datapoint");
            return Vec::new();
        };
        // Values are configured as text; the wire wants Latin-1 bytes so
        // unit markers like `§` stay single bytes.
        self.reply(Telegram::reply(
            self.serial,
            SystemFunction::ReadDatapoint,
            Some(id),
            &conbus_proto::payload_bytes(&value),
        ))
    }

    fn datapoint_value(&self, id: DatapointId) -> Option<String> {
        if let Some(canned) = self.datapoints.get(&id.code()) {
            return Some(canned.clone());
        }
        match id {
            DatapointId::ModuleTypeCode => Some(format!("{:02}", self.module_type_code)),
            DatapointId::ModuleType => Some(self.module_type.clone()),
            DatapointId::LinkNumber => Some(format!("{:02}", self.link_number)),
            DatapointId::ModuleNumber => Some(format!("{:02}", self.module_number)),
            DatapointId::SoftwareVersion => Some(self.sw_version.clone()),
            DatapointId::HardwareVersion => Some(self.hw_version.clone()),
            DatapointId::AutoReport => Some(if self.auto_report { "01" } else { "00" }.to_owned()),
            DatapointId::ModuleErrorCode => Some(format!("{:02X}", self.error_code)),
            DatapointId::OutputState => Some("xxxx0000".to_owned()),
            _ => None,
        }
    }

    fn write_config(&mut self, datapoint: Option<DatapointId>, data: &[u8]) -> Vec<DeviceReply> {
        let Some(id) = datapoint else { return Vec::new() };
        let text = display_bytes(data);
        match id {
            DatapointId::LinkNumber => {
                if let Ok(link) = text.trim().parse() {
                    self.link_number = link;
                }
            }
            DatapointId::ModuleNumber => {
                if let Ok(number) = text.trim().parse() {
                    self.module_number = number;
                }
            }
            DatapointId::AutoReport => {
                self.auto_report = text.trim().parse::<u8>().map(|v| v != 0).unwrap_or(false);
            }
            _ => {
                self.datapoints.insert(id.code(), text);
            }
        }
        self.ack()
    }

    fn read_action_table_row(&mut self, datapoint: Option<DatapointId>) -> Vec<DeviceReply> {
        let row = usize::from(datapoint.map_or(0, DatapointId::code));
        match self.action_table.get(row) {
            Some(entry) => {
                let body = self.serializer().encode_row(entry);
                self.reply(Telegram::reply(
                    self.serial,
                    SystemFunction::ReadActionTable,
                    datapoint,
                    &body,
                ))
            }
            None => {
                self.reply(Telegram::reply(self.serial, SystemFunction::EndOfTable, None, b""))
            }
        }
    }

    fn write_action_table_row(
        &mut self,
        datapoint: Option<DatapointId>,
        data: &[u8],
    ) -> Vec<DeviceReply> {
        match self.serializer().decode_row(data) {
            Ok(entry) => {
                let row = usize::from(datapoint.map_or(0, DatapointId::code));
                if row < self.action_table.len() {
                    self.action_table[row] = entry;
                } else {
                    self.action_table.push(entry);
                }
                self.ack()
            }
            Err(error) => {
                tracing::warn!(serial = %self.serial, %error, "rejecting bad action table row");
                Vec::new()
            }
        }
    }

    fn ack(&mut self) -> Vec<DeviceReply> {
        self.reply(Telegram::ack(self.serial))
    }

    fn reply(&mut self, telegram: Telegram) -> Vec<DeviceReply> {
        let frame = telegram.frame().to_vec();
        self.last_reply = frame.clone();
        vec![DeviceReply::Frame(frame)]
    }
}

/// All emulated modules of one gateway.
#[derive(Debug, Default)]
pub struct DeviceTable {
    modules: Vec<EmulatedModule>,
}

impl DeviceTable {
    /// Build the table from configuration records.
    pub fn from_definitions(definitions: &[ModuleDefinition]) -> Result<Self, ServerError> {
        let modules = definitions
            .iter()
            .map(EmulatedModule::from_definition)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { modules })
    }

    /// Number of configured modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// True when no modules are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Offer one inbound telegram to every module.
    pub fn handle(&mut self, telegram: &Telegram) -> Vec<DeviceReply> {
        self.modules.iter_mut().flat_map(|module| module.handle(telegram)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xp24(serial: &str) -> EmulatedModule {
        let mut definition = ModuleDefinition::bare(serial.parse().unwrap());
        definition.module_type_code = Some(7);
        definition.link_number = Some(1);
        EmulatedModule::from_definition(&definition).unwrap()
    }

    fn xp33lr(serial: &str) -> EmulatedModule {
        let mut definition = ModuleDefinition::bare(serial.parse().unwrap());
        definition.module_type_code = Some(30);
        EmulatedModule::from_definition(&definition).unwrap()
    }

    fn parse(frame: &[u8]) -> Telegram {
        Telegram::parse(frame).unwrap()
    }

    fn single_frame(replies: Vec<DeviceReply>) -> Telegram {
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            DeviceReply::Frame(frame) => parse(frame),
            DeviceReply::Burst { .. } => panic!("expected a single frame"),
        }
    }

    #[test]
    fn answers_broadcast_discover() {
        let mut module = xp24("0020030837");
        let reply = single_frame(module.handle(&parse(b"<S0000000000F01D00FA>")));
        assert!(reply.is_reply("0020030837".parse().unwrap(), SystemFunction::Discover));
    }

    #[test]
    fn ignores_other_serials() {
        let mut module = xp24("0020030837");
        let telegram =
            Telegram::system("0099999999".parse().unwrap(), SystemFunction::Discover, None, b"");
        assert!(module.handle(&telegram).is_empty());
    }

    #[test]
    fn reads_identity_and_canned_datapoints() {
        let mut definition = ModuleDefinition::bare("0020044966".parse().unwrap());
        definition.module_type_code = Some(7);
        definition.datapoints = Some([(12u8, "xxxx1110".to_owned())].into_iter().collect());
        let mut module = EmulatedModule::from_definition(&definition).unwrap();

        let read = Telegram::system(
            module.serial(),
            SystemFunction::ReadDatapoint,
            Some(DatapointId::OutputState),
            b"",
        );
        let reply = single_frame(module.handle(&read));
        assert_eq!(reply.data(), Some(&b"xxxx1110"[..]));

        let read = Telegram::system(
            module.serial(),
            SystemFunction::ReadDatapoint,
            Some(DatapointId::ModuleTypeCode),
            b"",
        );
        let reply = single_frame(module.handle(&read));
        assert_eq!(reply.data(), Some(&b"07"[..]));
    }

    #[test]
    fn write_config_acks_and_persists() {
        let mut module = xp24("0020044966");
        let write = Telegram::system(
            module.serial(),
            SystemFunction::WriteConfig,
            Some(DatapointId::LinkNumber),
            b"05",
        );
        let reply = single_frame(module.handle(&write));
        assert!(reply.is_ack_from(module.serial()));

        let read = Telegram::system(
            module.serial(),
            SystemFunction::ReadDatapoint,
            Some(DatapointId::LinkNumber),
            b"",
        );
        let reply = single_frame(module.handle(&read));
        assert_eq!(reply.data(), Some(&b"05"[..]));
    }

    #[test]
    fn blink_toggles_the_led_and_acks() {
        let mut module = xp24("0020044964");
        let blink = parse(b"<S0020044964F05D00FN>");
        let reply = single_frame(module.handle(&blink));
        assert_eq!(reply.frame(), b"<R0020044964F18DFA>");
        assert!(module.blinking());

        let unblink = Telegram::system(module.serial(), SystemFunction::Unblink, None, b"");
        let reply = single_frame(module.handle(&unblink));
        assert!(reply.is_ack_from(module.serial()));
        assert!(!module.blinking());
    }

    #[test]
    fn action_table_rows_then_end_of_table() {
        let mut definition = ModuleDefinition::bare("0020044966".parse().unwrap());
        definition.module_type_code = Some(7);
        definition.action_table = Some(vec!["XP20 10 0 > 0 OFF".to_owned()]);
        let mut module = EmulatedModule::from_definition(&definition).unwrap();

        let row0 = Telegram::system(
            module.serial(),
            SystemFunction::ReadActionTable,
            Some(DatapointId::from_code(0)),
            b"",
        );
        let reply = single_frame(module.handle(&row0));
        assert_eq!(reply.function(), Some(SystemFunction::ReadActionTable));
        assert_eq!(reply.data(), Some(&b"3310000002"[..]));

        let row1 = Telegram::system(
            module.serial(),
            SystemFunction::ReadActionTable,
            Some(DatapointId::from_code(1)),
            b"",
        );
        let reply = single_frame(module.handle(&row1));
        assert_eq!(reply.function(), Some(SystemFunction::EndOfTable));
    }

    #[test]
    fn storm_trigger_bursts_and_error_read_recovers() {
        let mut module = xp33lr("0012345003");

        // Normal read first, so the burst repeats something meaningful.
        let read = Telegram::system(
            module.serial(),
            SystemFunction::ReadDatapoint,
            Some(DatapointId::ModuleTypeCode),
            b"",
        );
        let normal = single_frame(module.handle(&read));

        let trigger = Telegram::system(
            module.serial(),
            SystemFunction::ReadDatapoint,
            Some(DatapointId::from_code(99)),
            b"",
        );
        let replies = module.handle(&trigger);
        match &replies[..] {
            [DeviceReply::Burst { frame, copies, .. }] => {
                assert_eq!(*copies, STORM_COPIES);
                assert_eq!(frame, &normal.frame().to_vec());
            }
            other => panic!("expected a burst, got {other:?}"),
        }

        // Any other traffic keeps the storm going.
        let replies = module.handle(&read);
        assert!(matches!(replies[..], [DeviceReply::Burst { .. }]));

        // The error code read answers FE once and clears the storm.
        let error_read = Telegram::system(
            module.serial(),
            SystemFunction::ReadDatapoint,
            Some(DatapointId::ModuleErrorCode),
            b"",
        );
        let reply = single_frame(module.handle(&error_read));
        assert_eq!(reply.data(), Some(&b"FE"[..]));

        // Back to normal; the next error read reports healthy.
        let reply = single_frame(module.handle(&error_read));
        assert_eq!(reply.data(), Some(&b"00"[..]));
    }

    #[test]
    fn non_dimmer_ignores_storm_trigger() {
        let mut module = xp24("0020044966");
        let trigger = Telegram::system(
            module.serial(),
            SystemFunction::ReadDatapoint,
            Some(DatapointId::from_code(99)),
            b"",
        );
        assert!(module.handle(&trigger).is_empty());
    }

    #[test]
    fn device_table_fans_discover_to_all_modules() {
        let definitions = vec![
            ModuleDefinition::bare("0020030837".parse().unwrap()),
            ModuleDefinition::bare("0020044966".parse().unwrap()),
            ModuleDefinition::bare("0020042796".parse().unwrap()),
        ];
        let mut table = DeviceTable::from_definitions(&definitions).unwrap();
        let replies = table.handle(&parse(b"<S0000000000F01D00FA>"));
        assert_eq!(replies.len(), 3);
    }
}
