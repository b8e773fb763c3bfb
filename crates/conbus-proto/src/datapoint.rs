//! Datapoint registry: ids, names and typed value parsers.
//!
//! Every readable or writable property of a module is a datapoint,
//! addressed by a two-digit id. The registry maps each known id to a
//! human name and a parser that turns the raw reply data into a
//! [`DatapointValue`]. Unknown ids round-trip as [`DatapointId::Other`]
//! and parse to opaque text.

use std::fmt;

use serde::Serialize;

use crate::telegram::display_bytes;
use crate::{ProtocolError, Result};

/// A datapoint id: the two wire digits after `D` in read/write telegrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DatapointId {
    /// `00`: numeric module-type code.
    ModuleTypeCode,
    /// `01`: module-type name.
    ModuleType,
    /// `02`: link number on the bus.
    LinkNumber,
    /// `03`: module number.
    ModuleNumber,
    /// `04`: firmware version string.
    SoftwareVersion,
    /// `05`: hardware revision string.
    HardwareVersion,
    /// `06`: whether the module pushes status changes unsolicited.
    AutoReport,
    /// `10`: last error code, two hex digits, `00` when healthy.
    ModuleErrorCode,
    /// `12`: relay output states.
    OutputState,
    /// `15`: dimmer levels per channel.
    LightLevel,
    /// `17`: supply voltage.
    Voltage,
    /// `18`: module temperature.
    Temperature,
    /// Any id this registry does not know.
    Other(u8),
}

impl DatapointId {
    /// The seven identity datapoints queried by scan and export.
    pub const IDENTITY: [DatapointId; 7] = [
        Self::ModuleTypeCode,
        Self::ModuleType,
        Self::LinkNumber,
        Self::ModuleNumber,
        Self::SoftwareVersion,
        Self::HardwareVersion,
        Self::AutoReport,
    ];

    /// Every id with a registry entry.
    pub const KNOWN: [DatapointId; 12] = [
        Self::ModuleTypeCode,
        Self::ModuleType,
        Self::LinkNumber,
        Self::ModuleNumber,
        Self::SoftwareVersion,
        Self::HardwareVersion,
        Self::AutoReport,
        Self::ModuleErrorCode,
        Self::OutputState,
        Self::LightLevel,
        Self::Voltage,
        Self::Temperature,
    ];

    /// Numeric wire code.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::ModuleTypeCode => 0,
            Self::ModuleType => 1,
            Self::LinkNumber => 2,
            Self::ModuleNumber => 3,
            Self::SoftwareVersion => 4,
            Self::HardwareVersion => 5,
            Self::AutoReport => 6,
            Self::ModuleErrorCode => 10,
            Self::OutputState => 12,
            Self::LightLevel => 15,
            Self::Voltage => 17,
            Self::Temperature => 18,
            Self::Other(code) => code,
        }
    }

    /// Map a wire code to an id.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::ModuleTypeCode,
            1 => Self::ModuleType,
            2 => Self::LinkNumber,
            3 => Self::ModuleNumber,
            4 => Self::SoftwareVersion,
            5 => Self::HardwareVersion,
            6 => Self::AutoReport,
            10 => Self::ModuleErrorCode,
            12 => Self::OutputState,
            15 => Self::LightLevel,
            17 => Self::Voltage,
            18 => Self::Temperature,
            other => Self::Other(other),
        }
    }

    /// Registry name, or `DP{code}` for unknown ids.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ModuleTypeCode => "MODULE_TYPE_CODE",
            Self::ModuleType => "MODULE_TYPE",
            Self::LinkNumber => "LINK_NUMBER",
            Self::ModuleNumber => "MODULE_NUMBER",
            Self::SoftwareVersion => "SOFTWARE_VERSION",
            Self::HardwareVersion => "HARDWARE_VERSION",
            Self::AutoReport => "AUTO_REPORT",
            Self::ModuleErrorCode => "MODULE_ERROR_CODE",
            Self::OutputState => "OUTPUT_STATE",
            Self::LightLevel => "LIGHT_LEVEL",
            Self::Voltage => "VOLTAGE",
            Self::Temperature => "TEMPERATURE",
            Self::Other(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for DatapointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02} {}", self.code(), self.name())
    }
}

/// A parsed datapoint value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatapointValue {
    /// Plain decimal integer.
    Int(i64),
    /// On/off flag.
    Flag(bool),
    /// Opaque text, Latin-1 decoded.
    Text(String),
    /// Relay output states, index 0 first.
    Outputs(Vec<bool>),
    /// Dimmer levels as (channel, percent) pairs.
    Levels(Vec<(u8, u8)>),
    /// A measurement with a one-letter unit (`V`, `C`).
    Measurement {
        /// Numeric value.
        value: f64,
        /// Unit letter following the `§` marker.
        unit: char,
    },
    /// Module error code; `0x00` means healthy.
    ErrorCode(u8),
}

/// Parse reply data for a datapoint according to its registry grammar.
pub fn parse_value(id: DatapointId, data: &[u8]) -> Result<DatapointValue> {
    let text = display_bytes(data);
    match id {
        DatapointId::ModuleTypeCode
        | DatapointId::LinkNumber
        | DatapointId::ModuleNumber => parse_int(id, &text).map(DatapointValue::Int),
        DatapointId::AutoReport => {
            parse_int(id, &text).map(|flag| DatapointValue::Flag(flag != 0))
        }
        DatapointId::ModuleType
        | DatapointId::SoftwareVersion
        | DatapointId::HardwareVersion
        | DatapointId::Other(_) => Ok(DatapointValue::Text(text)),
        DatapointId::ModuleErrorCode => parse_error_code(id, &text),
        DatapointId::OutputState => parse_outputs(id, &text),
        DatapointId::LightLevel => parse_levels(id, &text),
        DatapointId::Voltage | DatapointId::Temperature => parse_measurement(id, &text),
    }
}

fn parse_failure(id: DatapointId, raw: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::ParseValue { name: id.name(), raw: raw.to_owned(), reason: reason.into() }
}

fn parse_int(id: DatapointId, text: &str) -> Result<i64> {
    text.trim()
        .parse()
        .map_err(|_| parse_failure(id, text, "expected a decimal integer"))
}

fn parse_error_code(id: DatapointId, text: &str) -> Result<DatapointValue> {
    let trimmed = text.trim();
    if trimmed.len() != 2 || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(parse_failure(id, text, "expected two hex digits"));
    }
    u8::from_str_radix(trimmed, 16)
        .map(DatapointValue::ErrorCode)
        .map_err(|_| parse_failure(id, text, "expected two hex digits"))
}

/// `xxxxBBBB`: the four rightmost characters are the output bits; output 0
/// is the rightmost.
fn parse_outputs(id: DatapointId, text: &str) -> Result<DatapointValue> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < 4 {
        return Err(parse_failure(id, text, "expected at least four state characters"));
    }
    let mut outputs = Vec::with_capacity(4);
    for &c in chars[chars.len() - 4..].iter().rev() {
        match c {
            '0' => outputs.push(false),
            '1' => outputs.push(true),
            other => {
                return Err(parse_failure(id, text, format!("unexpected state character {other:?}")));
            }
        }
    }
    Ok(DatapointValue::Outputs(outputs))
}

/// `NN:PPP[%]` pairs, comma separated.
fn parse_levels(id: DatapointId, text: &str) -> Result<DatapointValue> {
    let mut levels = Vec::new();
    for pair in text.trim().split(',') {
        let (channel, percent) = pair
            .split_once(':')
            .ok_or_else(|| parse_failure(id, text, format!("pair {pair:?} has no colon")))?;
        let channel = channel
            .trim()
            .parse()
            .map_err(|_| parse_failure(id, text, format!("bad channel in {pair:?}")))?;
        let percent: u8 = percent
            .trim()
            .trim_end_matches('%')
            .parse()
            .map_err(|_| parse_failure(id, text, format!("bad percent in {pair:?}")))?;
        if percent > 100 {
            return Err(parse_failure(id, text, format!("percent {percent} out of range")));
        }
        levels.push((channel, percent));
    }
    Ok(DatapointValue::Levels(levels))
}

/// `±DD,D§U`: signed decimal with a comma separator, `§` before the unit.
fn parse_measurement(id: DatapointId, text: &str) -> Result<DatapointValue> {
    let (number, unit) = text
        .trim()
        .split_once('§')
        .ok_or_else(|| parse_failure(id, text, "missing unit marker"))?;
    let mut units = unit.chars();
    let unit = units
        .next()
        .filter(|_| units.next().is_none())
        .ok_or_else(|| parse_failure(id, text, "expected a one-letter unit"))?;
    let value = number
        .replace(',', ".")
        .parse()
        .map_err(|_| parse_failure(id, text, "expected a signed decimal"))?;
    Ok(DatapointValue::Measurement { value, unit })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip_for_known_ids() {
        for id in DatapointId::KNOWN {
            assert_eq!(DatapointId::from_code(id.code()), id);
        }
        assert_eq!(DatapointId::from_code(99), DatapointId::Other(99));
    }

    #[test]
    fn output_state_index_zero_is_rightmost() {
        let value = parse_value(DatapointId::OutputState, b"xxxx1110").unwrap();
        assert_eq!(value, DatapointValue::Outputs(vec![false, true, true, true]));
    }

    #[test]
    fn output_state_rejects_foreign_bits() {
        assert!(parse_value(DatapointId::OutputState, b"xxxx12a0").is_err());
    }

    #[test]
    fn light_level_pairs() {
        let value = parse_value(DatapointId::LightLevel, b"00:100%,01:050%").unwrap();
        assert_eq!(value, DatapointValue::Levels(vec![(0, 100), (1, 50)]));
    }

    #[test]
    fn voltage_with_comma_and_unit() {
        let value = parse_value(DatapointId::Voltage, "+12,5§V".as_bytes()).unwrap();
        assert_eq!(value, DatapointValue::Measurement { value: 12.5, unit: 'V' });
    }

    #[test]
    fn temperature_from_latin1_bytes() {
        let value = parse_value(DatapointId::Temperature, b"+31,5\xA7C").unwrap();
        assert_eq!(value, DatapointValue::Measurement { value: 31.5, unit: 'C' });
    }

    #[test]
    fn negative_measurement() {
        let value = parse_value(DatapointId::Temperature, b"-03,5\xA7C").unwrap();
        assert_eq!(value, DatapointValue::Measurement { value: -3.5, unit: 'C' });
    }

    #[test]
    fn error_code_healthy_and_storm() {
        assert_eq!(
            parse_value(DatapointId::ModuleErrorCode, b"00").unwrap(),
            DatapointValue::ErrorCode(0)
        );
        assert_eq!(
            parse_value(DatapointId::ModuleErrorCode, b"FE").unwrap(),
            DatapointValue::ErrorCode(0xFE)
        );
        assert!(parse_value(DatapointId::ModuleErrorCode, b"GZ").is_err());
    }

    #[test]
    fn identity_ints_and_flags() {
        assert_eq!(
            parse_value(DatapointId::LinkNumber, b"07").unwrap(),
            DatapointValue::Int(7)
        );
        assert_eq!(
            parse_value(DatapointId::AutoReport, b"01").unwrap(),
            DatapointValue::Flag(true)
        );
        assert_eq!(
            parse_value(DatapointId::SoftwareVersion, b"XP24_V0.34.03").unwrap(),
            DatapointValue::Text("XP24_V0.34.03".to_owned())
        );
    }
}
