//! The module-list document shape.
//!
//! One YAML document describes a set of modules: the emulator reads it to
//! build its device table, and the export service writes it back from live
//! bus answers. Fields beyond the serial are optional so a partial export
//! (some datapoints unanswered at timeout) emits only what was observed.

use serde::{Deserialize, Serialize};

use crate::telegram::SerialNumber;

/// One module record in a module-list document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    /// Free-form label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Factory serial number; the only required field.
    pub serial_number: SerialNumber,

    /// Module-type name, e.g. `XP24`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_type: Option<String>,

    /// Numeric module-type code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_type_code: Option<u8>,

    /// Link number on the bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_number: Option<u8>,

    /// Module number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_number: Option<u16>,

    /// Firmware version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,

    /// Hardware revision string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,

    /// Auto-report flag, `on` or `off`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_report_status: Option<String>,

    /// Action-table lines in short form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_table: Option<Vec<String>>,

    /// Canned datapoint values keyed by id, for the emulator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datapoints: Option<std::collections::BTreeMap<u8, String>>,

    /// Datapoint ids this module never answers, for failure injection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silent_datapoints: Option<Vec<u8>>,
}

impl ModuleDefinition {
    /// A minimal record carrying only a serial.
    #[must_use]
    pub fn bare(serial_number: SerialNumber) -> Self {
        Self {
            name: None,
            serial_number,
            module_type: None,
            module_type_code: None,
            link_number: None,
            module_number: None,
            sw_version: None,
            hw_version: None,
            auto_report_status: None,
            action_table: None,
            datapoints: None,
            silent_datapoints: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_record_serializes_to_serial_only() {
        let record = ModuleDefinition::bare("0020030837".parse().unwrap());
        let yaml = serde_yaml::to_string(&record).unwrap();
        assert_eq!(yaml.lines().count(), 1, "optional fields must be skipped: {yaml}");
        let parsed: ModuleDefinition = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn full_record_round_trips() {
        let yaml = "\
name: bedroom relays
serial_number: \"0020044966\"
module_type: XP24
module_type_code: 7
link_number: 1
module_number: 12
sw_version: XP24_V0.34.03
hw_version: XP24_HW_REV_B
auto_report_status: \"on\"
action_table:
  - XP20 10 0 > 0 OFF
datapoints:
  12: xxxx1110
";
        let record: ModuleDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(record.module_type_code, Some(7));
        assert_eq!(record.auto_report_status.as_deref(), Some("on"));
        assert_eq!(record.datapoints.as_ref().unwrap()[&12], "xxxx1110");

        let again: ModuleDefinition =
            serde_yaml::from_str(&serde_yaml::to_string(&record).unwrap()).unwrap();
        assert_eq!(again, record);
    }
}
