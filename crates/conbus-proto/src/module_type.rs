//! Module-type registry.
//!
//! Module-type codes are small, non-contiguous integers assigned by the
//! vendor. The table below is the authoritative subset this toolkit
//! understands; unknown codes are still carried on the wire, they just
//! have no registry entry.

use serde::Serialize;

/// Broad category of a module type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleCategory {
    /// Placeholder codes with no physical module.
    System,
    /// Relay output modules.
    Relay,
    /// Dimmer output modules.
    Dimmer,
    /// Push-button panels and interfaces.
    PushButton,
    /// Bus couplers and gateways.
    Interface,
}

/// Action-table encoding family of a module type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionTableFamily {
    /// Push-button panel tables (XP20 and relatives).
    Xp20,
    /// Relay module tables (XP24).
    Xp24,
    /// Dimmer module tables (XP33 and relatives).
    Xp33,
}

/// One registry entry.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModuleTypeInfo {
    /// Numeric wire code.
    pub code: u8,
    /// Vendor name.
    pub name: &'static str,
    /// Short description.
    pub description: &'static str,
    /// Category.
    pub category: ModuleCategory,
    /// Relay or dimmer output channels.
    pub outputs: u8,
    /// Push-button inputs.
    pub inputs: u8,
    /// Whether the outputs are dimmable.
    pub dimmable: bool,
}

/// The authoritative module-type table.
pub const MODULE_TYPES: &[ModuleTypeInfo] = &[
    ModuleTypeInfo {
        code: 0,
        name: "NOMOD",
        description: "No module",
        category: ModuleCategory::System,
        outputs: 0,
        inputs: 0,
        dimmable: false,
    },
    ModuleTypeInfo {
        code: 1,
        name: "ALLMOD",
        description: "Broadcast to all modules",
        category: ModuleCategory::System,
        outputs: 0,
        inputs: 0,
        dimmable: false,
    },
    ModuleTypeInfo {
        code: 2,
        name: "CP20",
        description: "Push button console",
        category: ModuleCategory::PushButton,
        outputs: 0,
        inputs: 8,
        dimmable: false,
    },
    ModuleTypeInfo {
        code: 7,
        name: "XP24",
        description: "4-channel relay module",
        category: ModuleCategory::Relay,
        outputs: 4,
        inputs: 0,
        dimmable: false,
    },
    ModuleTypeInfo {
        code: 8,
        name: "XP31UNI",
        description: "1-channel universal dimmer",
        category: ModuleCategory::Dimmer,
        outputs: 1,
        inputs: 0,
        dimmable: true,
    },
    ModuleTypeInfo {
        code: 11,
        name: "XP33",
        description: "3-channel dimmer module",
        category: ModuleCategory::Dimmer,
        outputs: 3,
        inputs: 0,
        dimmable: true,
    },
    ModuleTypeInfo {
        code: 13,
        name: "XP130",
        description: "Ethernet bus coupler",
        category: ModuleCategory::Interface,
        outputs: 0,
        inputs: 0,
        dimmable: false,
    },
    ModuleTypeInfo {
        code: 14,
        name: "XP2606",
        description: "6-button wall panel",
        category: ModuleCategory::PushButton,
        outputs: 0,
        inputs: 6,
        dimmable: false,
    },
    ModuleTypeInfo {
        code: 22,
        name: "XPX1_8",
        description: "8-input extension",
        category: ModuleCategory::PushButton,
        outputs: 0,
        inputs: 8,
        dimmable: false,
    },
    ModuleTypeInfo {
        code: 23,
        name: "XP134",
        description: "4-input interface",
        category: ModuleCategory::PushButton,
        outputs: 0,
        inputs: 4,
        dimmable: false,
    },
    ModuleTypeInfo {
        code: 30,
        name: "XP33LR",
        description: "3-channel dimmer, resistive/inductive loads",
        category: ModuleCategory::Dimmer,
        outputs: 3,
        inputs: 0,
        dimmable: true,
    },
    ModuleTypeInfo {
        code: 33,
        name: "XP20",
        description: "8-input push button interface",
        category: ModuleCategory::PushButton,
        outputs: 0,
        inputs: 8,
        dimmable: false,
    },
    ModuleTypeInfo {
        code: 34,
        name: "XP230",
        description: "Bus power and gateway module",
        category: ModuleCategory::Interface,
        outputs: 0,
        inputs: 0,
        dimmable: false,
    },
    ModuleTypeInfo {
        code: 36,
        name: "XP33LED",
        description: "3-channel LED dimmer",
        category: ModuleCategory::Dimmer,
        outputs: 3,
        inputs: 0,
        dimmable: true,
    },
    ModuleTypeInfo {
        code: 37,
        name: "XP31LED",
        description: "1-channel LED dimmer",
        category: ModuleCategory::Dimmer,
        outputs: 1,
        inputs: 0,
        dimmable: true,
    },
];

/// Look up a module type by wire code.
#[must_use]
pub fn by_code(code: u8) -> Option<&'static ModuleTypeInfo> {
    MODULE_TYPES.iter().find(|info| info.code == code)
}

/// Look up a module type by name, case-insensitively.
#[must_use]
pub fn by_name(name: &str) -> Option<&'static ModuleTypeInfo> {
    MODULE_TYPES.iter().find(|info| info.name.eq_ignore_ascii_case(name))
}

/// Action-table family of a module-type code, when it stores tables.
#[must_use]
pub fn family_of(code: u8) -> Option<ActionTableFamily> {
    match code {
        2 | 33 => Some(ActionTableFamily::Xp20),
        7 => Some(ActionTableFamily::Xp24),
        8 | 11 | 30 | 36 | 37 => Some(ActionTableFamily::Xp33),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_code_and_name_agree() {
        let xp24 = by_code(7).unwrap();
        assert_eq!(xp24.name, "XP24");
        assert_eq!(by_name("xp24").unwrap().code, 7);
        assert!(by_code(99).is_none());
        assert!(by_name("XP999").is_none());
    }

    #[test]
    fn codes_are_unique() {
        for (i, a) in MODULE_TYPES.iter().enumerate() {
            for b in &MODULE_TYPES[i + 1..] {
                assert_ne!(a.code, b.code);
            }
        }
    }

    #[test]
    fn families_follow_capabilities() {
        assert_eq!(family_of(33), Some(ActionTableFamily::Xp20));
        assert_eq!(family_of(7), Some(ActionTableFamily::Xp24));
        assert_eq!(family_of(30), Some(ActionTableFamily::Xp33));
        assert_eq!(family_of(13), None);
    }
}
