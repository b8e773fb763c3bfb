//! Action tables: programmed input-to-output behaviour lines.
//!
//! A module stores a table of entries, each binding a source input (panel
//! type, link, input) to a target output and an action. On the wire a row
//! travels as decimal digit pairs inside `F11`/`F13` telegrams; in YAML
//! and on screen it is the short form `XP20 10 0 > 0 OFF`.
//!
//! Relay and dimmer families pack rows differently; the serializers below
//! are variants of one trait and are chosen by the module-type family.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::module_type::{self, ActionTableFamily};
use crate::telegram::display_bytes;
use crate::{ProtocolError, Result};

/// Actions an entry can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActionTableAction {
    /// `0`: no action.
    Void,
    /// `1`: switch the output on.
    TurnOn,
    /// `2`: switch the output off.
    TurnOff,
    /// `3`: toggle the output.
    Toggle,
    /// `4`: block the output.
    Block,
    /// `5`: drive the auxiliary relay.
    AuxRelay,
    /// `6`: mutual exclusion group.
    MutualEx,
    /// `7`: raise the dim level while held.
    LevelUp,
    /// `8`: lower the dim level while held.
    LevelDown,
    /// `9`: increment the dim level one step.
    LevelInc,
    /// `10`: decrement the dim level one step.
    LevelDec,
    /// `11`: set an absolute dim level.
    LevelSet,
    /// `12`: set the fade time.
    FadeTime,
    /// `13`: recall a scene.
    SceneSet,
    /// `14`: next scene.
    SceneNext,
    /// `15`: previous scene.
    ScenePrev,
    /// `17`: report the datapoint back.
    ReturnData,
    /// `18`: switch on after a delay.
    DelayedOn,
    /// `19`: event timer 1.
    EventTimer1,
    /// `20`: event timer 2.
    EventTimer2,
    /// `21`: event timer 3.
    EventTimer3,
    /// `22`: event timer 4.
    EventTimer4,
    /// `23`: step control.
    StepCtrl,
    /// `24`: step control up.
    StepCtrlUp,
    /// `25`: step control down.
    StepCtrlDown,
    /// `29`: set an internal level.
    LevelSetIntern,
    /// `30`: fade to a level.
    Fade,
    /// `31`: learn mode.
    Learn,
}

impl ActionTableAction {
    /// Numeric wire code.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Void => 0,
            Self::TurnOn => 1,
            Self::TurnOff => 2,
            Self::Toggle => 3,
            Self::Block => 4,
            Self::AuxRelay => 5,
            Self::MutualEx => 6,
            Self::LevelUp => 7,
            Self::LevelDown => 8,
            Self::LevelInc => 9,
            Self::LevelDec => 10,
            Self::LevelSet => 11,
            Self::FadeTime => 12,
            Self::SceneSet => 13,
            Self::SceneNext => 14,
            Self::ScenePrev => 15,
            Self::ReturnData => 17,
            Self::DelayedOn => 18,
            Self::EventTimer1 => 19,
            Self::EventTimer2 => 20,
            Self::EventTimer3 => 21,
            Self::EventTimer4 => 22,
            Self::StepCtrl => 23,
            Self::StepCtrlUp => 24,
            Self::StepCtrlDown => 25,
            Self::LevelSetIntern => 29,
            Self::Fade => 30,
            Self::Learn => 31,
        }
    }

    /// Map a wire code to an action.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Void,
            1 => Self::TurnOn,
            2 => Self::TurnOff,
            3 => Self::Toggle,
            4 => Self::Block,
            5 => Self::AuxRelay,
            6 => Self::MutualEx,
            7 => Self::LevelUp,
            8 => Self::LevelDown,
            9 => Self::LevelInc,
            10 => Self::LevelDec,
            11 => Self::LevelSet,
            12 => Self::FadeTime,
            13 => Self::SceneSet,
            14 => Self::SceneNext,
            15 => Self::ScenePrev,
            17 => Self::ReturnData,
            18 => Self::DelayedOn,
            19 => Self::EventTimer1,
            20 => Self::EventTimer2,
            21 => Self::EventTimer3,
            22 => Self::EventTimer4,
            23 => Self::StepCtrl,
            24 => Self::StepCtrlUp,
            25 => Self::StepCtrlDown,
            29 => Self::LevelSetIntern,
            30 => Self::Fade,
            31 => Self::Learn,
            _ => return None,
        })
    }

    /// Short-form name used in YAML and progress lines.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Void => "VOID",
            Self::TurnOn => "ON",
            Self::TurnOff => "OFF",
            Self::Toggle => "TOGGLE",
            Self::Block => "BLOCK",
            Self::AuxRelay => "AUXRELAY",
            Self::MutualEx => "MUTUALEX",
            Self::LevelUp => "LEVELUP",
            Self::LevelDown => "LEVELDOWN",
            Self::LevelInc => "LEVELINC",
            Self::LevelDec => "LEVELDEC",
            Self::LevelSet => "LEVELSET",
            Self::FadeTime => "FADETIME",
            Self::SceneSet => "SCENESET",
            Self::SceneNext => "SCENENEXT",
            Self::ScenePrev => "SCENEPREV",
            Self::ReturnData => "RETURNDATA",
            Self::DelayedOn => "DELAYEDON",
            Self::EventTimer1 => "EVENTTIMER1",
            Self::EventTimer2 => "EVENTTIMER2",
            Self::EventTimer3 => "EVENTTIMER3",
            Self::EventTimer4 => "EVENTTIMER4",
            Self::StepCtrl => "STEPCTRL",
            Self::StepCtrlUp => "STEPCTRLUP",
            Self::StepCtrlDown => "STEPCTRLDOWN",
            Self::LevelSetIntern => "LEVELSETINTERN",
            Self::Fade => "FADE",
            Self::Learn => "LEARN",
        }
    }
}

impl FromStr for ActionTableAction {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_ascii_uppercase();
        // Long aliases from the function registry are accepted too.
        let canonical = match upper.as_str() {
            "TURNON" => "ON",
            "TURNOFF" => "OFF",
            other => other,
        };
        ALL_ACTIONS
            .iter()
            .copied()
            .find(|action| action.name() == canonical)
            .ok_or_else(|| ProtocolError::InvalidRow {
                row: s.to_owned(),
                reason: "unknown action name".to_owned(),
            })
    }
}

const ALL_ACTIONS: &[ActionTableAction] = &[
    ActionTableAction::Void,
    ActionTableAction::TurnOn,
    ActionTableAction::TurnOff,
    ActionTableAction::Toggle,
    ActionTableAction::Block,
    ActionTableAction::AuxRelay,
    ActionTableAction::MutualEx,
    ActionTableAction::LevelUp,
    ActionTableAction::LevelDown,
    ActionTableAction::LevelInc,
    ActionTableAction::LevelDec,
    ActionTableAction::LevelSet,
    ActionTableAction::FadeTime,
    ActionTableAction::SceneSet,
    ActionTableAction::SceneNext,
    ActionTableAction::ScenePrev,
    ActionTableAction::ReturnData,
    ActionTableAction::DelayedOn,
    ActionTableAction::EventTimer1,
    ActionTableAction::EventTimer2,
    ActionTableAction::EventTimer3,
    ActionTableAction::EventTimer4,
    ActionTableAction::StepCtrl,
    ActionTableAction::StepCtrlUp,
    ActionTableAction::StepCtrlDown,
    ActionTableAction::LevelSetIntern,
    ActionTableAction::Fade,
    ActionTableAction::Learn,
];

/// One programmed behaviour line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActionTableEntry {
    /// Module-type code of the source panel.
    pub source_module_type: u8,
    /// Link number of the source panel.
    pub source_link: u8,
    /// Input index on the source panel.
    pub source_input: u8,
    /// Output channel on the storing module.
    pub target_output: u8,
    /// Action to perform.
    pub action: ActionTableAction,
    /// Optional time or level argument; `00` on the wire means absent.
    pub time: Option<u8>,
}

impl ActionTableEntry {
    /// The all-zero row devices use to terminate a table.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        self.source_module_type == 0
            && self.source_link == 0
            && self.source_input == 0
            && self.target_output == 0
            && self.action == ActionTableAction::Void
            && self.time.is_none()
    }

    /// The short human form, e.g. `XP20 10 0 > 0 OFF`.
    #[must_use]
    pub fn short_line(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ActionTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = module_type::by_code(self.source_module_type)
            .map_or_else(|| self.source_module_type.to_string(), |info| info.name.to_owned());
        write!(
            f,
            "{} {} {} > {} {}",
            source,
            self.source_link,
            self.source_input,
            self.target_output,
            self.action.name()
        )?;
        if let Some(time) = self.time {
            write!(f, " {time}")?;
        }
        Ok(())
    }
}

impl FromStr for ActionTableEntry {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ProtocolError::InvalidRow {
            row: s.to_owned(),
            reason: reason.to_owned(),
        };
        let mut tokens = s.split_whitespace();
        let source = tokens.next().ok_or_else(|| invalid("missing source module type"))?;
        let source_module_type = module_type::by_name(source).map_or_else(
            || source.parse().map_err(|_| invalid("bad source module type")),
            |info| Ok(info.code),
        )?;
        let source_link = parse_field(&mut tokens, || invalid("missing link number"))?;
        let source_input = parse_field(&mut tokens, || invalid("missing input number"))?;
        if tokens.next() != Some(">") {
            return Err(invalid("missing > separator"));
        }
        let target_output = parse_field(&mut tokens, || invalid("missing target output"))?;
        let action: ActionTableAction =
            tokens.next().ok_or_else(|| invalid("missing action"))?.parse()?;
        let time = match tokens.next() {
            Some(t) => Some(t.parse().map_err(|_| invalid("bad time argument"))?),
            None => None,
        };
        if tokens.next().is_some() {
            return Err(invalid("trailing tokens"));
        }
        Ok(Self { source_module_type, source_link, source_input, target_output, action, time })
    }
}

fn parse_field<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    missing: impl Fn() -> ProtocolError,
) -> Result<u8> {
    tokens.next().ok_or_else(&missing)?.parse().map_err(|_| missing())
}

/// A decoded action table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionTable {
    /// Entries in row order, terminator excluded.
    pub entries: Vec<ActionTableEntry>,
}

impl ActionTable {
    /// Short lines, one per entry.
    #[must_use]
    pub fn short_lines(&self) -> Vec<String> {
        self.entries.iter().map(ActionTableEntry::short_line).collect()
    }
}

impl fmt::Display for ActionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}

/// Wire codec for one row, selected per module family.
pub trait ActionTableSerializer {
    /// Decode a raw row body into an entry.
    fn decode_row(&self, row: &[u8]) -> Result<ActionTableEntry>;

    /// Encode an entry into a raw row body.
    fn encode_row(&self, entry: &ActionTableEntry) -> Vec<u8>;
}

/// Push-button tables: six digit pairs, time included.
///
/// This layout is also the generic one used when the family is unknown.
pub struct Xp20Serializer;

/// Relay tables: five digit pairs, no time argument on the wire.
pub struct Xp24Serializer;

/// Dimmer tables: six digit pairs, the last pair carrying a level.
pub struct Xp33Serializer;

/// The serializer for a family.
#[must_use]
pub fn serializer_for(family: ActionTableFamily) -> &'static dyn ActionTableSerializer {
    match family {
        ActionTableFamily::Xp20 => &Xp20Serializer,
        ActionTableFamily::Xp24 => &Xp24Serializer,
        ActionTableFamily::Xp33 => &Xp33Serializer,
    }
}

impl ActionTableSerializer for Xp20Serializer {
    fn decode_row(&self, row: &[u8]) -> Result<ActionTableEntry> {
        let p = decode_pairs(row, 6)?;
        build_entry(p[0], p[1], p[2], p[3], p[4], p[5], row)
    }

    fn encode_row(&self, entry: &ActionTableEntry) -> Vec<u8> {
        encode_pairs(&[
            entry.source_module_type,
            entry.source_link,
            entry.source_input,
            entry.target_output,
            entry.action.code(),
            entry.time.unwrap_or(0),
        ])
    }
}

impl ActionTableSerializer for Xp24Serializer {
    fn decode_row(&self, row: &[u8]) -> Result<ActionTableEntry> {
        let p = decode_pairs(row, 5)?;
        let entry = build_entry(p[0], p[1], p[2], p[3], p[4], 0, row)?;
        if entry.target_output > 3 {
            return Err(row_error(row, "relay output out of range"));
        }
        Ok(entry)
    }

    fn encode_row(&self, entry: &ActionTableEntry) -> Vec<u8> {
        encode_pairs(&[
            entry.source_module_type,
            entry.source_link,
            entry.source_input,
            entry.target_output,
            entry.action.code(),
        ])
    }
}

impl ActionTableSerializer for Xp33Serializer {
    fn decode_row(&self, row: &[u8]) -> Result<ActionTableEntry> {
        let p = decode_pairs(row, 6)?;
        let entry = build_entry(p[0], p[1], p[2], p[3], p[4], p[5], row)?;
        if !entry.is_terminator() && entry.target_output > 2 {
            return Err(row_error(row, "dimmer channel out of range"));
        }
        Ok(entry)
    }

    fn encode_row(&self, entry: &ActionTableEntry) -> Vec<u8> {
        encode_pairs(&[
            entry.source_module_type,
            entry.source_link,
            entry.source_input,
            entry.target_output,
            entry.action.code(),
            entry.time.unwrap_or(0),
        ])
    }
}

fn row_error(row: &[u8], reason: &str) -> ProtocolError {
    ProtocolError::InvalidRow { row: display_bytes(row), reason: reason.to_owned() }
}

fn decode_pairs(row: &[u8], count: usize) -> Result<Vec<u8>> {
    if row.len() != count * 2 {
        return Err(row_error(row, &format!("expected {} digits", count * 2)));
    }
    row.chunks_exact(2)
        .map(|pair| match pair {
            [a, b] if a.is_ascii_digit() && b.is_ascii_digit() => {
                Ok((a - b'0') * 10 + (b - b'0'))
            }
            _ => Err(row_error(row, "non-digit in row")),
        })
        .collect()
}

fn build_entry(
    module_type: u8,
    link: u8,
    input: u8,
    output: u8,
    action_code: u8,
    time: u8,
    row: &[u8],
) -> Result<ActionTableEntry> {
    let action = ActionTableAction::from_code(action_code)
        .ok_or_else(|| row_error(row, "unknown action code"))?;
    Ok(ActionTableEntry {
        source_module_type: module_type,
        source_link: link,
        source_input: input,
        target_output: output,
        action,
        time: (time != 0).then_some(time),
    })
}

fn encode_pairs(values: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 2);
    for &value in values {
        out.push(b'0' + (value / 10) % 10);
        out.push(b'0' + value % 10);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_line_round_trip() {
        let entry = ActionTableEntry {
            source_module_type: 33,
            source_link: 10,
            source_input: 0,
            target_output: 0,
            action: ActionTableAction::TurnOff,
            time: None,
        };
        assert_eq!(entry.short_line(), "XP20 10 0 > 0 OFF");
        assert_eq!("XP20 10 0 > 0 OFF".parse::<ActionTableEntry>().unwrap(), entry);
    }

    #[test]
    fn short_line_with_time_and_alias() {
        let entry: ActionTableEntry = "XP2606 2 5 > 1 DELAYEDON 30".parse().unwrap();
        assert_eq!(entry.source_module_type, 14);
        assert_eq!(entry.action, ActionTableAction::DelayedOn);
        assert_eq!(entry.time, Some(30));

        let alias: ActionTableEntry = "XP20 0 1 > 2 TURNON".parse().unwrap();
        assert_eq!(alias.action, ActionTableAction::TurnOn);
    }

    #[test]
    fn xp20_row_round_trip() {
        let entry: ActionTableEntry = "XP20 10 0 > 0 OFF".parse().unwrap();
        let row = Xp20Serializer.encode_row(&entry);
        assert_eq!(row, b"331000000200");
        assert_eq!(Xp20Serializer.decode_row(&row).unwrap(), entry);
    }

    #[test]
    fn xp24_row_has_no_time_pair() {
        let entry: ActionTableEntry = "XP20 1 3 > 2 TOGGLE".parse().unwrap();
        let row = Xp24Serializer.encode_row(&entry);
        assert_eq!(row.len(), 10);
        assert_eq!(Xp24Serializer.decode_row(&row).unwrap(), entry);
        assert!(Xp24Serializer.decode_row(b"3301030403").is_err());
    }

    #[test]
    fn xp33_rejects_out_of_range_channel() {
        assert!(Xp33Serializer.decode_row(b"330103031100").is_err());
        let ok = Xp33Serializer.decode_row(b"330103021150").unwrap();
        assert_eq!(ok.action, ActionTableAction::LevelSet);
        assert_eq!(ok.time, Some(50));
    }

    #[test]
    fn terminator_row_detected() {
        let entry = Xp20Serializer.decode_row(b"000000000000").unwrap();
        assert!(entry.is_terminator());
    }

    #[test]
    fn unknown_action_code_is_an_error() {
        assert!(Xp20Serializer.decode_row(b"330103002800").is_err());
    }
}
