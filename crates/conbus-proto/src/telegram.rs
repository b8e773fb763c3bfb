//! Telegram model: the immutable unit of exchange on the bus.
//!
//! Four telegram types share one framing: System (`S`, master to device),
//! Reply (`R`, device to master), Event (`E`, device to anyone) and
//! OldEvent (`O`, parsed identically to `E`). A parsed [`Telegram`] always
//! keeps the original frame bytes next to the decoded body, so a consumer
//! can log or relay exactly what was on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::datapoint::DatapointId;
use crate::{ProtocolError, Result};

/// Render raw payload bytes for display, byte-for-byte (Latin-1).
///
/// Every byte maps to the Unicode code point of the same value, which is
/// exactly the Latin-1 decoding. UTF-8 must never be attempted here: reply
/// payloads carry bare bytes such as `0xA7` (`§`).
#[must_use]
pub fn display_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Encode display text back to payload bytes, the inverse of
/// [`display_bytes`]. Characters beyond Latin-1 become `?`.
#[must_use]
pub fn payload_bytes(text: &str) -> Vec<u8> {
    text.chars().map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?')).collect()
}

/// The four telegram types and their wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TelegramType {
    /// `S`: request from the bus master.
    System,
    /// `R`: response from a device.
    Reply,
    /// `E`: spontaneous push-button event.
    Event,
    /// `O`: event in the legacy encoding, same layout as `E`.
    OldEvent,
}

impl TelegramType {
    /// Wire tag byte of this type.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::System => b'S',
            Self::Reply => b'R',
            Self::Event => b'E',
            Self::OldEvent => b'O',
        }
    }

    /// Map a wire tag byte back to a telegram type.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'S' => Some(Self::System),
            b'R' => Some(Self::Reply),
            b'E' => Some(Self::Event),
            b'O' => Some(Self::OldEvent),
            _ => None,
        }
    }
}

/// A factory-assigned device serial number: exactly ten decimal digits.
///
/// The all-zero serial addresses every device on the bus.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SerialNumber([u8; 10]);

impl SerialNumber {
    /// The broadcast serial `0000000000`.
    pub const BROADCAST: SerialNumber = SerialNumber(*b"0000000000");

    /// The ten ASCII digits of this serial.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 10] {
        &self.0
    }

    /// The serial as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Digits only, so always valid UTF-8
        std::str::from_utf8(&self.0).unwrap_or("0000000000")
    }

    /// True for the all-zero broadcast serial.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() == 10 && bytes.iter().all(u8::is_ascii_digit) {
            let mut digits = [0u8; 10];
            digits.copy_from_slice(bytes);
            Ok(Self(digits))
        } else {
            Err(ProtocolError::InvalidSerial { value: display_bytes(bytes) })
        }
    }
}

impl FromStr for SerialNumber {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_wire(s.as_bytes())
    }
}

impl TryFrom<String> for SerialNumber {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SerialNumber> for String {
    fn from(serial: SerialNumber) -> Self {
        serial.as_str().to_owned()
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialNumber({})", self.as_str())
    }
}

/// System functions: the two-digit operation code of S and R telegrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SystemFunction {
    /// `01`: who is on the bus.
    Discover,
    /// `02`: read a datapoint.
    ReadDatapoint,
    /// `04`: write a configuration datapoint.
    WriteConfig,
    /// `05`: start blinking the module LED.
    Blink,
    /// `06`: stop blinking the module LED.
    Unblink,
    /// `11`: read one action-table row.
    ReadActionTable,
    /// `12`: end-of-table marker, both directions.
    EndOfTable,
    /// `13`: write one action-table row.
    WriteActionTable,
    /// `18`: acknowledge.
    Ack,
    /// Any code this registry does not know; round-trips unchanged.
    Other(u8),
}

impl SystemFunction {
    /// Numeric wire code.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::ReadDatapoint => 2,
            Self::WriteConfig => 4,
            Self::Blink => 5,
            Self::Unblink => 6,
            Self::ReadActionTable => 11,
            Self::EndOfTable => 12,
            Self::WriteActionTable => 13,
            Self::Ack => 18,
            Self::Other(code) => code,
        }
    }

    /// Map a wire code to a function.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Discover,
            2 => Self::ReadDatapoint,
            4 => Self::WriteConfig,
            5 => Self::Blink,
            6 => Self::Unblink,
            11 => Self::ReadActionTable,
            12 => Self::EndOfTable,
            13 => Self::WriteActionTable,
            18 => Self::Ack,
            other => Self::Other(other),
        }
    }

    /// Registry name, or `F{code}` for unknown functions.
    #[must_use]
    pub fn name(self) -> String {
        match self {
            Self::Discover => "DISCOVER".to_owned(),
            Self::ReadDatapoint => "READ_DATAPOINT".to_owned(),
            Self::WriteConfig => "WRITE_CONFIG".to_owned(),
            Self::Blink => "BLINK".to_owned(),
            Self::Unblink => "UNBLINK".to_owned(),
            Self::ReadActionTable => "READ_ACTION_TABLE".to_owned(),
            Self::EndOfTable => "END_OF_TABLE".to_owned(),
            Self::WriteActionTable => "WRITE_ACTION_TABLE".to_owned(),
            Self::Ack => "ACK".to_owned(),
            Self::Other(code) => format!("F{code:02}"),
        }
    }
}

/// Push-button event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// `M`: contact made (pressed).
    Make,
    /// `B`: contact broken (released).
    Break,
}

impl EventKind {
    fn tag(self) -> u8 {
        match self {
            Self::Make => b'M',
            Self::Break => b'B',
        }
    }
}

/// Decoded body of a telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelegramBody {
    /// System or Reply: addressed to or from a specific serial.
    Addressed {
        /// Device serial, or the broadcast serial in master requests.
        serial: SerialNumber,
        /// Two-digit system function.
        function: SystemFunction,
        /// Datapoint id, when the body carries one.
        datapoint: Option<DatapointId>,
        /// Remaining data bytes, raw.
        data: Vec<u8>,
    },
    /// Event or OldEvent: a push-button input change.
    Event {
        /// Module-type code of the emitting panel.
        module_type: u8,
        /// Link number of the emitting panel.
        link: u8,
        /// Input index on the panel.
        input: u8,
        /// Make or break.
        kind: EventKind,
    },
    /// Framing and checksum were readable but the body layout was not.
    Unknown,
}

/// One parsed frame, immutable once constructed.
///
/// Frames with a bad checksum still parse; `checksum_valid` is false and
/// the consumer decides whether to accept them. The original wire bytes are
/// always retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    telegram_type: TelegramType,
    frame: Vec<u8>,
    payload: Vec<u8>,
    checksum: [u8; 2],
    checksum_valid: bool,
    body: TelegramBody,
}

impl Telegram {
    /// Build a System telegram addressed to `serial`.
    #[must_use]
    pub fn system(
        serial: SerialNumber,
        function: SystemFunction,
        datapoint: Option<DatapointId>,
        data: &[u8],
    ) -> Self {
        Self::addressed(b'S', serial, function, datapoint, data)
    }

    /// Build a Reply telegram from `serial`.
    #[must_use]
    pub fn reply(
        serial: SerialNumber,
        function: SystemFunction,
        datapoint: Option<DatapointId>,
        data: &[u8],
    ) -> Self {
        Self::addressed(b'R', serial, function, datapoint, data)
    }

    /// Build the `F18` acknowledge reply for `serial`.
    #[must_use]
    pub fn ack(serial: SerialNumber) -> Self {
        Self::reply(serial, SystemFunction::Ack, None, b"")
    }

    /// Build an Event telegram.
    #[must_use]
    pub fn event(module_type: u8, link: u8, input: u8, kind: EventKind) -> Self {
        let mut payload = Vec::with_capacity(10);
        payload.push(b'E');
        push_two_digits(&mut payload, module_type);
        payload.push(b'L');
        push_two_digits(&mut payload, link);
        payload.push(b'I');
        push_two_digits(&mut payload, input);
        payload.push(kind.tag());
        Self::assemble(payload)
    }

    /// Frame a pre-built payload; the checksum is appended here.
    #[must_use]
    pub fn from_payload(payload: Vec<u8>) -> Self {
        Self::assemble(payload)
    }

    fn addressed(
        tag: u8,
        serial: SerialNumber,
        function: SystemFunction,
        datapoint: Option<DatapointId>,
        data: &[u8],
    ) -> Self {
        let mut payload = Vec::with_capacity(16 + data.len());
        payload.push(tag);
        payload.extend_from_slice(serial.as_bytes());
        payload.push(b'F');
        push_two_digits(&mut payload, function.code());
        payload.push(b'D');
        if let Some(id) = datapoint {
            push_two_digits(&mut payload, id.code());
        }
        payload.extend_from_slice(data);
        Self::assemble(payload)
    }

    fn assemble(payload: Vec<u8>) -> Self {
        let checksum = checksum::xor_nibble(&payload);
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.push(b'<');
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&checksum);
        frame.push(b'>');
        let telegram_type =
            payload.first().and_then(|&t| TelegramType::from_tag(t)).unwrap_or(TelegramType::System);
        let body = parse_body(&payload);
        Self { telegram_type, frame, payload, checksum, checksum_valid: true, body }
    }

    /// Parse one complete frame (`<` payload checksum `>`).
    ///
    /// A checksum mismatch is not an error; the telegram is returned with
    /// `checksum_valid` false. Structural breakage is.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < 5 || frame.first() != Some(&b'<') || frame.last() != Some(&b'>') {
            return Err(ProtocolError::InvalidFrame {
                reason: format!("not a <...> region of at least 5 bytes: {:?}", display_bytes(frame)),
            });
        }
        let inner = &frame[1..frame.len() - 1];
        let (payload, checksum_letters) = inner.split_at(inner.len() - 2);
        if payload.is_empty() {
            return Err(ProtocolError::InvalidFrame { reason: "zero-length payload".to_owned() });
        }
        let checksum = [checksum_letters[0], checksum_letters[1]];
        let checksum_valid = checksum::xor_nibble_valid(payload, checksum);
        let telegram_type = payload
            .first()
            .and_then(|&t| TelegramType::from_tag(t))
            .ok_or_else(|| ProtocolError::UnparseableBody {
                telegram_type: char::from(payload[0]),
                payload: display_bytes(payload),
            })?;
        let body = parse_body(payload);
        Ok(Self {
            telegram_type,
            frame: frame.to_vec(),
            payload: payload.to_vec(),
            checksum,
            checksum_valid,
            body,
        })
    }

    /// Telegram type derived from the first payload byte.
    #[must_use]
    pub fn telegram_type(&self) -> TelegramType {
        self.telegram_type
    }

    /// The literal on-wire bytes, markers and checksum included.
    #[must_use]
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// The frame rendered for display.
    #[must_use]
    pub fn frame_display(&self) -> String {
        display_bytes(&self.frame)
    }

    /// Payload bytes between the start marker and the checksum.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The two checksum letters as received.
    #[must_use]
    pub fn checksum(&self) -> [u8; 2] {
        self.checksum
    }

    /// Whether the received checksum matches the payload.
    #[must_use]
    pub fn checksum_valid(&self) -> bool {
        self.checksum_valid
    }

    /// Decoded body.
    #[must_use]
    pub fn body(&self) -> &TelegramBody {
        &self.body
    }

    /// Serial number, for addressed telegrams.
    #[must_use]
    pub fn serial(&self) -> Option<SerialNumber> {
        match &self.body {
            TelegramBody::Addressed { serial, .. } => Some(*serial),
            _ => None,
        }
    }

    /// System function, for addressed telegrams.
    #[must_use]
    pub fn function(&self) -> Option<SystemFunction> {
        match &self.body {
            TelegramBody::Addressed { function, .. } => Some(*function),
            _ => None,
        }
    }

    /// Datapoint id, when the body carries one.
    #[must_use]
    pub fn datapoint(&self) -> Option<DatapointId> {
        match &self.body {
            TelegramBody::Addressed { datapoint, .. } => *datapoint,
            _ => None,
        }
    }

    /// Data bytes, for addressed telegrams.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match &self.body {
            TelegramBody::Addressed { data, .. } => Some(data.as_slice()),
            _ => None,
        }
    }

    /// True for a Reply with the given function from the given serial.
    #[must_use]
    pub fn is_reply(&self, from: SerialNumber, function: SystemFunction) -> bool {
        self.telegram_type == TelegramType::Reply
            && matches!(
                &self.body,
                TelegramBody::Addressed { serial, function: f, .. }
                    if *serial == from && *f == function
            )
    }

    /// True for an `F18` acknowledge from the given serial.
    #[must_use]
    pub fn is_ack_from(&self, from: SerialNumber) -> bool {
        self.is_reply(from, SystemFunction::Ack)
    }

    /// One human line describing this telegram.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.body {
            TelegramBody::Addressed { serial, function, datapoint, data } => {
                let mut line = format!(
                    "{} {} {}",
                    char::from(self.telegram_type.tag()),
                    serial,
                    function.name()
                );
                if let Some(id) = datapoint {
                    line.push_str(&format!(" D{:02}", id.code()));
                }
                if !data.is_empty() {
                    line.push_str(&format!(" {}", display_bytes(data)));
                }
                if !self.checksum_valid {
                    line.push_str(" [BAD CHECKSUM]");
                }
                line
            }
            TelegramBody::Event { module_type, link, input, kind } => {
                let kind = match kind {
                    EventKind::Make => "make",
                    EventKind::Break => "break",
                };
                let name = crate::module_type::by_code(*module_type)
                    .map_or_else(|| format!("type {module_type:02}"), |info| info.name.to_owned());
                format!("{} {} L{:02} I{:02} {}", char::from(self.telegram_type.tag()), name, link, input, kind)
            }
            TelegramBody::Unknown => format!("unparsed {}", self.frame_display()),
        }
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.frame_display())
    }
}

fn push_two_digits(out: &mut Vec<u8>, value: u8) {
    out.push(b'0' + (value / 10) % 10);
    out.push(b'0' + value % 10);
}

fn two_digits(bytes: &[u8]) -> Option<u8> {
    match bytes {
        [a, b] if a.is_ascii_digit() && b.is_ascii_digit() => Some((a - b'0') * 10 + (b - b'0')),
        _ => None,
    }
}

fn parse_body(payload: &[u8]) -> TelegramBody {
    match payload.first() {
        Some(b'S' | b'R') => parse_addressed(payload).unwrap_or(TelegramBody::Unknown),
        Some(b'E' | b'O') => parse_event(payload).unwrap_or(TelegramBody::Unknown),
        _ => TelegramBody::Unknown,
    }
}

fn parse_addressed(payload: &[u8]) -> Option<TelegramBody> {
    // {S|R}{serial:10}F{function:02}[D[{datapoint:02}]{data}]
    if payload.len() < 14 {
        return None;
    }
    let serial = SerialNumber::from_wire(&payload[1..11]).ok()?;
    if payload[11] != b'F' {
        return None;
    }
    let function = SystemFunction::from_code(two_digits(&payload[12..14])?);
    let mut datapoint = None;
    let mut data: &[u8] = &[];
    if let Some(rest) = payload.get(14..) {
        if let Some((&b'D', after)) = rest.split_first() {
            if after.len() >= 2 {
                if let Some(code) = two_digits(&after[..2]) {
                    datapoint = Some(DatapointId::from_code(code));
                    data = &after[2..];
                } else {
                    data = after;
                }
            } else {
                data = after;
            }
        } else if !rest.is_empty() {
            return None;
        }
    }
    Some(TelegramBody::Addressed { serial, function, datapoint, data: data.to_vec() })
}

fn parse_event(payload: &[u8]) -> Option<TelegramBody> {
    // {E|O}{module_type:02}L{link:02}I{input:02}{M|B}
    if payload.len() != 10 || payload[3] != b'L' || payload[6] != b'I' {
        return None;
    }
    let module_type = two_digits(&payload[1..3])?;
    let link = two_digits(&payload[4..6])?;
    let input = two_digits(&payload[7..9])?;
    let kind = match payload[9] {
        b'M' => EventKind::Make,
        b'B' => EventKind::Break,
        _ => return None,
    };
    Some(TelegramBody::Event { module_type, link, input, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_request_encodes_to_literal_frame() {
        let telegram = Telegram::system(
            SerialNumber::BROADCAST,
            SystemFunction::Discover,
            Some(DatapointId::from_code(0)),
            b"",
        );
        assert_eq!(telegram.frame(), b"<S0000000000F01D00FA>");
        assert!(telegram.checksum_valid());
    }

    #[test]
    fn discover_reply_parses_without_datapoint() {
        let telegram = Telegram::parse(b"<R0020030837F01DFM>").unwrap();
        assert_eq!(telegram.telegram_type(), TelegramType::Reply);
        assert!(telegram.checksum_valid());
        assert_eq!(telegram.serial().unwrap().as_str(), "0020030837");
        assert_eq!(telegram.function(), Some(SystemFunction::Discover));
        assert_eq!(telegram.datapoint(), None);
        assert_eq!(telegram.data(), Some(&b""[..]));
    }

    #[test]
    fn ack_round_trip() {
        let serial: SerialNumber = "0020044964".parse().unwrap();
        let ack = Telegram::ack(serial);
        assert_eq!(ack.frame(), b"<R0020044964F18DFA>");
        let parsed = Telegram::parse(ack.frame()).unwrap();
        assert!(parsed.is_ack_from(serial));
    }

    #[test]
    fn reply_with_latin1_unit_marker() {
        let mut frame = b"<R0020044966F02D18+31,5".to_vec();
        frame.push(0xA7);
        frame.push(b'C');
        let payload = frame[1..].to_vec();
        frame.extend_from_slice(&checksum::xor_nibble(&payload));
        frame.push(b'>');
        let telegram = Telegram::parse(&frame).unwrap();
        assert!(telegram.checksum_valid());
        assert_eq!(telegram.datapoint().map(DatapointId::code), Some(18));
        assert_eq!(telegram.data(), Some(&b"+31,5\xA7C"[..]));
        assert!(telegram.frame_display().contains('§'));
    }

    #[test]
    fn event_round_trip_matches_literal() {
        let telegram = Telegram::event(14, 0, 2, EventKind::Make);
        assert_eq!(telegram.frame(), b"<E14L00I02MAK>");
        let parsed = Telegram::parse(telegram.frame()).unwrap();
        assert_eq!(
            *parsed.body(),
            TelegramBody::Event { module_type: 14, link: 0, input: 2, kind: EventKind::Make }
        );
    }

    #[test]
    fn old_event_parses_like_event() {
        let payload = b"O14L00I02M".to_vec();
        let telegram = Telegram::from_payload(payload);
        assert_eq!(telegram.telegram_type(), TelegramType::OldEvent);
        assert!(matches!(telegram.body(), TelegramBody::Event { input: 2, .. }));
    }

    #[test]
    fn bad_checksum_is_surfaced_not_dropped() {
        let telegram = Telegram::parse(b"<R0020030837F01DAA>").unwrap();
        assert!(!telegram.checksum_valid());
        assert_eq!(telegram.function(), Some(SystemFunction::Discover));
    }

    #[test]
    fn garbage_body_parses_as_unknown() {
        let telegram = Telegram::from_payload(b"Sshort".to_vec());
        assert_eq!(*telegram.body(), TelegramBody::Unknown);
    }

    #[test]
    fn zero_length_payload_is_rejected() {
        assert!(Telegram::parse(b"<AA>").is_err());
        assert!(Telegram::parse(b"<>").is_err());
    }

    #[test]
    fn serial_rejects_non_digits() {
        assert!("00200A4966".parse::<SerialNumber>().is_err());
        assert!("123".parse::<SerialNumber>().is_err());
    }
}
