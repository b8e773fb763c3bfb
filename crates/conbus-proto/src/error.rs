//! Error types for the protocol layer.
//!
//! Strongly-typed errors for framing, field parsing and value decoding.
//! Transport failures never appear here; they belong to the client and
//! server crates.

use thiserror::Error;

/// Errors produced while parsing or building telegrams.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame-level structure is broken (missing markers, short region).
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with the region
        reason: String,
    },

    /// A serial number field is not ten decimal digits.
    #[error("invalid serial number {value:?}")]
    InvalidSerial {
        /// The offending text
        value: String,
    },

    /// A checksum letter is outside `A..=P`.
    #[error("invalid checksum letter {letter:?}")]
    InvalidChecksumLetter {
        /// The offending character
        letter: char,
    },

    /// A telegram body does not match any known layout.
    #[error("unparseable {telegram_type} payload {payload:?}")]
    UnparseableBody {
        /// Wire tag of the telegram
        telegram_type: char,
        /// Payload rendered for display
        payload: String,
    },

    /// A datapoint value does not match its declared grammar.
    #[error("cannot parse {name} value {raw:?}: {reason}")]
    ParseValue {
        /// Registry name of the datapoint
        name: &'static str,
        /// Raw data as received
        raw: String,
        /// Why parsing failed
        reason: String,
    },

    /// An action-table row does not decode under the selected serializer.
    #[error("invalid action table row {row:?}: {reason}")]
    InvalidRow {
        /// The row as received
        row: String,
        /// Why decoding failed
        reason: String,
    },

    /// A module-type lookup failed.
    #[error("unknown module type {value:?}")]
    UnknownModuleType {
        /// The code or name that was looked up
        value: String,
    },
}
