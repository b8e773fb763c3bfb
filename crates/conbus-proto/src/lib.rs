//! Telegram codec and registries for the conbus field bus.
//!
//! The bus speaks a line-oriented ASCII telegram protocol: every frame is
//! `<` payload checksum `>` where the checksum is two nibble letters in
//! `A..=P`. This crate owns everything that can be reasoned about without
//! I/O:
//!
//! - [`Telegram`]: the immutable parsed unit of exchange
//! - [`FrameParser`]: rolling-buffer extraction of frames from a byte stream
//! - [`checksum`]: XOR-nibble and CRC32-nibble checksums
//! - [`datapoint`]: datapoint id registry and typed value parsers
//! - [`module_type`]: module-type code registry with capability flags
//! - [`action_table`]: action-table entries and per-family serializers
//! - [`ModuleDefinition`]: the YAML module-list document shape
//!
//! Payload bytes are raw `0x00..=0xFF`; replies legitimately carry Latin-1
//! symbols such as `§` (0xA7) as unit markers. Decoding to text happens only
//! for display, byte-for-byte (never UTF-8).

pub mod action_table;
pub mod checksum;
pub mod datapoint;
mod error;
mod frame;
mod model;
pub mod module_type;
mod telegram;

pub use datapoint::{DatapointId, DatapointValue};
pub use error::ProtocolError;
pub use frame::FrameParser;
pub use model::ModuleDefinition;
pub use telegram::{
    EventKind, SerialNumber, SystemFunction, Telegram, TelegramBody, TelegramType, display_bytes,
    payload_bytes,
};

/// Default TCP port of the gateway.
pub const GATEWAY_PORT: u16 = 10001;

/// Result alias for protocol-layer operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
