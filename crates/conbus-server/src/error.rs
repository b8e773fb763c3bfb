//! Error types for the server side.

use thiserror::Error;

/// Errors surfaced by the emulator and the reverse proxy.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Bad or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket setup or accept failure.
    #[error("transport error: {0}")]
    Transport(String),
}
