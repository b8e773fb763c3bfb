//! Error types for the client side.

use thiserror::Error;

/// Errors surfaced by the protocol engine and configuration loader.
///
/// Well-defined operation failures (timeouts, missing acknowledges) are not
/// errors here; they travel as signals and end up in response records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// TCP could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The engine was asked to run while already running.
    #[error("protocol engine is already running")]
    AlreadyRunning,

    /// Bad or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
