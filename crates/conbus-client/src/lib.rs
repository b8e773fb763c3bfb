//! Client side of the conbus toolkit.
//!
//! Two layers:
//!
//! - [`protocol::ConbusConnection`]: the single-connection protocol engine
//!   with its FIFO send queue, pacing, dedup window, rolling timeout and
//!   typed signal surface;
//! - [`services`]: the operation services (discover, datapoint read and
//!   write, blink, output, raw, custom, scan, action tables, export) that
//!   compose the engine's signals into one request/response exchange each.
//!
//! The engine and the services are single-threaded by design: construct
//! them on one task, connect observers to their signals, then await
//! `run()` on a current-thread runtime. See the crate-level concurrency
//! notes on [`protocol`].

pub mod config;
pub mod dedup;
mod error;
pub mod protocol;
pub mod services;
pub mod signal;
mod toolkit;

pub use config::{ClientConfig, ConbusSettings};
pub use error::ClientError;
pub use protocol::{ConbusConnection, ConnectionState, Pacing, ProtocolConfig};
pub use signal::{Signal, SlotId};
pub use toolkit::ConbusToolkit;
