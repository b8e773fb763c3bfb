//! Server side of the conbus toolkit.
//!
//! Two roles, both multi-client TCP servers on the gateway port:
//!
//! - [`EmulatorServer`]: a gateway emulator answering for a configured set
//!   of modules, with per-client broadcast buffers and the XP33 storm
//!   failure mode; enough bus to develop and test against without
//!   hardware;
//! - [`BroadcastProxy`]: a pass-through reverse proxy in front of a real
//!   gateway that mirrors live traffic to every connected observer.
//!
//! Both are task-per-socket: one reader and one writer task per client,
//! with the client-buffer map as the only shared mutable state, behind a
//! single mutex in [`ClientBufferManager`].

mod buffers;
mod config;
mod device;
mod emulator;
mod error;
mod proxy;

pub use buffers::{ClientBufferManager, DEFAULT_BUFFER_CAPACITY};
pub use config::{EmulatorConfig, load_module_list};
pub use device::{DeviceReply, DeviceTable, EmulatedModule};
pub use emulator::EmulatorServer;
pub use error::ServerError;
pub use proxy::{BroadcastProxy, ProxyConfig};
