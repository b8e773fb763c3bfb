//! Emulator configuration.
//!
//! The device set comes from a module-list YAML document, the same shape
//! the export service writes:
//!
//! ```yaml
//! - name: hallway relays
//!   serial_number: "0020044966"
//!   module_type: XP24
//!   module_type_code: 7
//!   link_number: 1
//! - serial_number: "0020030837"
//! ```

use std::path::Path;

use conbus_proto::ModuleDefinition;
use tokio::time::Duration;

use crate::buffers::DEFAULT_BUFFER_CAPACITY;
use crate::error::ServerError;

/// Load a module-list document.
pub fn load_module_list(path: &Path) -> Result<Vec<ModuleDefinition>, ServerError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ServerError::Config(format!("cannot read {}: {e}", path.display())))?;
    let definitions: Vec<ModuleDefinition> = serde_yaml::from_str(&text)
        .map_err(|e| ServerError::Config(format!("cannot parse {}: {e}", path.display())))?;
    Ok(definitions)
}

/// Emulator runtime parameters.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Address to listen on.
    pub bind_address: String,
    /// Emulated modules.
    pub definitions: Vec<ModuleDefinition>,
    /// Shortest delay between two writes to one client.
    pub write_delay_min: Duration,
    /// Longest delay between two writes to one client.
    pub write_delay_max: Duration,
    /// Per-client buffer soft cap, in frames.
    pub buffer_capacity: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", conbus_proto::GATEWAY_PORT),
            definitions: Vec::new(),
            write_delay_min: Duration::from_millis(1),
            write_delay_max: Duration::from_millis(5),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}
