//! Client configuration.
//!
//! One YAML document under a `conbus:` key selects the gateway endpoint
//! and the per-operation inactivity timeout:
//!
//! ```yaml
//! conbus:
//!   ip: 192.168.1.100
//!   port: 10001
//!   timeout: 2.5
//! ```
//!
//! An absent file means the built-in defaults. A file that exists but does
//! not parse is an error; the host is never silently defaulted in that
//! case.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Gateway endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConbusSettings {
    /// Gateway host.
    pub ip: String,
    /// Gateway TCP port.
    pub port: u16,
    /// Rolling inactivity timeout in seconds.
    pub timeout: f64,
}

impl Default for ConbusSettings {
    fn default() -> Self {
        Self { ip: "127.0.0.1".to_owned(), port: conbus_proto::GATEWAY_PORT, timeout: 5.0 }
    }
}

/// Top-level client configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Gateway settings.
    pub conbus: ConbusSettings,
}

impl ClientConfig {
    /// Load from a YAML file; an absent file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no client config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_yaml::from_str(&text)
            .map_err(|e| ClientError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// The inactivity timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.conbus.timeout.max(0.0))
    }

    fn validate(&self) -> Result<(), ClientError> {
        if self.conbus.ip.trim().is_empty() {
            return Err(ClientError::Config("conbus.ip must not be empty".to_owned()));
        }
        if !(self.conbus.timeout > 0.0) {
            return Err(ClientError::Config(format!(
                "conbus.timeout must be positive, got {}",
                self.conbus.timeout
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_gateway() {
        let config = ClientConfig::default();
        assert_eq!(config.conbus.ip, "127.0.0.1");
        assert_eq!(config.conbus.port, 10001);
        assert_eq!(config.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn absent_file_yields_defaults() {
        let config = ClientConfig::load(Path::new("/nonexistent/conbus-client.yml")).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn partial_document_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.yml");
        std::fs::write(&path, "conbus:\n  ip: 192.168.1.100\n").unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.conbus.ip, "192.168.1.100");
        assert_eq!(config.conbus.port, 10001);
    }

    #[test]
    fn malformed_yaml_is_an_error_not_a_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.yml");
        std::fs::write(&path, "conbus: [not, a, mapping\n").unwrap();

        assert!(matches!(ClientConfig::load(&path), Err(ClientError::Config(_))));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.yml");
        std::fs::write(&path, "conbus:\n  timeout: 0\n").unwrap();

        assert!(ClientConfig::load(&path).is_err());
    }
}
