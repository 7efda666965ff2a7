//! Connection and adapter settings

use crate::protocol::ObdProtocol;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial port device path (e.g., "/dev/ttyUSB0", "/dev/rfcomm0" or "COM3")
    pub port: String,
    /// One of 9600, 38400, 57600, 115200
    pub baud_rate: u32,
    /// Read timeout per exchange (milliseconds)
    pub timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 38400,
            timeout_ms: 3000,
        }
    }
}

impl ConnectionSettings {
    /// Read timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings applied by `ATZ` initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    pub protocol: ObdProtocol,
    pub echo: bool,
    pub headers: bool,
    pub spaces: bool,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            protocol: ObdProtocol::Auto,
            echo: false,
            headers: false,
            spaces: true,
        }
    }
}

/// Everything a session needs to come up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObdConfig {
    pub connection: ConnectionSettings,
    pub adapter: AdapterSettings,
    /// JSON file with custom PID definitions, loaded on connect
    pub custom_pids_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ObdConfig::default();
        assert_eq!(config.connection.baud_rate, 38400);
        assert_eq!(config.connection.timeout(), Duration::from_secs(3));
        assert_eq!(config.adapter.protocol, ObdProtocol::Auto);
        assert!(!config.adapter.echo);
        assert!(config.adapter.spaces);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ObdConfig = serde_json::from_str(
            r#"{"connection": {"port": "/dev/rfcomm0"}, "adapter": {"protocol": "6"}}"#,
        )
        .unwrap();
        assert_eq!(config.connection.port, "/dev/rfcomm0");
        assert_eq!(config.connection.baud_rate, 38400);
        assert_eq!(config.adapter.protocol, ObdProtocol::Iso15765_4Can11bit500);
        assert!(config.custom_pids_path.is_none());
    }
}
