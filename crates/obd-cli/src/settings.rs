//! Layered configuration: file, then `OBD__*` environment, then flags

use crate::cli::Cli;
use config::{Config, ConfigError, Environment, File};
use obd_protocol::{AdapterSettings, ConnectionSettings, ObdConfig, ObdProtocol};
use obd_scheduler::PollerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::Level;

/// Prefix for environment overrides, e.g. `OBD__CONNECTION__PORT`
pub const ENV_PREFIX: &str = "OBD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Everything `obd-diag` can be configured with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub adapter: AdapterSettings,
    pub custom_pids_path: Option<PathBuf>,
    pub poller: PollerConfig,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load from an optional file plus the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(path, Environment::with_prefix(ENV_PREFIX).separator("__"))
    }

    pub fn load_from(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder.add_source(env).build()?.try_deserialize()
    }

    /// Command-line flags win over file and environment
    pub fn apply_overrides(&mut self, cli: &Cli) -> anyhow::Result<()> {
        if let Some(port) = &cli.port {
            self.connection.port = port.clone();
        }
        if let Some(baud) = cli.baud {
            self.connection.baud_rate = baud;
        }
        if let Some(code) = cli.protocol {
            self.adapter.protocol = ObdProtocol::from_code(code)?;
        }
        if let Some(path) = &cli.custom_pids {
            self.custom_pids_path = Some(path.clone());
        }
        Ok(())
    }

    pub fn obd_config(&self) -> ObdConfig {
        ObdConfig {
            connection: self.connection.clone(),
            adapter: self.adapter.clone(),
            custom_pids_path: self.custom_pids_path.clone(),
        }
    }

    /// `-v` flags beat the configured level; unknown names fall back to info
    pub fn log_level(&self, verbose: u8) -> Level {
        match verbose {
            0 => self.logging.level.parse().unwrap_or(Level::INFO),
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}
