//! Configuration management.
//!
//! Settings load from an optional TOML file plus `SR400_*` environment
//! overrides (e.g. `SR400_CONNECTION__PORT=/dev/ttyUSB1`). Every field has a
//! default, so a missing file yields a usable configuration for the
//! simulator.

use config::Config;
use serde::Deserialize;

use crate::error::{Result, Sr400Error};
use crate::sweep::SweepConfig;

/// Top-level application settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Default log filter (overridable with `RUST_LOG`).
    pub log_level: String,
    /// Serial connection parameters.
    pub connection: ConnectionSettings,
    /// Wire pacing parameters.
    pub protocol: ProtocolSettings,
    /// Background monitoring cadence.
    pub monitoring: MonitoringSettings,
    /// Default sweep parameters.
    pub sweep: SweepConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            connection: ConnectionSettings::default(),
            protocol: ProtocolSettings::default(),
            monitoring: MonitoringSettings::default(),
            sweep: SweepConfig::default(),
        }
    }
}

/// Serial connection parameters.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3").
    pub port: String,
    /// Baud rate; the instrument speaks 9600 8N1.
    pub baud_rate: u32,
    /// Post-open warm-up wait in milliseconds.
    pub warmup_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            warmup_ms: 2000,
        }
    }
}

/// Wire pacing parameters.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Pause after each transmitted command, in milliseconds.
    pub command_delay_ms: u64,
    /// How long to wait for a query reply, in milliseconds.
    pub reply_timeout_ms: u64,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            command_delay_ms: 100,
            reply_timeout_ms: 1000,
        }
    }
}

/// Background monitoring cadence.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringSettings {
    /// Snapshot interval in milliseconds.
    pub interval_ms: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl Settings {
    /// Load settings from `config_path` (or `config/default` when omitted;
    /// its absence is fine) merged with `SR400_*` environment variables.
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        builder = match config_path {
            Some(path) => builder.add_source(config::File::with_name(path)),
            None => builder.add_source(config::File::with_name("config/default").required(false)),
        };
        builder = builder.add_source(config::Environment::with_prefix("SR400").separator("__"));

        let settings = builder.build().map_err(Sr400Error::Config)?;
        settings.try_deserialize().map_err(Sr400Error::Config)
    }
}
