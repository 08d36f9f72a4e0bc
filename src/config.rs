//! Server configuration using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `LECROY_DAQ_`
//! 4. Command-line overrides (merged by the binary)
//!
//! # Example
//! ```no_run
//! use lecroy_daq::config::ServerConfig;
//!
//! let config = ServerConfig::load_from("lecroy.toml")?;
//! config.validate()?;
//! println!("PV prefix: {}", config.prefix());
//! # Ok::<(), lecroy_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::instrument::tcp::DEFAULT_PORT;
use crate::logging::LogFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LECROY_DAQ_";

/// Highest channel count expressible in a two-digit PV index.
pub const MAX_CHANNELS: u8 = 99;

/// Device server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Device name; the PV prefix is `<device><index>:`.
    pub device: String,
    /// Device index.
    pub index: String,
    /// Number of scope channels served.
    pub channels: u8,
    /// Instrument resource, `TCPIP::<host>::INSTR` or `TCPIP::<host>::<port>::SOCKET`.
    pub resource: String,
    /// Raw-socket port used for `INSTR` resources.
    pub socket_port: u16,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Log verbosity (0 = info, 1 = debug, 2+ = trace).
    pub verbosity: u8,
    /// Sleep between control-loop cycles in milliseconds.
    pub cycle_sleep_ms: u64,
    /// Period of the maintenance pass in milliseconds.
    pub periodic_interval_ms: u64,
    /// Delay between a ready decision and the waveform transfer, in milliseconds.
    pub settle_ms: u64,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            device: "lecroy".to_string(),
            index: "0".to_string(),
            channels: 4,
            resource: "TCPIP::192.168.1.100::INSTR".to_string(),
            socket_port: DEFAULT_PORT,
            timeout_ms: 5000,
            verbosity: 0,
            cycle_sleep_ms: 100,
            periodic_interval_ms: 1000,
            settle_ms: 100,
            log_format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with environment variables.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(ServerConfig::default())).merge(Env::prefixed(ENV_PREFIX))
    }

    /// Defaults, then a TOML file, then environment variables.
    pub fn figment_with_file<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load from defaults and environment variables.
    pub fn load() -> AppResult<Self> {
        Ok(Self::figment().extract()?)
    }

    /// Load from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment_with_file(path).extract()?)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        if self.device.trim().is_empty() {
            return Err(DaqError::Configuration("device name must not be empty".into()));
        }

        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(DaqError::Configuration(format!(
                "Invalid channel count {}. Must be 1-{}",
                self.channels, MAX_CHANNELS
            )));
        }

        if self.timeout_ms == 0 {
            return Err(DaqError::Configuration("timeout_ms must be greater than 0".into()));
        }

        if self.periodic_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "periodic_interval_ms must be greater than 0".into(),
            ));
        }

        if !self.resource.to_ascii_uppercase().starts_with("TCPIP") {
            return Err(DaqError::Configuration(format!(
                "Unsupported resource '{}'. Only TCPIP resources are supported",
                self.resource
            )));
        }

        Ok(())
    }

    /// PV name prefix.
    pub fn prefix(&self) -> String {
        format!("{}{}:", self.device, self.index)
    }

    /// I/O timeout of the instrument link.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Initial sleep between control-loop cycles.
    pub fn cycle_sleep(&self) -> Duration {
        Duration::from_millis(self.cycle_sleep_ms)
    }

    /// Interval between maintenance passes.
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_interval_ms)
    }

    /// Delay between a trigger decision and the waveform reads.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.prefix(), "lecroy0:");
        assert_eq!(config.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn invalid_channel_counts() {
        let mut config = ServerConfig::default();
        config.channels = 0;
        assert!(config.validate().is_err());
        config.channels = 100;
        assert!(config.validate().is_err());
        config.channels = 99;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_resource_and_timeout() {
        let mut config = ServerConfig::default();
        config.resource = "ASRL/dev/ttyUSB0::INSTR".into();
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));

        let mut config = ServerConfig::default();
        config.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.device = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ServerConfig::load_from("/nonexistent/lecroy.toml").unwrap();
        assert_eq!(config.channels, ServerConfig::default().channels);
    }
}
