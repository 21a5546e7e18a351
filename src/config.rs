//! Configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults (ESP300 on `/dev/ttyUSB0`, 19200 baud, 5 s timeout)
//! 2. A TOML file (default `config/esp300.toml`; a missing file is fine)
//! 3. Environment variables prefixed with `ESP300_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! ESP300_APPLICATION__LOG_LEVEL=debug
//! ESP300_CONNECTION__KIND=bus
//! ESP300_CONNECTION__ADDRESS=GPIB0::5::INSTR
//! ESP300_MOTION__POLL_INTERVAL_MS=250
//! ```
//!
//! # Example
//!
//! ```no_run
//! use esp300_control::config::Esp300Config;
//!
//! let config = Esp300Config::load()?;
//! println!("Controller at {}", config.connection.address);
//! # Ok::<(), esp300_control::config::ConfigError>(())
//! ```

use crate::adapters::{build_transport, Transport, TransportKind};
use crate::error::CommsResult;
use crate::instrument::esp300::MovePolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/esp300.toml";

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "ESP300_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed into the schema.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Esp300Config {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// How to reach the controller
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Axis and polling settings
    #[serde(default)]
    pub motion: MotionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Which link to use
    #[serde(default = "default_kind")]
    pub kind: TransportKind,
    /// Serial device path, or bus resource string for `bus`
    #[serde(default = "default_address")]
    pub address: String,
    /// Serial baud rate (ignored for `bus`)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// RTS/CTS hardware flow control (ignored for `bus`)
    #[serde(default)]
    pub rts_cts: bool,
    /// Response timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Override for the pause between close and reopen on reconnect
    #[serde(default)]
    pub reconnect_backoff_ms: Option<u64>,
    /// Query `*IDN?` right after connecting
    #[serde(default)]
    pub verify_identity: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            address: default_address(),
            baud_rate: default_baud_rate(),
            rts_cts: false,
            timeout_secs: default_timeout_secs(),
            reconnect_backoff_ms: None,
            verify_identity: false,
        }
    }
}

/// Motion configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Number of axes fitted (axes 1..=num_axes are polled)
    #[serde(default = "default_num_axes")]
    pub num_axes: u8,
    /// Motion poller interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Whether moves are refused while the axis is moving
    #[serde(default)]
    pub move_policy: MovePolicy,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            num_axes: default_num_axes(),
            poll_interval_ms: default_poll_interval_ms(),
            move_policy: MovePolicy::default(),
        }
    }
}

// ============================================================================
// Default Value Functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_kind() -> TransportKind {
    TransportKind::Serial
}

fn default_address() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    crate::adapters::DEFAULT_BAUD_RATE
}

fn default_timeout_secs() -> f64 {
    5.0
}

fn default_num_axes() -> u8 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Esp300Config {
    /// Load from `config/esp300.toml` and `ESP300_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path, layered over defaults and under the environment
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Address is not empty
    /// - Timeout is a positive, finite number of seconds
    /// - Baud rate is non-zero for serial links
    /// - At least one axis, and a non-zero poll interval
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.connection.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "connection.address must not be empty".to_string(),
            ));
        }

        let timeout = self.connection.timeout_secs;
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "connection.timeout_secs must be a positive number of seconds, got {}",
                timeout
            )));
        }
        if let Err(e) = Duration::try_from_secs_f64(timeout) {
            return Err(ConfigError::ValidationError(format!(
                "connection.timeout_secs {} is not a usable timeout: {}",
                timeout, e
            )));
        }

        if self.connection.kind == TransportKind::Serial && self.connection.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "connection.baud_rate must be greater than 0".to_string(),
            ));
        }

        if self.motion.num_axes == 0 {
            return Err(ConfigError::ValidationError(
                "motion.num_axes must be at least 1".to_string(),
            ));
        }

        if self.motion.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "motion.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl ConnectionConfig {
    /// Response timeout as a `Duration`
    ///
    /// Out-of-range values are rejected by [`Esp300Config::validate`]; an
    /// unvalidated one saturates rather than falling back to the default.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::MAX)
    }

    /// Reconnect backoff override, if configured
    pub fn reconnect_backoff(&self) -> Option<Duration> {
        self.reconnect_backoff_ms.map(Duration::from_millis)
    }

    /// Build the unopened transport this section describes
    ///
    /// Goes through the same factory as [`DeviceSession::connect`]. A baud
    /// rate written into the address as `path@baud` wins over `baud_rate`.
    ///
    /// [`DeviceSession::connect`]: crate::session::DeviceSession::connect
    pub fn build_transport(&self) -> CommsResult<Box<dyn Transport>> {
        let address = match self.kind {
            TransportKind::Serial if !self.address.contains('@') => {
                format!("{}@{}", self.address, self.baud_rate)
            }
            _ => self.address.clone(),
        };
        build_transport(self.kind, &address, self.timeout(), self.rts_cts)
    }
}

impl MotionConfig {
    /// Motion poller interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Esp300Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.kind, TransportKind::Serial);
        assert_eq!(config.connection.baud_rate, 19200);
        assert_eq!(config.connection.timeout(), Duration::from_secs(5));
        assert_eq!(config.motion.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.motion.move_policy, MovePolicy::Unchecked);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Esp300Config::default();
        config.application.log_level = "verbose".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_non_positive_timeout_rejected() {
        let mut config = Esp300Config::default();
        config.connection.timeout_secs = 0.0;
        assert!(config.validate().is_err());

        config.connection.timeout_secs = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unrepresentable_timeout_rejected() {
        let mut config = Esp300Config::default();
        config.connection.timeout_secs = 1e30;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("timeout_secs"));
        assert_ne!(config.connection.timeout(), Duration::from_secs(5));

        config.connection.timeout_secs = 86_400.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_axes_rejected() {
        let mut config = Esp300Config::default();
        config.motion.num_axes = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("num_axes"));
    }

    #[test]
    fn test_baud_rate_ignored_for_bus() {
        let mut config = Esp300Config::default();
        config.connection.kind = TransportKind::Bus;
        config.connection.address = "GPIB0::5::INSTR".to_string();
        config.connection.baud_rate = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[connection]
kind = "bus"
address = "GPIB0::5::INSTR"
timeout_secs = 2.5
reconnect_backoff_ms = 3000

[motion]
num_axes = 2
move_policy = "refuse_while_moving"
"#
        )
        .unwrap();

        let config = Esp300Config::load_from(file.path()).unwrap();
        assert_eq!(config.connection.kind, TransportKind::Bus);
        assert_eq!(config.connection.address, "GPIB0::5::INSTR");
        assert_eq!(config.connection.timeout(), Duration::from_millis(2500));
        assert_eq!(
            config.connection.reconnect_backoff(),
            Some(Duration::from_secs(3))
        );
        assert_eq!(config.motion.num_axes, 2);
        assert_eq!(config.motion.move_policy, MovePolicy::RefuseWhileMoving);
        // Untouched sections keep their defaults
        assert_eq!(config.motion.poll_interval_ms, 1000);
        assert_eq!(config.application.log_level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Esp300Config::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.connection.address, "/dev/ttyUSB0");
    }

    #[test]
    fn test_invalid_file_value_is_load_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[connection]\nkind = \"usb\"").unwrap();

        let result = Esp300Config::load_from(file.path());
        assert!(matches!(result, Err(ConfigError::LoadError(_))));
    }

    #[test]
    fn test_build_transport_matches_kind() {
        let mut config = ConnectionConfig::default();
        let serial = config.build_transport().unwrap();
        assert_eq!(serial.kind(), TransportKind::Serial);
        assert_eq!(serial.name(), "/dev/ttyUSB0");

        config.kind = TransportKind::Bus;
        config.address = "GPIB0::5::INSTR".to_string();
        let bus = config.build_transport().unwrap();
        assert_eq!(bus.kind(), TransportKind::Bus);
        assert_eq!(bus.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_build_transport_carries_baud_and_flow_control() {
        let config = ConnectionConfig {
            baud_rate: 9600,
            rts_cts: true,
            ..ConnectionConfig::default()
        };
        let serial = config.build_transport().unwrap();
        let described = format!("{:?}", serial);
        assert_eq!(serial.name(), "/dev/ttyUSB0");
        assert!(described.contains("baud_rate: 9600"));
        assert!(described.contains("rts_cts: true"));

        let inline = ConnectionConfig {
            address: "/dev/ttyUSB1@38400".to_string(),
            ..config
        };
        let serial = inline.build_transport().unwrap();
        assert_eq!(serial.name(), "/dev/ttyUSB1");
        assert!(format!("{:?}", serial).contains("baud_rate: 38400"));
    }

    #[test]
    fn test_build_transport_rejects_empty_address() {
        let config = ConnectionConfig {
            address: "   ".to_string(),
            ..ConnectionConfig::default()
        };
        assert!(config.build_transport().is_err());
    }
}
