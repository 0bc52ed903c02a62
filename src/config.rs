//! Configuration management for Helios
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files. A single file describes every wallbox the
//! process manages together with logging and retry settings.

use crate::error::{HeliosError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod defaults;

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "HELIOS_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// IANA timezone used for daily/monthly/yearly counter boundaries
    pub timezone: String,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Retry and backoff applied to every Modbus request
    pub retry: RetryConfig,

    /// Managed wallboxes
    pub devices: Vec<DeviceConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level
    pub console_level: Option<String>,

    /// Optional file-specific level
    pub file_level: Option<String>,

    /// Path to log file (or directory)
    pub file: String,

    /// Log format: "structured" or "simple" (compact lines)
    pub format: String,

    /// Number of daily log files to keep
    pub backup_count: u32,

    /// Enable console output
    pub console_output: bool,

    /// Enable JSON formatting
    pub json_format: bool,
}

/// Retry policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per request, first try included
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay_ms: u64,

    /// Upper bound for the exponential backoff
    pub max_delay_ms: u64,
}

/// One wallbox reachable over Modbus TCP
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Stable identifier; derived from host, port and slave id when empty
    pub id: String,

    /// Human readable name
    pub name: String,

    /// Hostname or IP address of the wallbox
    pub host: String,

    /// TCP port (typically 502)
    pub port: u16,

    /// Modbus unit identifier
    pub slave_id: u8,

    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Consecutive failed cycles before the device is marked unavailable
    pub failure_threshold: u32,

    /// Suppress every register write
    pub read_only: bool,

    /// Solar surplus charging
    pub solar: SolarConfig,
}

/// Which connector a control loop drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorSelect {
    A,
    B,
}

/// Solar surplus control loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolarConfig {
    /// Start the control loop for this device
    pub enabled: bool,

    /// External entity that provides the surplus value (label only)
    pub source: String,

    /// Number of phases the car charges on (1 or 3)
    pub phases: u8,

    /// Amps added to the computed setpoint when it falls below the minimum
    pub min_current_offset: i32,

    /// Phase voltage used when the measured voltage is implausible
    pub nominal_voltage: f64,

    /// Minimum change in amps before a new setpoint is written
    pub hysteresis_amps: f64,

    /// Minimum seconds between two successful setpoint writes
    pub cooldown_secs: u64,

    /// Connector controlled by the loop
    pub connector: ConnectorSelect,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from `HELIOS_CONFIG` or the default locations
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV)
            && !path.is_empty()
        {
            return Self::from_file(path);
        }

        let default_paths = [
            "helios.yaml",
            "/data/helios.yaml",
            "/etc/helios/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parsed timezone for counter boundaries
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone.parse::<chrono_tz::Tz>().map_err(|_| {
            HeliosError::validation("timezone", format!("Unknown timezone '{}'", self.timezone))
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.tz()?;

        if self.retry.max_attempts == 0 {
            return Err(HeliosError::validation(
                "retry.max_attempts",
                "Must be at least 1",
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(HeliosError::validation(
                "retry.max_delay_ms",
                "Must not be smaller than base_delay_ms",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for (idx, device) in self.devices.iter().enumerate() {
            device.validate(idx)?;
            if !seen.insert(device.unique_id()) {
                return Err(HeliosError::validation(
                    format!("devices[{}].id", idx),
                    format!("Duplicate device id '{}'", device.unique_id()),
                ));
            }
        }

        Ok(())
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl DeviceConfig {
    /// Identifier used by the hub; `host_port_slave` unless set explicitly
    pub fn unique_id(&self) -> String {
        if self.id.trim().is_empty() {
            format_device_unique_id(&self.host, self.port, self.slave_id)
        } else {
            self.id.clone()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn validate(&self, idx: usize) -> Result<()> {
        let field = |name: &str| format!("devices[{}].{}", idx, name);

        if self.host.trim().is_empty() {
            return Err(HeliosError::validation(
                field("host"),
                "Host cannot be empty",
            ));
        }
        if self.port == 0 {
            return Err(HeliosError::validation(
                field("port"),
                "Port must be greater than 0",
            ));
        }
        if self.slave_id == 0 || self.slave_id > 247 {
            return Err(HeliosError::validation(
                field("slave_id"),
                "Must be between 1 and 247",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(HeliosError::validation(
                field("poll_interval_ms"),
                "Must be greater than 0",
            ));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(HeliosError::validation(
                field("request_timeout_ms"),
                "Timeouts must be greater than 0",
            ));
        }
        if self.failure_threshold == 0 {
            return Err(HeliosError::validation(
                field("failure_threshold"),
                "Must be at least 1",
            ));
        }

        let solar = &self.solar;
        if solar.phases != 1 && solar.phases != 3 {
            return Err(HeliosError::validation(
                field("solar.phases"),
                "Must be 1 or 3",
            ));
        }
        if !(solar.nominal_voltage.is_finite() && solar.nominal_voltage > 0.0) {
            return Err(HeliosError::validation(
                field("solar.nominal_voltage"),
                "Must be positive",
            ));
        }
        if !(solar.hysteresis_amps.is_finite() && solar.hysteresis_amps >= 0.0) {
            return Err(HeliosError::validation(
                field("solar.hysteresis_amps"),
                "Must not be negative",
            ));
        }
        if solar.enabled && self.read_only {
            return Err(HeliosError::validation(
                field("solar.enabled"),
                "Solar control needs write access; disable read_only",
            ));
        }

        Ok(())
    }
}

/// Format a device id as `host_port_slave`
pub fn format_device_unique_id(host: &str, port: u16, slave_id: u8) -> String {
    format!("{}_{}_{}", host, port, slave_id)
}

/// Split a `host_port_slave` id back into its parts
///
/// The host may itself contain underscores, so the two numeric fields are
/// taken from the right.
pub fn parse_device_unique_id(unique_id: &str) -> Option<(String, u16, u8)> {
    let mut parts = unique_id.rsplitn(3, '_');
    let slave = parts.next()?.parse::<u8>().ok()?;
    let port = parts.next()?.parse::<u16>().ok()?;
    let host = parts.next()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port, slave))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.devices.is_empty());

        let device = DeviceConfig::default();
        assert_eq!(device.port, 502);
        assert_eq!(device.slave_id, 1);
        assert_eq!(device.failure_threshold, 3);
        assert!((device.solar.nominal_voltage - 230.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.devices.push(DeviceConfig::default());
        assert!(config.validate().is_ok());

        config.devices[0].host = String::new();
        assert!(config.validate().is_err());

        config.devices[0].host = "10.0.0.2".to_string();
        config.devices[0].solar.phases = 2;
        assert!(matches!(
            config.validate(),
            Err(HeliosError::Validation { field, .. }) if field == "devices[0].solar.phases"
        ));

        config.devices[0].solar.phases = 3;
        config.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_device_ids_rejected() {
        let mut config = Config::default();
        config.devices.push(DeviceConfig::default());
        config.devices.push(DeviceConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn unique_id_round_trip() {
        let device = DeviceConfig {
            host: "wallbox_garage.local".to_string(),
            port: 1502,
            slave_id: 7,
            ..Default::default()
        };
        let id = device.unique_id();
        assert_eq!(id, "wallbox_garage.local_1502_7");
        assert_eq!(
            parse_device_unique_id(&id),
            Some(("wallbox_garage.local".to_string(), 1502, 7))
        );
        assert_eq!(parse_device_unique_id("no-numbers"), None);
        assert_eq!(parse_device_unique_id("_502_1"), None);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.devices.push(DeviceConfig::default());
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(deserialized.devices.len(), 1);
        assert_eq!(deserialized.devices[0].port, 502);
        assert_eq!(deserialized.devices[0].solar.connector, ConnectorSelect::A);
    }
}
