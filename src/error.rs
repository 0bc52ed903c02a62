//! Error types and handling for Helios
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting. Transport failures,
//! device exception responses, and configuration problems are kept apart so
//! the retry policy can classify them without string matching.

use thiserror::Error;

/// Result type alias for Helios operations
pub type Result<T> = std::result::Result<T, HeliosError>;

/// Main error type for Helios
#[derive(Debug, Clone, Error)]
pub enum HeliosError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// TCP connection errors (refused, reset, not connected)
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Modbus exception response returned by the device
    #[error("Protocol error: {message} (exception code {code})")]
    Protocol { code: u8, message: String },

    /// Response that could not be interpreted (short or wrong length)
    #[error("Malformed response: {message}")]
    Malformed { message: String },

    /// Write attempted against a device configured read-only
    #[error("Read-only: {message}")]
    ReadOnly { message: String },

    /// Device is currently unavailable
    #[error("Device unavailable: {message}")]
    Unavailable { message: String },

    /// No device with that id is managed by the hub
    #[error("Unknown device: {device_id}")]
    UnknownDevice { device_id: String },

    /// Operation aborted by shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

/// Modbus exception codes as reported by the wallbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetDevice,
    Other(u8),
}

impl DeviceException {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetDevice,
            other => Self::Other(other),
        }
    }

    /// Exceptions that mean "try again later" rather than "never works"
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Acknowledge | Self::ServerDeviceBusy)
    }
}

impl HeliosError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        HeliosError::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        HeliosError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        HeliosError::Connection {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        HeliosError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new protocol (device exception) error
    pub fn protocol<S: Into<String>>(code: u8, message: S) -> Self {
        HeliosError::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Create a new malformed-response error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        HeliosError::Malformed {
            message: message.into(),
        }
    }

    /// Create a new read-only error
    pub fn read_only<S: Into<String>>(message: S) -> Self {
        HeliosError::ReadOnly {
            message: message.into(),
        }
    }

    /// Create a new unavailable error
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        HeliosError::Unavailable {
            message: message.into(),
        }
    }

    /// Create a new unknown-device error
    pub fn unknown_device<S: Into<String>>(device_id: S) -> Self {
        HeliosError::UnknownDevice {
            device_id: device_id.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        HeliosError::Io {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        HeliosError::Generic {
            message: message.into(),
        }
    }

    /// Device exception carried by a protocol error, if any
    pub fn exception(&self) -> Option<DeviceException> {
        match self {
            HeliosError::Protocol { code, .. } => Some(DeviceException::from_code(*code)),
            _ => None,
        }
    }

    /// Errors that leave the TCP session in an unknown state
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            HeliosError::Connection { .. } | HeliosError::Timeout { .. }
        )
    }

    /// Errors rejected before any request reaches the wire
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            HeliosError::Config { .. }
                | HeliosError::Validation { .. }
                | HeliosError::ReadOnly { .. }
        )
    }
}

impl From<std::io::Error> for HeliosError {
    fn from(err: std::io::Error) -> Self {
        HeliosError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for HeliosError {
    fn from(err: serde_yaml::Error) -> Self {
        HeliosError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HeliosError {
    fn from(err: serde_json::Error) -> Self {
        HeliosError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<tokio_modbus::ExceptionCode> for HeliosError {
    fn from(code: tokio_modbus::ExceptionCode) -> Self {
        HeliosError::protocol(u8::from(code), format!("{:?}", code))
    }
}

impl From<tokio_modbus::Error> for HeliosError {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(io) => HeliosError::connection(io.to_string()),
            other => HeliosError::malformed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = HeliosError::config("test config error");
        assert!(matches!(err, HeliosError::Config { .. }));

        let err = HeliosError::connection("refused");
        assert!(err.is_connection_error());

        let err = HeliosError::validation("field", "test validation error");
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_error_display() {
        let err = HeliosError::config("test error");
        assert_eq!(format!("{}", err), "Configuration error: test error");

        let err = HeliosError::validation("test_field", "invalid value");
        assert_eq!(
            format!("{}", err),
            "Validation error: test_field - invalid value"
        );

        let err = HeliosError::protocol(2, "IllegalDataAddress");
        assert_eq!(
            format!("{}", err),
            "Protocol error: IllegalDataAddress (exception code 2)"
        );
    }

    #[test]
    fn exception_codes_map_to_variants() {
        assert_eq!(
            HeliosError::protocol(2, "x").exception(),
            Some(DeviceException::IllegalDataAddress)
        );
        assert_eq!(
            DeviceException::from_code(0x06),
            DeviceException::ServerDeviceBusy
        );
        assert_eq!(DeviceException::from_code(0x42), DeviceException::Other(0x42));
        assert!(DeviceException::Acknowledge.is_transient());
        assert!(!DeviceException::IllegalDataValue.is_transient());
        assert_eq!(HeliosError::timeout("t").exception(), None);
    }
}
