//! # Helios - Olife wallbox monitor and solar charge controller
//!
//! Talks Modbus TCP to one or more Olife Energy wallboxes, publishes an
//! immutable snapshot of every station once per poll cycle, and optionally
//! steers the charging current from a solar surplus signal.
//!
//! ## Architecture
//!
//! - `registers`: register map, typed decode and encode
//! - `modbus`: transport trait, tokio-modbus client and the serializing,
//!   retrying connection manager
//! - `retry`: failure classification and backoff
//! - `topology`: single or dual connector detection
//! - `driver`: polling coordinator, snapshots, availability and commands
//! - `controls`: solar setpoint calculation
//! - `solar`: solar control loop task
//! - `hub`: multi-device entry point
//! - `config`, `logging`, `error`: ambient plumbing

pub mod config;
pub mod controls;
pub mod driver;
pub mod error;
pub mod hub;
pub mod logging;
pub mod modbus;
pub mod registers;
pub mod retry;
pub mod solar;
pub mod topology;

// Re-export commonly used types
pub use config::Config;
pub use driver::{DeviceSnapshot, WallboxCommand};
pub use error::{HeliosError, Result};
pub use hub::{DeviceHandle, WallboxHub};
