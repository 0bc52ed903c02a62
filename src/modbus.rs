//! Modbus TCP access to the wallbox
//!
//! `ModbusTransport` is the seam between the polling/control logic and the
//! wire. `ModbusClient` implements it over tokio-modbus; `MockTransport`
//! implements it in memory for tests. `ModbusConnectionManager` wraps one
//! transport per device, serializes every request through a fair mutex, and
//! applies the retry policy.

use crate::error::Result;

mod client;
mod manager;
pub mod mock;

pub use client::ModbusClient;
pub use manager::{ConnectionStats, ModbusConnectionManager, Request, Response};

/// Minimal register-level operations needed by the rest of the crate
#[async_trait::async_trait]
pub trait ModbusTransport: Send {
    /// Open the TCP session. No-op when already connected.
    async fn connect(&mut self) -> Result<()>;

    /// Drop the TCP session
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    async fn write_single_register(&mut self, unit: u8, address: u16, value: u16) -> Result<()>;

    async fn write_multiple_registers(
        &mut self,
        unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()>;
}
