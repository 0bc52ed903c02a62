use super::ModbusTransport;
use crate::error::{HeliosError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{error::Elapsed, timeout};
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

type Outcome<T> = std::result::Result<
    std::result::Result<std::result::Result<T, tokio_modbus::ExceptionCode>, tokio_modbus::Error>,
    Elapsed,
>;

/// Modbus TCP client for one wallbox
pub struct ModbusClient {
    /// Modbus TCP client connection
    ctx: Option<tokio_modbus::client::Context>,

    host: String,
    port: u16,

    /// Connection timeout
    connection_timeout: Duration,

    /// Operation timeout
    operation_timeout: Duration,

    logger: StructuredLogger,
}

impl ModbusClient {
    /// Create a new Modbus client
    pub fn new(
        host: &str,
        port: u16,
        connection_timeout: Duration,
        operation_timeout: Duration,
    ) -> Self {
        let logger = get_logger_with_context(
            LogContext::new("modbus").with_field("peer", format!("{}:{}", host, port)),
        );
        Self {
            ctx: None,
            host: host.to_string(),
            port,
            connection_timeout,
            operation_timeout,
            logger,
        }
    }

    /// Build a client from a device configuration
    pub fn from_device(device: &crate::config::DeviceConfig) -> Self {
        Self::new(
            &device.host,
            device.port,
            device.connect_timeout(),
            device.request_timeout(),
        )
    }

    async fn resolve(target: String) -> Result<SocketAddr> {
        if let Ok(addr) = target.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let mut addrs = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| HeliosError::connection(format!("Cannot resolve {}: {}", target, e)))?;
        addrs
            .next()
            .ok_or_else(|| HeliosError::connection(format!("No address for {}", target)))
    }

    fn context(&mut self) -> Result<&mut tokio_modbus::client::Context> {
        self.ctx
            .as_mut()
            .ok_or_else(|| HeliosError::connection("Not connected to Modbus server"))
    }

    /// Map a tokio-modbus outcome, dropping the session on transport trouble.
    /// Exception responses leave the connection intact.
    fn settle<T>(&mut self, outcome: Outcome<T>, operation: &str) -> Result<T> {
        match outcome {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(code))) => {
                let err = HeliosError::from(code);
                self.logger
                    .debug(&format!("{} rejected by device: {}", operation, err));
                Err(err)
            }
            Ok(Err(e)) => {
                self.ctx = None;
                let err = HeliosError::from(e);
                self.logger.warn(&format!("{} failed: {}", operation, err));
                Err(err)
            }
            Err(_) => {
                self.ctx = None;
                let msg = format!("{} timed out after {:?}", operation, self.operation_timeout);
                self.logger.warn(&msg);
                Err(HeliosError::timeout(msg))
            }
        }
    }
}

#[async_trait::async_trait]
impl ModbusTransport for ModbusClient {
    async fn connect(&mut self) -> Result<()> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let target = format!("{}:{}", self.host, self.port);
        let socket_addr = Self::resolve(target).await?;
        self.logger
            .info(&format!("Connecting to Modbus server at {}", socket_addr));

        match timeout(self.connection_timeout, tcp::connect(socket_addr)).await {
            Ok(Ok(ctx)) => {
                self.ctx = Some(ctx);
                self.logger.info("Successfully connected to Modbus server");
                Ok(())
            }
            Ok(Err(e)) => {
                let msg = format!("Failed to connect to Modbus server: {}", e);
                self.logger.warn(&msg);
                Err(HeliosError::connection(msg))
            }
            Err(_) => {
                let msg = format!("Connection timeout after {:?}", self.connection_timeout);
                self.logger.warn(&msg);
                Err(HeliosError::timeout(msg))
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.ctx.take().is_some() {
            // Dropping the context closes the socket
            self.logger.info("Disconnected from Modbus server");
        }
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.logger.trace(&format!(
            "Reading {} registers from address {} on unit {}",
            count, address, unit
        ));
        let limit = self.operation_timeout;
        let ctx = self.context()?;
        ctx.set_slave(Slave(unit));
        let outcome = timeout(limit, ctx.read_holding_registers(address, count)).await;
        let words = self.settle(outcome, "Read")?;

        if words.len() != usize::from(count) {
            return Err(HeliosError::malformed(format!(
                "Expected {} registers at {}, got {}",
                count,
                address,
                words.len()
            )));
        }
        Ok(words)
    }

    async fn write_single_register(&mut self, unit: u8, address: u16, value: u16) -> Result<()> {
        self.logger.debug(&format!(
            "Writing value {} to register {} on unit {}",
            value, address, unit
        ));
        let limit = self.operation_timeout;
        let ctx = self.context()?;
        ctx.set_slave(Slave(unit));
        let outcome = timeout(limit, ctx.write_single_register(address, value)).await;
        self.settle(outcome, "Write")
    }

    async fn write_multiple_registers(
        &mut self,
        unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()> {
        self.logger.debug(&format!(
            "Writing {} values to registers starting at {} on unit {}",
            values.len(),
            address,
            unit
        ));
        let limit = self.operation_timeout;
        let ctx = self.context()?;
        ctx.set_slave(Slave(unit));
        let outcome = timeout(limit, ctx.write_multiple_registers(address, values)).await;
        self.settle(outcome, "Block write")
    }
}
