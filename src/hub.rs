//! Multi-device entry point
//!
//! The hub spawns one poll task per configured wallbox, plus a solar task
//! for every device that accepts writes, and routes calls by device id.

use crate::config::{Config, DeviceConfig};
use crate::controls::SolarSettings;
use crate::driver::{
    AvailabilityState, DeviceSnapshot, DriverHandle, LinkState, SnapshotStream, WallboxCommand,
    WallboxDriver,
};
use crate::error::{HeliosError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::modbus::{ConnectionStats, ModbusClient, ModbusConnectionManager, ModbusTransport};
use crate::registers::{RegisterAddress, RegisterMap, RegisterValue};
use crate::retry::RetryPolicy;
use crate::solar::{SolarControlLoop, SolarInputs};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Access to one device
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    driver: DriverHandle,
    solar: Option<SolarInputs>,
}

impl DeviceHandle {
    pub fn id(&self) -> &str {
        self.driver.device_id()
    }

    pub fn subscribe(&self) -> SnapshotStream {
        self.driver.subscribe()
    }

    pub fn get_snapshot(&self) -> Option<Arc<DeviceSnapshot>> {
        self.driver.snapshot()
    }

    pub fn get_availability(&self) -> AvailabilityState {
        self.driver.availability()
    }

    pub fn link_state(&self) -> LinkState {
        self.driver.link_state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.driver.connection_stats()
    }

    pub async fn command(&self, command: WallboxCommand) -> Result<()> {
        self.driver.command(command).await
    }

    pub async fn write_register(&self, address: RegisterAddress, value: RegisterValue) -> Result<()> {
        self.driver.write_register(address, value).await
    }

    fn solar(&self) -> Result<&SolarInputs> {
        self.solar.as_ref().ok_or_else(|| {
            HeliosError::read_only(format!(
                "Device {} is read-only; solar control is not running",
                self.id()
            ))
        })
    }

    /// Feed a new surplus reading in watts (positive means export)
    pub fn publish_surplus(&self, watts: f64) -> Result<()> {
        self.solar()?.publish_surplus(watts);
        Ok(())
    }

    pub fn set_solar_enabled(&self, enabled: bool) -> Result<()> {
        self.solar()?.set_enabled(enabled);
        Ok(())
    }

    pub fn set_solar_offset(&self, amps: i32) -> Result<()> {
        self.solar()?.set_offset(amps);
        Ok(())
    }

    pub fn solar_settings(&self) -> Option<SolarSettings> {
        self.solar.as_ref().map(|s| s.settings())
    }
}

struct DeviceRuntime {
    handle: DeviceHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Running set of wallboxes
pub struct WallboxHub {
    devices: BTreeMap<String, DeviceRuntime>,
    logger: StructuredLogger,
}

impl WallboxHub {
    /// Start every configured device over Modbus TCP
    pub fn start(config: &Config) -> Result<Self> {
        Self::start_with_transports(config, |device| Box::new(ModbusClient::from_device(device)))
    }

    /// Start with caller-supplied transports; tests pass in-memory mocks
    pub fn start_with_transports<F>(config: &Config, mut transport_for: F) -> Result<Self>
    where
        F: FnMut(&DeviceConfig) -> Box<dyn ModbusTransport>,
    {
        config.validate()?;
        let tz = config.tz()?;
        let map = Arc::new(RegisterMap::standard()?);
        let policy = RetryPolicy::from_config(&config.retry);
        let logger = get_logger("hub");

        let mut devices = BTreeMap::new();
        for device in &config.devices {
            let device_id = device.unique_id();
            let cancel = CancellationToken::new();
            let manager = Arc::new(
                ModbusConnectionManager::new(
                    transport_for(device),
                    device.slave_id,
                    policy.clone(),
                    cancel.clone(),
                )
                .with_device(&device_id),
            );

            let (driver, driver_handle) = WallboxDriver::new(
                device.clone(),
                tz,
                Arc::clone(&map),
                manager,
                cancel.clone(),
            );
            let mut tasks = vec![tokio::spawn(driver.run())];

            let solar = if device.read_only {
                logger.info(&format!(
                    "Device {} is read-only; solar control disabled",
                    device_id
                ));
                None
            } else {
                let (control_loop, inputs) =
                    SolarControlLoop::new(&device.solar, driver_handle.clone(), cancel.clone());
                tasks.push(tokio::spawn(control_loop.run()));
                Some(inputs)
            };

            logger.info(&format!(
                "Started device {} ({}) at {}:{}",
                device_id, device.name, device.host, device.port
            ));
            devices.insert(
                device_id,
                DeviceRuntime {
                    handle: DeviceHandle {
                        driver: driver_handle,
                        solar,
                    },
                    cancel,
                    tasks,
                },
            );
        }

        Ok(Self { devices, logger })
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn device(&self, device_id: &str) -> Result<&DeviceHandle> {
        self.devices
            .get(device_id)
            .map(|d| &d.handle)
            .ok_or_else(|| HeliosError::unknown_device(device_id))
    }

    pub fn subscribe(&self, device_id: &str) -> Result<SnapshotStream> {
        Ok(self.device(device_id)?.subscribe())
    }

    pub fn get_snapshot(&self, device_id: &str) -> Result<Option<Arc<DeviceSnapshot>>> {
        Ok(self.device(device_id)?.get_snapshot())
    }

    pub fn get_availability(&self, device_id: &str) -> Result<AvailabilityState> {
        Ok(self.device(device_id)?.get_availability())
    }

    pub async fn command(&self, device_id: &str, command: WallboxCommand) -> Result<()> {
        self.device(device_id)?.command(command).await
    }

    pub async fn write_register(
        &self,
        device_id: &str,
        address: RegisterAddress,
        value: RegisterValue,
    ) -> Result<()> {
        self.device(device_id)?.write_register(address, value).await
    }

    pub fn publish_surplus(&self, device_id: &str, watts: f64) -> Result<()> {
        self.device(device_id)?.publish_surplus(watts)
    }

    pub fn set_solar_enabled(&self, device_id: &str, enabled: bool) -> Result<()> {
        self.device(device_id)?.set_solar_enabled(enabled)
    }

    pub fn set_solar_offset(&self, device_id: &str, amps: i32) -> Result<()> {
        self.device(device_id)?.set_solar_offset(amps)
    }

    /// Cancel every device and wait for its tasks
    pub async fn shutdown(self) {
        for runtime in self.devices.values() {
            runtime.cancel.cancel();
        }
        for (device_id, runtime) in self.devices {
            for task in runtime.tasks {
                if let Err(e) = task.await {
                    self.logger
                        .error(&format!("Task for {} ended abnormally: {}", device_id, e));
                }
            }
        }
        self.logger.info("All devices stopped");
    }
}
