//! Solar control loop task
//!
//! Reacts to every new surplus reading. Runtime settings arrive over a watch
//! channel so they can be toggled without restarting the task.

use crate::config::SolarConfig;
use crate::controls::{ChargingControls, Decision, SolarSettings, SurplusReading};
use crate::driver::DriverHandle;
use crate::logging::{ErrorThrottle, LogContext, StructuredLogger, get_logger_with_context};
use crate::registers::{Block, RegisterAddress, RegisterValue, status};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Senders that steer a running loop
#[derive(Debug, Clone)]
pub struct SolarInputs {
    surplus: watch::Sender<Option<SurplusReading>>,
    settings: watch::Sender<SolarSettings>,
}

impl SolarInputs {
    pub fn publish_surplus(&self, watts: f64) {
        self.surplus.send_replace(Some(SurplusReading::now(watts)));
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.settings.send_modify(|s| s.enabled = enabled);
    }

    pub fn set_offset(&self, amps: i32) {
        self.settings.send_modify(|s| s.min_current_offset = amps);
    }

    pub fn settings(&self) -> SolarSettings {
        *self.settings.borrow()
    }
}

/// Control loop for one device
pub struct SolarControlLoop {
    controls: ChargingControls,
    driver: DriverHandle,
    surplus_rx: watch::Receiver<Option<SurplusReading>>,
    settings_rx: watch::Receiver<SolarSettings>,
    cancel: CancellationToken,
    failures: ErrorThrottle,
    logger: StructuredLogger,
}

impl SolarControlLoop {
    pub fn new(
        config: &SolarConfig,
        driver: DriverHandle,
        cancel: CancellationToken,
    ) -> (Self, SolarInputs) {
        let (surplus, surplus_rx) = watch::channel(None);
        let (settings, settings_rx) = watch::channel(SolarSettings::from(config));
        let logger = get_logger_with_context(
            LogContext::new("solar")
                .with_device(driver.device_id())
                .with_field("source", config.source.clone()),
        );
        let control_loop = Self {
            controls: ChargingControls::new(config.clone(), driver.device_id()),
            driver,
            surplus_rx,
            settings_rx,
            cancel,
            failures: ErrorThrottle::default(),
            logger,
        };
        (control_loop, SolarInputs { surplus, settings })
    }

    /// Run until cancelled or every input sender is gone
    pub async fn run(mut self) {
        self.logger.info(&format!(
            "Solar control loop started for connector {}",
            self.controls.connector()
        ));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = self.surplus_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let reading = *self.surplus_rx.borrow_and_update();
                    if let Some(reading) = reading {
                        self.on_reading(reading).await;
                    }
                }
            }
        }
        self.logger.info("Solar control loop stopped");
    }

    async fn on_reading(&mut self, reading: SurplusReading) {
        let settings = *self.settings_rx.borrow();
        let snapshot = self.driver.snapshot();
        let decision = self.controls.evaluate(
            reading,
            snapshot.as_deref(),
            self.driver.availability(),
            settings,
        );

        let setpoint = match decision {
            Decision::Write(amps) => amps,
            Decision::Hold(reason) => {
                self.logger.trace(&format!(
                    "Holding at {:?} for {} W: {:?}",
                    self.controls.state().last_commanded(),
                    reading.watts,
                    reason
                ));
                return;
            }
        };

        let address = RegisterAddress::connector(
            self.controls.connector(),
            Block::ConnectorState,
            status::CURRENT_LIMIT,
        );
        match self
            .driver
            .write_register(address, RegisterValue::unsigned(u32::from(setpoint)))
            .await
        {
            Ok(()) => {
                self.failures.reset();
                self.controls.record_write(setpoint, reading.at);
                self.logger.info(&format!(
                    "Set current limit to {} A for {:.0} W surplus",
                    setpoint, reading.watts
                ));
            }
            Err(err) => {
                if self.failures.record() {
                    self.logger
                        .warn(&format!("Failed to write {} A setpoint: {}", setpoint, err));
                } else {
                    self.logger.debug(&format!("Setpoint write failed: {}", err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::driver::WallboxDriver;
    use crate::error::HeliosError;
    use crate::modbus::ModbusConnectionManager;
    use crate::modbus::mock::MockTransport;
    use crate::registers::RegisterMap;
    use crate::retry::RetryPolicy;
    use std::sync::Arc;
    use std::time::Duration;

    async fn running(
        mock: &MockTransport,
    ) -> (DriverHandle, SolarInputs, CancellationToken, WallboxDriver) {
        let cancel = CancellationToken::new();
        let manager = ModbusConnectionManager::new(
            Box::new(mock.clone()),
            1,
            RetryPolicy::no_retry(),
            cancel.clone(),
        );
        let solar = SolarConfig {
            enabled: true,
            cooldown_secs: 0,
            ..Default::default()
        };
        let (mut driver, handle) = WallboxDriver::new(
            DeviceConfig {
                solar: solar.clone(),
                ..Default::default()
            },
            chrono_tz::UTC,
            Arc::new(RegisterMap::standard().unwrap()),
            Arc::new(manager),
            cancel.clone(),
        );
        driver.poll_once().await.unwrap();
        let (control_loop, inputs) = SolarControlLoop::new(&solar, handle.clone(), cancel.clone());
        tokio::spawn(control_loop.run());
        (handle, inputs, cancel, driver)
    }

    fn charging_station() -> MockTransport {
        MockTransport::new()
            .with_registers(2100, &[0, 1, 1, 3, 4, 1, 6, 60, 32])
            .with_registers(4100, &[2300])
            .with_registers(5000, &[0x0100, 0, 1, 0, 0, 0, 32, 0, 0])
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn surplus_drives_current_limit() {
        let mock = charging_station();
        let (_handle, inputs, cancel, _driver) = running(&mock).await;

        inputs.publish_surplus(4000.0);
        settle().await;
        assert_eq!(mock.writes(), vec![(2106, vec![17])]);

        // Same setpoint again is suppressed
        inputs.publish_surplus(3950.0);
        settle().await;
        assert_eq!(mock.write_count(), 1);

        inputs.publish_surplus(500.0);
        settle().await;
        assert_eq!(mock.writes().last(), Some(&(2106, vec![6])));
        cancel.cancel();
    }

    #[tokio::test]
    async fn disabled_loop_never_writes() {
        let mock = charging_station();
        let (_handle, inputs, cancel, _driver) = running(&mock).await;
        inputs.set_enabled(false);
        inputs.publish_surplus(4000.0);
        settle().await;
        assert_eq!(mock.write_count(), 0);

        inputs.set_enabled(true);
        inputs.publish_surplus(4000.0);
        settle().await;
        assert_eq!(mock.write_count(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn failed_write_is_retried_on_next_reading() {
        let mock = charging_station();
        let (_handle, inputs, cancel, _driver) = running(&mock).await;
        mock.push_failure(HeliosError::protocol(4, "ServerDeviceFailure"));
        inputs.publish_surplus(4000.0);
        settle().await;
        assert_eq!(mock.write_count(), 1);
        assert_eq!(mock.register(2106), 6);

        inputs.publish_surplus(4000.0);
        settle().await;
        assert_eq!(mock.write_count(), 2);
        assert_eq!(mock.register(2106), 17);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unplugged_car_is_left_alone() {
        let mock = charging_station().with_registers(2104, &[1]);
        let (_handle, inputs, cancel, _driver) = running(&mock).await;
        inputs.publish_surplus(4000.0);
        settle().await;
        assert_eq!(mock.write_count(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn low_station_maximum_is_never_exceeded() {
        let mock = charging_station().with_registers(5006, &[5]);
        let (_handle, inputs, cancel, _driver) = running(&mock).await;
        inputs.publish_surplus(10_000.0);
        settle().await;
        assert_eq!(mock.write_count(), 0);
        assert_eq!(mock.register(2106), 6);
        cancel.cancel();
    }
}
