//! Consumer-facing handle and command validation
//!
//! Every check runs before any I/O: read-only devices, unavailable devices
//! and out-of-range values are rejected without touching the wire.

use super::energy::CounterPeriods;
use super::types::{AvailabilityState, DeviceSnapshot, DriverCommand, LinkState};
use crate::error::{HeliosError, Result};
use crate::modbus::{ConnectionStats, ModbusConnectionManager};
use crate::registers::{
    Block, ChargingMode, Connector, RegisterAddress, RegisterMap, RegisterValue, StateValue,
    Switch, encode, global, status,
};
use crate::topology::ConnectorTopology;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};

/// Stream of published snapshots, starting with the current one
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Arc<DeviceSnapshot>> + Send>>;

/// Absolute hardware limit of the current-limit register
pub const MAX_CURRENT_LIMIT_A: u16 = 32;
pub const MAX_LED_BRIGHTNESS: u16 = 1000;

/// High-level device commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WallboxCommand {
    StartCharging {
        connector: Connector,
    },
    StopCharging {
        connector: Connector,
    },
    /// Mark the session as authorized (verify-user register)
    AuthorizeCharging {
        connector: Connector,
    },
    SetCurrentLimit {
        connector: Connector,
        amps: u16,
    },
    SetChargingMode {
        connector: Connector,
        mode: ChargingMode,
    },
    SetLedBrightness {
        level: u16,
    },
    /// Zero derived energy counters; `None` means every connector
    ResetEnergyCounters {
        connector: Option<Connector>,
        periods: CounterPeriods,
    },
    /// Drop the session and reconnect on the next cycle
    Reconnect,
}

/// Cloneable access to one running driver
#[derive(Clone)]
pub struct DriverHandle {
    device_id: String,
    read_only: bool,
    map: Arc<RegisterMap>,
    manager: Arc<ModbusConnectionManager>,
    snapshots: watch::Receiver<Option<Arc<DeviceSnapshot>>>,
    availability: watch::Receiver<AvailabilityState>,
    link: watch::Receiver<LinkState>,
    commands: mpsc::UnboundedSender<DriverCommand>,
}

impl DriverHandle {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        device_id: String,
        read_only: bool,
        map: Arc<RegisterMap>,
        manager: Arc<ModbusConnectionManager>,
        snapshots: watch::Receiver<Option<Arc<DeviceSnapshot>>>,
        availability: watch::Receiver<AvailabilityState>,
        link: watch::Receiver<LinkState>,
        commands: mpsc::UnboundedSender<DriverCommand>,
    ) -> Self {
        Self {
            device_id,
            read_only,
            map,
            manager,
            snapshots,
            availability,
            link,
            commands,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Latest snapshot, if any cycle has succeeded yet
    pub fn snapshot(&self) -> Option<Arc<DeviceSnapshot>> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> SnapshotStream {
        Box::pin(WatchStream::new(self.snapshots.clone()).filter_map(|s| s))
    }

    /// Raw watch receiver for tasks that select on changes
    pub fn snapshot_receiver(&self) -> watch::Receiver<Option<Arc<DeviceSnapshot>>> {
        self.snapshots.clone()
    }

    pub fn availability(&self) -> AvailabilityState {
        *self.availability.borrow()
    }

    pub fn availability_receiver(&self) -> watch::Receiver<AvailabilityState> {
        self.availability.clone()
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.manager.stats()
    }

    /// Validate and execute a command
    pub async fn command(&self, command: WallboxCommand) -> Result<()> {
        match command {
            WallboxCommand::ResetEnergyCounters { connector, periods } => {
                if periods.is_empty() {
                    return Err(HeliosError::validation(
                        "periods",
                        "Select at least one counter to reset",
                    ));
                }
                self.round_trip(|reply| DriverCommand::ResetEnergy {
                    connector,
                    periods,
                    reply,
                })
                .await
            }
            WallboxCommand::Reconnect => {
                self.round_trip(|reply| DriverCommand::Reconnect { reply })
                    .await
            }
            other => {
                let (address, value) = self.plan_write(other)?;
                self.write_register(address, value).await
            }
        }
    }

    /// Map a register command to its address and value, validating ranges
    fn plan_write(&self, command: WallboxCommand) -> Result<(RegisterAddress, RegisterValue)> {
        let state = |connector, offset| {
            RegisterAddress::connector(connector, Block::ConnectorState, offset)
        };
        let switch = |on: bool| RegisterValue::State(StateValue::Switch(Switch::from(on)));

        match command {
            WallboxCommand::StartCharging { connector } => {
                Ok((state(connector, status::CHARGING_ENABLE), switch(true)))
            }
            WallboxCommand::StopCharging { connector } => {
                Ok((state(connector, status::CHARGING_ENABLE), switch(false)))
            }
            WallboxCommand::AuthorizeCharging { connector } => {
                Ok((state(connector, status::VERIFY_USER), switch(true)))
            }
            WallboxCommand::SetCurrentLimit { connector, amps } => {
                if amps > MAX_CURRENT_LIMIT_A {
                    return Err(HeliosError::validation(
                        "current_limit",
                        format!("{} A exceeds {} A", amps, MAX_CURRENT_LIMIT_A),
                    ));
                }
                Ok((
                    state(connector, status::CURRENT_LIMIT),
                    RegisterValue::unsigned(u32::from(amps)),
                ))
            }
            WallboxCommand::SetChargingMode { connector, mode } => {
                if let ChargingMode::Unknown(code) = mode {
                    return Err(HeliosError::validation(
                        "charging_mode",
                        format!("Unknown charging mode {}", code),
                    ));
                }
                Ok((
                    state(connector, status::CHARGING_MODE),
                    RegisterValue::State(StateValue::Mode(mode)),
                ))
            }
            WallboxCommand::SetLedBrightness { level } => {
                if level > MAX_LED_BRIGHTNESS {
                    return Err(HeliosError::validation(
                        "led_brightness",
                        format!("{} exceeds {}", level, MAX_LED_BRIGHTNESS),
                    ));
                }
                Ok((
                    RegisterAddress::global(global::LED_BRIGHTNESS),
                    RegisterValue::unsigned(u32::from(level)),
                ))
            }
            WallboxCommand::ResetEnergyCounters { .. } | WallboxCommand::Reconnect => Err(
                HeliosError::generic("Command does not map to a register write"),
            ),
        }
    }

    /// Write one register through the map
    ///
    /// Rejects read-only devices, unavailable devices, unknown or read-only
    /// registers, connector B on single-connector stations and values outside
    /// the register's range.
    pub async fn write_register(&self, address: RegisterAddress, value: RegisterValue) -> Result<()> {
        if self.read_only {
            return Err(HeliosError::read_only(format!(
                "Device {} is configured read-only",
                self.device_id
            )));
        }

        let def = self.map.resolve(&address)?;
        if !def.writable {
            return Err(HeliosError::validation(
                def.name,
                "Register is not writable",
            ));
        }
        let words = encode(def, &value)?;

        if !self.availability().is_available() {
            return Err(HeliosError::unavailable(format!(
                "Device {} is unavailable",
                self.device_id
            )));
        }
        if address.connector_id() == Some(Connector::B)
            && self
                .snapshot()
                .is_some_and(|s| s.topology == ConnectorTopology::Single)
        {
            return Err(HeliosError::validation(
                "connector",
                "Station has a single connector",
            ));
        }

        if address.block() == Block::ConnectorState && address.offset() == status::CURRENT_LIMIT {
            self.check_station_maximum(&words)?;
        }

        match words.as_slice() {
            [word] => self.manager.write_single(address.absolute(), *word).await,
            _ => self.manager.write_block(address.absolute(), words).await,
        }
    }

    /// Current limits above the station maximum reported by the last snapshot
    fn check_station_maximum(&self, words: &[u16]) -> Result<()> {
        let Some(max) = self
            .snapshot()
            .map(|s| s.station.max_station_current_a)
            .filter(|m| *m > 0)
        else {
            return Ok(());
        };
        match words.first() {
            Some(&amps) if amps > max => Err(HeliosError::validation(
                "current_limit",
                format!("{} A exceeds station maximum {} A", amps, max),
            )),
            _ => Ok(()),
        }
    }

    async fn round_trip<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> DriverCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| HeliosError::unavailable("Driver task is not running"))?;
        rx.await
            .map_err(|_| HeliosError::unavailable("Driver task stopped before replying"))?
    }
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("device_id", &self.device_id)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl super::WallboxDriver {
    pub(crate) async fn handle_command(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::ResetEnergy {
                connector,
                periods,
                reply,
            } => {
                self.logger.info(&format!(
                    "Resetting energy counters {:?} for {}",
                    periods,
                    connector.map_or_else(|| "all connectors".to_string(), |c| c.to_string())
                ));
                self.reset_energy(connector, periods);
                let _ = reply.send(Ok(()));
            }
            DriverCommand::Reconnect { reply } => {
                self.logger.info("Reconnect requested");
                self.manager.disconnect().await;
                self.topology = None;
                self.set_link(LinkState::Disconnected);
                let _ = reply.send(Ok(()));
            }
        }
    }
}
