use crate::driver::energy::{CounterPeriods, EnergyCounters};
use crate::error::Result;
use crate::registers::{ChargingMode, Connector, ControlPilot, ErrorFlags, EvState, Switch};
use crate::topology::ConnectorTopology;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

/// Coordinator connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Polling,
    /// Recent cycles failed but the failure threshold is not reached yet
    Degraded,
}

/// Whether consumers should trust the device right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AvailabilityState {
    Unavailable,
    Available,
}

impl AvailabilityState {
    pub fn is_available(self) -> bool {
        matches!(self, AvailabilityState::Available)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseReading {
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
}

/// Decoded state of one connector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorSnapshot {
    pub connector: Connector,
    pub ev_state: EvState,
    pub control_pilot: ControlPilot,
    pub errors: ErrorFlags,
    pub charging_mode: ChargingMode,
    pub charging_enabled: Switch,
    pub user_verified: Switch,
    /// Setpoint currently configured on the station
    pub current_limit_a: u16,
    /// Current actually drawn by the car
    pub charge_current_a: f64,
    /// Limit imposed by the cable (proximity pilot)
    pub cable_limit_a: u16,
    pub phases: [PhaseReading; 3],
    pub total_power_w: f64,
    pub session_energy_kwh: f64,
    pub total_energy_kwh: f64,
    pub energy: EnergyCounters,
}

/// Station-wide values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationSnapshot {
    pub firmware_version: String,
    pub serial_number: u32,
    pub automatic: Switch,
    pub max_station_current_a: u16,
    pub led_brightness: u16,
}

/// One consistent view of a wallbox
///
/// Snapshots are immutable and replaced wholesale every cycle; consumers
/// hold them behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    /// Strictly increasing per device
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub topology: ConnectorTopology,
    /// Successful connects so far; changes on every reconnect
    pub connection_epoch: u64,
    /// Values are from before the device became unavailable
    pub stale: bool,
    pub station: StationSnapshot,
    pub connectors: Vec<ConnectorSnapshot>,
}

impl DeviceSnapshot {
    pub fn connector(&self, connector: Connector) -> Option<&ConnectorSnapshot> {
        self.connectors.iter().find(|c| c.connector == connector)
    }

    /// Highest current the connector may be given, when the device reports one
    pub fn current_ceiling_a(&self, connector: Connector) -> Option<u16> {
        let station = Some(self.station.max_station_current_a).filter(|a| *a > 0);
        let cable = self
            .connector(connector)
            .map(|c| c.cable_limit_a)
            .filter(|a| *a > 0);
        match (station, cable) {
            (Some(s), Some(c)) => Some(s.min(c)),
            (s, c) => s.or(c),
        }
    }
}

/// Requests handled inside the polling task
#[derive(Debug)]
pub enum DriverCommand {
    ResetEnergy {
        connector: Option<Connector>,
        periods: CounterPeriods,
        reply: oneshot::Sender<Result<()>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<()>>,
    },
}
