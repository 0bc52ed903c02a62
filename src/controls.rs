//! Solar surplus charging decisions
//!
//! Everything here is synchronous and free of I/O: the control loop task in
//! `solar` feeds readings in and performs the writes this module asks for.

use crate::config::SolarConfig;
use crate::driver::{AvailabilityState, DeviceSnapshot};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::registers::Connector;
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::time::Instant;

/// Lowest current an EV accepts (IEC 61851)
pub const MIN_CHARGE_CURRENT_A: u16 = 6;
/// Ceiling used when the station reports neither a station nor a cable limit
pub const FALLBACK_MAX_CURRENT_A: u16 = 32;
/// Readings beyond this magnitude are treated as sensor glitches
pub const MAX_PLAUSIBLE_SURPLUS_W: f64 = 100_000.0;
/// Measured phase voltage is trusted only inside this window
pub const PLAUSIBLE_VOLTAGE_V: RangeInclusive<f64> = 180.0..=260.0;

/// One surplus sample; positive means export to the grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurplusReading {
    pub watts: f64,
    pub at: Instant,
}

impl SurplusReading {
    pub fn now(watts: f64) -> Self {
        Self {
            watts,
            at: Instant::now(),
        }
    }
}

/// Settings that can change while the loop runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolarSettings {
    pub enabled: bool,
    pub min_current_offset: i32,
}

impl From<&SolarConfig> for SolarSettings {
    fn from(config: &SolarConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_current_offset: config.min_current_offset,
        }
    }
}

/// Inputs of the setpoint formula
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetpointInputs {
    pub surplus_w: f64,
    /// Measured L1 voltage of the controlled connector
    pub measured_voltage_v: Option<f64>,
    pub nominal_voltage_v: f64,
    pub phases: u8,
    pub min_current_offset: i32,
    /// Station or cable limit, whichever is lower
    pub ceiling_a: Option<u16>,
}

/// Current computed for one reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    /// Clamped but unrounded current, compared against the hysteresis band
    pub desired_a: f64,
    /// Whole amps written to the current-limit register
    pub amps: u16,
}

/// Translate surplus power into a current limit
///
/// Fails for implausible readings and for stations whose reported ceiling
/// is below the minimum charge current.
pub fn compute_setpoint(inputs: &SetpointInputs) -> Result<Setpoint, HoldReason> {
    if !inputs.surplus_w.is_finite() || inputs.surplus_w.abs() > MAX_PLAUSIBLE_SURPLUS_W {
        return Err(HoldReason::ImplausibleReading);
    }

    let ceiling = match inputs.ceiling_a {
        Some(c) if c < MIN_CHARGE_CURRENT_A => return Err(HoldReason::CeilingBelowMinimum),
        Some(c) => c.min(FALLBACK_MAX_CURRENT_A),
        None => FALLBACK_MAX_CURRENT_A,
    };

    let voltage = inputs
        .measured_voltage_v
        .filter(|v| PLAUSIBLE_VOLTAGE_V.contains(v))
        .unwrap_or(inputs.nominal_voltage_v);
    let phases = f64::from(inputs.phases.max(1));
    let mut desired = inputs.surplus_w / (voltage * phases);

    if desired < f64::from(MIN_CHARGE_CURRENT_A) {
        desired += f64::from(inputs.min_current_offset);
    }

    let desired_a = desired.clamp(f64::from(MIN_CHARGE_CURRENT_A), f64::from(ceiling));
    Ok(Setpoint {
        desired_a,
        amps: desired_a.round() as u16,
    })
}

/// Why a reading did not lead to a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    Disabled,
    Unavailable,
    NoSnapshot,
    Stale,
    /// Controlled connector missing on this station
    NoConnector,
    NotChargeable,
    ImplausibleReading,
    /// Station or cable limit below the minimum charge current
    CeilingBelowMinimum,
    /// Within the hysteresis band of the last commanded value
    WithinHysteresis,
    Cooldown,
}

/// Outcome of evaluating one reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Write(u16),
    Hold(HoldReason),
}

/// Memory of what the loop last computed and commanded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlLoopState {
    last_surplus_w: Option<f64>,
    last_desired_a: Option<f64>,
    last_commanded_a: Option<u16>,
    last_write_at: Option<Instant>,
    epoch: Option<u64>,
}

impl ControlLoopState {
    pub fn last_commanded(&self) -> Option<u16> {
        self.last_commanded_a
    }

    pub fn last_surplus_w(&self) -> Option<f64> {
        self.last_surplus_w
    }

    pub fn last_desired_a(&self) -> Option<f64> {
        self.last_desired_a
    }

    /// Forget the last write when the connection was rebuilt
    pub fn observe_epoch(&mut self, epoch: u64) -> bool {
        if self.epoch.is_some_and(|e| e != epoch) {
            *self = Self {
                epoch: Some(epoch),
                ..Self::default()
            };
            return true;
        }
        self.epoch = Some(epoch);
        false
    }

    pub fn record_computation(&mut self, surplus_w: f64, setpoint: &Setpoint) {
        self.last_surplus_w = Some(surplus_w);
        self.last_desired_a = Some(setpoint.desired_a);
    }

    pub fn hold_reason(
        &self,
        setpoint: &Setpoint,
        hysteresis_a: f64,
        cooldown: Duration,
        now: Instant,
    ) -> Option<HoldReason> {
        if let Some(last) = self.last_commanded_a
            && (setpoint.amps == last
                || (setpoint.desired_a - f64::from(last)).abs() <= hysteresis_a)
        {
            return Some(HoldReason::WithinHysteresis);
        }
        if let Some(at) = self.last_write_at
            && now.saturating_duration_since(at) < cooldown
        {
            return Some(HoldReason::Cooldown);
        }
        None
    }

    pub fn record_write(&mut self, amps: u16, now: Instant) {
        self.last_commanded_a = Some(amps);
        self.last_write_at = Some(now);
    }
}

/// Solar controller for one connector
#[derive(Debug, Clone)]
pub struct ChargingControls {
    config: SolarConfig,
    connector: Connector,
    state: ControlLoopState,
    logger: StructuredLogger,
}

impl ChargingControls {
    pub fn new(config: SolarConfig, device_id: &str) -> Self {
        let connector = Connector::from(config.connector);
        Self {
            config,
            connector,
            state: ControlLoopState::default(),
            logger: get_logger_with_context(LogContext::new("controls").with_device(device_id)),
        }
    }

    pub fn connector(&self) -> Connector {
        self.connector
    }

    pub fn state(&self) -> &ControlLoopState {
        &self.state
    }

    /// Decide what to do with a reading given the current device view
    pub fn evaluate(
        &mut self,
        reading: SurplusReading,
        snapshot: Option<&DeviceSnapshot>,
        availability: AvailabilityState,
        settings: SolarSettings,
    ) -> Decision {
        if !settings.enabled {
            return Decision::Hold(HoldReason::Disabled);
        }
        if !availability.is_available() {
            return Decision::Hold(HoldReason::Unavailable);
        }
        let Some(snapshot) = snapshot else {
            return Decision::Hold(HoldReason::NoSnapshot);
        };
        if self.state.observe_epoch(snapshot.connection_epoch) {
            self.logger
                .info("Connection rebuilt; forgetting last commanded current");
        }
        if snapshot.stale {
            return Decision::Hold(HoldReason::Stale);
        }
        let Some(conn) = snapshot.connector(self.connector) else {
            return Decision::Hold(HoldReason::NoConnector);
        };
        if !conn.ev_state.is_chargeable() {
            return Decision::Hold(HoldReason::NotChargeable);
        }

        let inputs = SetpointInputs {
            surplus_w: reading.watts,
            measured_voltage_v: Some(conn.phases[0].voltage_v),
            nominal_voltage_v: self.config.nominal_voltage,
            phases: self.config.phases,
            min_current_offset: settings.min_current_offset,
            ceiling_a: snapshot.current_ceiling_a(self.connector),
        };
        let setpoint = match compute_setpoint(&inputs) {
            Ok(setpoint) => setpoint,
            Err(reason) => {
                self.logger.debug(&format!(
                    "No setpoint for {} W (ceiling {:?}): {:?}",
                    reading.watts, inputs.ceiling_a, reason
                ));
                return Decision::Hold(reason);
            }
        };
        self.state.record_computation(reading.watts, &setpoint);

        match self.state.hold_reason(
            &setpoint,
            self.config.hysteresis_amps,
            Duration::from_secs(self.config.cooldown_secs),
            reading.at,
        ) {
            Some(reason) => Decision::Hold(reason),
            None => Decision::Write(setpoint.amps),
        }
    }

    pub fn record_write(&mut self, setpoint: u16, at: Instant) {
        self.state.record_write(setpoint, at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ConnectorSnapshot, EnergyCounters, PhaseReading, StationSnapshot};
    use crate::registers::{ChargingMode, ControlPilot, ErrorFlags, EvState, Switch};
    use crate::topology::ConnectorTopology;

    fn inputs(surplus_w: f64) -> SetpointInputs {
        SetpointInputs {
            surplus_w,
            measured_voltage_v: Some(230.0),
            nominal_voltage_v: 230.0,
            phases: 1,
            min_current_offset: 0,
            ceiling_a: Some(32),
        }
    }

    fn snapshot(ev_state: EvState, epoch: u64) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: "wb".into(),
            sequence: 1,
            timestamp: chrono::Utc::now(),
            topology: ConnectorTopology::Single,
            connection_epoch: epoch,
            stale: false,
            station: StationSnapshot {
                firmware_version: "1.0".into(),
                serial_number: 1,
                automatic: Switch::Off,
                max_station_current_a: 32,
                led_brightness: 0,
            },
            connectors: vec![ConnectorSnapshot {
                connector: Connector::A,
                ev_state,
                control_pilot: ControlPilot::C,
                errors: ErrorFlags::default(),
                charging_mode: ChargingMode::Solar,
                charging_enabled: Switch::On,
                user_verified: Switch::On,
                current_limit_a: 6,
                charge_current_a: 0.0,
                cable_limit_a: 32,
                phases: [PhaseReading {
                    voltage_v: 230.0,
                    current_a: 0.0,
                    power_w: 0.0,
                }; 3],
                total_power_w: 0.0,
                session_energy_kwh: 0.0,
                total_energy_kwh: 0.0,
                energy: EnergyCounters::default(),
            }],
        }
    }

    fn controls() -> ChargingControls {
        ChargingControls::new(
            SolarConfig {
                enabled: true,
                ..Default::default()
            },
            "wb",
        )
    }

    fn amps(i: &SetpointInputs) -> Option<u16> {
        compute_setpoint(i).ok().map(|s| s.amps)
    }

    fn at(desired_a: f64) -> Setpoint {
        Setpoint {
            desired_a,
            amps: desired_a.round() as u16,
        }
    }

    const ON: SolarSettings = SolarSettings {
        enabled: true,
        min_current_offset: 0,
    };

    #[test]
    fn setpoint_examples() {
        assert_eq!(amps(&inputs(4000.0)), Some(17));
        assert_eq!(amps(&inputs(500.0)), Some(6));
        assert_eq!(amps(&inputs(-2000.0)), Some(6));
        assert_eq!(amps(&inputs(20_000.0)), Some(32));
    }

    #[test]
    fn implausible_readings_are_ignored() {
        for watts in [f64::NAN, f64::INFINITY, 150_000.0, -150_000.0] {
            assert_eq!(
                compute_setpoint(&inputs(watts)),
                Err(HoldReason::ImplausibleReading)
            );
        }
    }

    #[test]
    fn voltage_outside_window_uses_nominal() {
        let mut i = inputs(4600.0);
        i.measured_voltage_v = Some(0.0);
        assert_eq!(amps(&i), Some(20));
        i.measured_voltage_v = Some(250.0);
        assert_eq!(amps(&i), Some(18));
    }

    #[test]
    fn three_phase_divides_by_phase_count() {
        let mut i = inputs(11_040.0);
        i.phases = 3;
        assert_eq!(amps(&i), Some(16));
    }

    #[test]
    fn offset_applies_only_below_minimum() {
        let mut i = inputs(1150.0);
        i.min_current_offset = 3;
        // 5 A + 3 A offset
        assert_eq!(amps(&i), Some(8));
        i.surplus_w = 2300.0;
        assert_eq!(amps(&i), Some(10));
    }

    #[test]
    fn ceiling_uses_reported_limits() {
        let mut i = inputs(10_000.0);
        i.ceiling_a = Some(16);
        assert_eq!(amps(&i), Some(16));
        i.ceiling_a = Some(40);
        assert_eq!(amps(&i), Some(32));
        i.ceiling_a = None;
        assert_eq!(amps(&i), Some(32));
    }

    #[test]
    fn ceiling_below_minimum_is_never_widened() {
        let mut i = inputs(10_000.0);
        i.ceiling_a = Some(5);
        assert_eq!(compute_setpoint(&i), Err(HoldReason::CeilingBelowMinimum));
    }

    #[test]
    fn hysteresis_and_cooldown() {
        let now = Instant::now();
        let mut state = ControlLoopState::default();
        assert_eq!(state.hold_reason(&at(6.0), 0.5, Duration::from_secs(10), now), None);
        state.record_write(6, now);
        assert_eq!(
            state.hold_reason(&at(6.0), 0.5, Duration::from_secs(10), now),
            Some(HoldReason::WithinHysteresis)
        );
        assert_eq!(
            state.hold_reason(&at(8.0), 0.5, Duration::from_secs(10), now + Duration::from_secs(3)),
            Some(HoldReason::Cooldown)
        );
        assert_eq!(
            state.hold_reason(&at(8.0), 0.5, Duration::from_secs(10), now + Duration::from_secs(11)),
            None
        );
    }

    #[test]
    fn hysteresis_compares_unrounded_current() {
        let now = Instant::now();
        let mut state = ControlLoopState::default();
        state.record_write(6, now);
        let later = now + Duration::from_secs(60);

        // 1702 W at 230 V is 7.4 A: outside a 1 A band around 6 A
        let setpoint = compute_setpoint(&inputs(1702.0)).unwrap();
        assert!((setpoint.desired_a - 7.4).abs() < 1e-9);
        assert_eq!(setpoint.amps, 7);
        assert_eq!(state.hold_reason(&setpoint, 1.0, Duration::ZERO, later), None);

        // 6.9 A rounds to 7 but stays inside the band
        assert_eq!(
            state.hold_reason(&at(6.9), 1.0, Duration::ZERO, later),
            Some(HoldReason::WithinHysteresis)
        );
    }

    #[test]
    fn epoch_change_resets_state() {
        let mut state = ControlLoopState::default();
        assert!(!state.observe_epoch(1));
        state.record_write(10, Instant::now());
        assert!(!state.observe_epoch(1));
        assert_eq!(state.last_commanded(), Some(10));
        assert!(state.observe_epoch(2));
        assert_eq!(state.last_commanded(), None);
    }

    #[test]
    fn evaluate_gates() {
        let mut c = controls();
        let reading = SurplusReading::now(4000.0);
        let snap = snapshot(EvState::Charging, 1);

        let off = SolarSettings {
            enabled: false,
            ..ON
        };
        assert_eq!(
            c.evaluate(reading, Some(&snap), AvailabilityState::Available, off),
            Decision::Hold(HoldReason::Disabled)
        );
        assert_eq!(
            c.evaluate(reading, Some(&snap), AvailabilityState::Unavailable, ON),
            Decision::Hold(HoldReason::Unavailable)
        );
        let mut stale = snap.clone();
        stale.stale = true;
        assert_eq!(
            c.evaluate(reading, Some(&stale), AvailabilityState::Available, ON),
            Decision::Hold(HoldReason::Stale)
        );
        let unplugged = snapshot(EvState::CableUnplugged, 1);
        assert_eq!(
            c.evaluate(reading, Some(&unplugged), AvailabilityState::Available, ON),
            Decision::Hold(HoldReason::NotChargeable)
        );
        assert_eq!(
            c.evaluate(reading, Some(&snap), AvailabilityState::Available, ON),
            Decision::Write(17)
        );
    }

    #[test]
    fn no_write_when_already_at_minimum() {
        let mut c = controls();
        let snap = snapshot(EvState::Charging, 1);
        let first = SurplusReading::now(500.0);
        assert_eq!(
            c.evaluate(first, Some(&snap), AvailabilityState::Available, ON),
            Decision::Write(6)
        );
        c.record_write(6, first.at);
        let later = SurplusReading {
            watts: 600.0,
            at: first.at + Duration::from_secs(60),
        };
        assert_eq!(
            c.evaluate(later, Some(&snap), AvailabilityState::Available, ON),
            Decision::Hold(HoldReason::WithinHysteresis)
        );
        assert_eq!(c.state().last_surplus_w(), Some(600.0));
        assert_eq!(c.state().last_desired_a(), Some(6.0));
    }

    #[test]
    fn low_station_maximum_holds() {
        let mut c = controls();
        let mut snap = snapshot(EvState::Charging, 1);
        snap.station.max_station_current_a = 5;
        assert_eq!(
            c.evaluate(
                SurplusReading::now(10_000.0),
                Some(&snap),
                AvailabilityState::Available,
                ON
            ),
            Decision::Hold(HoldReason::CeilingBelowMinimum)
        );
    }
}
