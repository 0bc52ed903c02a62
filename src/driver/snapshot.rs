use super::energy::EnergyTracker;
use super::types::{ConnectorSnapshot, DeviceSnapshot, PhaseReading, StationSnapshot};
use crate::registers::{
    ChargingMode, Connector, ControlPilot, DecodedBlock, StateValue, firmware_string, global,
    status, wattmeter,
};
use crate::topology::ConnectorTopology;
use chrono::{DateTime, Utc};

fn whole_amps(block: &DecodedBlock, offset: u16) -> u16 {
    block.raw_u32(offset).min(u32::from(u16::MAX)) as u16
}

fn phases(meter: &DecodedBlock) -> [PhaseReading; 3] {
    std::array::from_fn(|i| {
        let i = i as u16;
        PhaseReading {
            voltage_v: meter.f64(wattmeter::VOLTAGE_L1 + i),
            current_a: meter.f64(wattmeter::CURRENT_L1 + i),
            power_w: meter.f64(wattmeter::POWER_L1 + i),
        }
    })
}

pub(super) fn station_snapshot(global_block: &DecodedBlock) -> StationSnapshot {
    StationSnapshot {
        firmware_version: firmware_string(global_block.raw_u32(global::FIRMWARE_VERSION) as u16),
        serial_number: global_block.raw_u32(global::SERIAL_NUMBER),
        automatic: global_block.switch(global::AUTOMATIC),
        max_station_current_a: whole_amps(global_block, global::MAX_STATION_CURRENT),
        led_brightness: whole_amps(global_block, global::LED_BRIGHTNESS),
    }
}

impl super::WallboxDriver {
    /// Build a snapshot from a complete set of block reads
    ///
    /// The energy baselines advance here, so this must only be called once
    /// every read of the cycle has succeeded.
    pub(super) fn assemble(
        &mut self,
        now: DateTime<Utc>,
        topology: ConnectorTopology,
        connectors: &[(Connector, DecodedBlock, DecodedBlock)],
        global_block: &DecodedBlock,
    ) -> DeviceSnapshot {
        let connectors = connectors
            .iter()
            .map(|(connector, state, meter)| {
                let total_wh = u64::from(meter.raw_u32(wattmeter::TOTAL_ENERGY));
                let tz = self.tz;
                let energy = self
                    .energy
                    .entry(*connector)
                    .or_insert_with(|| EnergyTracker::new(tz))
                    .update(total_wh, now);

                ConnectorSnapshot {
                    connector: *connector,
                    ev_state: state.ev_state(),
                    control_pilot: match state.state(status::CONTROL_PILOT) {
                        Some(StateValue::Pilot(p)) => p,
                        _ => ControlPilot::Unknown(0),
                    },
                    errors: state.error_flags(),
                    charging_mode: match state.state(status::CHARGING_MODE) {
                        Some(StateValue::Mode(m)) => m,
                        _ => ChargingMode::Unknown(0),
                    },
                    charging_enabled: state.switch(status::CHARGING_ENABLE),
                    user_verified: state.switch(status::VERIFY_USER),
                    current_limit_a: whole_amps(state, status::CURRENT_LIMIT),
                    charge_current_a: state.f64(status::CHARGE_CURRENT),
                    cable_limit_a: whole_amps(state, status::CABLE_LIMIT),
                    phases: phases(meter),
                    total_power_w: meter.f64(wattmeter::TOTAL_POWER),
                    session_energy_kwh: meter.f64(wattmeter::SESSION_ENERGY) / 1000.0,
                    total_energy_kwh: total_wh as f64 / 1000.0,
                    energy,
                }
            })
            .collect();

        DeviceSnapshot {
            device_id: self.device_id.clone(),
            sequence: 0,
            timestamp: now,
            topology,
            connection_epoch: self.manager.connection_epoch(),
            stale: false,
            station: station_snapshot(global_block),
            connectors,
        }
    }

    /// Apply a manual counter reset and republish the current values
    pub(super) fn reset_energy(
        &mut self,
        connector: Option<Connector>,
        periods: super::energy::CounterPeriods,
    ) {
        for (c, tracker) in self.energy.iter_mut() {
            if connector.is_none_or(|wanted| wanted == *c) {
                tracker.reset(periods);
            }
        }

        let last = self.snapshot_tx.borrow().clone();
        if let Some(last) = last {
            let mut updated = (*last).clone();
            for snap in updated.connectors.iter_mut() {
                if let Some(tracker) = self.energy.get(&snap.connector) {
                    snap.energy = tracker.counters();
                }
            }
            updated.timestamp = Utc::now();
            self.publish(updated);
        }
    }
}
