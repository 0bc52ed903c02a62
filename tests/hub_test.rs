//! End-to-end behaviour of the hub with in-memory devices

use helios::config::{Config, DeviceConfig, RetryConfig, SolarConfig};
use helios::driver::{AvailabilityState, CounterPeriods, DeviceSnapshot, WallboxCommand};
use helios::error::HeliosError;
use helios::hub::WallboxHub;
use helios::modbus::mock::MockTransport;
use helios::registers::Connector;
use helios::topology::ConnectorTopology;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

const WAIT: Duration = Duration::from_secs(5);

fn station(total_energy_wh: u32) -> MockTransport {
    let [hi, lo] = [(total_energy_wh >> 16) as u16, total_energy_wh as u16];
    MockTransport::new()
        .with_registers(2100, &[0, 1, 0, 3, 4, 1, 16, 160, 32])
        .with_registers(
            4100,
            &[2300, 2300, 2300, 160, 160, 160, 0, 500, hi, lo, 3680, 3680, 3680, 11040],
        )
        .with_registers(5000, &[0x0104, 0, 99, 1, 0, 0, 32, 0, 300])
}

fn dual_station() -> MockTransport {
    station(10_000)
        .with_registers(2000, &[0, 0, 0, 1, 1, 0, 0, 0, 0])
        .with_registers(4000, &[2290])
}

fn config(ids: &[&str], solar: bool) -> Config {
    Config {
        retry: RetryConfig {
            max_attempts: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
        },
        devices: ids
            .iter()
            .enumerate()
            .map(|(i, id)| DeviceConfig {
                id: (*id).to_string(),
                host: format!("10.0.0.{}", i + 1),
                poll_interval_ms: 20,
                failure_threshold: 3,
                solar: SolarConfig {
                    enabled: solar,
                    cooldown_secs: 0,
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn start(cfg: &Config, mocks: &HashMap<String, MockTransport>) -> WallboxHub {
    WallboxHub::start_with_transports(cfg, |device| Box::new(mocks[&device.id].clone())).unwrap()
}

async fn wait_for<F>(hub: &WallboxHub, id: &str, pred: F) -> Arc<DeviceSnapshot>
where
    F: Fn(&DeviceSnapshot) -> bool,
{
    let mut stream = hub.subscribe(id).unwrap();
    tokio::time::timeout(WAIT, async {
        while let Some(snap) = stream.next().await {
            if pred(&snap) {
                return snap;
            }
        }
        panic!("snapshot stream ended");
    })
    .await
    .expect("timed out waiting for snapshot")
}

async fn wait_availability(hub: &WallboxHub, id: &str, want: AvailabilityState) {
    tokio::time::timeout(WAIT, async {
        while hub.get_availability(id).unwrap() != want {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for availability");
}

#[tokio::test]
async fn snapshots_are_published_in_order() {
    let mocks = HashMap::from([("wb".to_string(), station(10_000))]);
    let hub = start(&config(&["wb"], false), &mocks);

    let mut stream = hub.subscribe("wb").unwrap();
    let mut last = 0;
    for _ in 0..5 {
        let snap = tokio::time::timeout(WAIT, stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(snap.sequence > last);
        last = snap.sequence;
        assert_eq!(snap.topology, ConnectorTopology::Single);
        let a = snap.connector(Connector::A).unwrap();
        assert!((a.total_power_w - 11040.0).abs() < 1e-9);
        assert_eq!(snap.station.firmware_version, "1.4");
    }
    assert_eq!(hub.get_availability("wb").unwrap(), AvailabilityState::Available);
    hub.shutdown().await;
}

#[tokio::test]
async fn dual_station_reports_both_connectors() {
    let mocks = HashMap::from([("wb".to_string(), dual_station())]);
    let hub = start(&config(&["wb"], false), &mocks);

    let snap = wait_for(&hub, "wb", |_| true).await;
    assert_eq!(snap.topology, ConnectorTopology::Dual);
    assert_eq!(snap.connectors.len(), 2);
    let b = snap.connector(Connector::B).unwrap();
    assert!((b.phases[0].voltage_v - 229.0).abs() < 1e-9);
    hub.shutdown().await;
}

#[tokio::test]
async fn outage_marks_unavailable_and_recovers() {
    let mock = station(10_000);
    let mocks = HashMap::from([("wb".to_string(), mock.clone())]);
    let hub = start(&config(&["wb"], false), &mocks);
    wait_availability(&hub, "wb", AvailabilityState::Available).await;

    mock.set_persistent_failure(Some(HeliosError::timeout("cable cut")));
    wait_availability(&hub, "wb", AvailabilityState::Unavailable).await;
    let stale = hub.get_snapshot("wb").unwrap().unwrap();
    assert!(stale.stale);

    let err = hub
        .command("wb", WallboxCommand::StartCharging { connector: Connector::A })
        .await
        .unwrap_err();
    assert!(matches!(err, HeliosError::Unavailable { .. }));

    mock.set_persistent_failure(None);
    let fresh = wait_for(&hub, "wb", |s| !s.stale).await;
    assert!(fresh.sequence > stale.sequence);
    assert!(fresh.connection_epoch > stale.connection_epoch);
    assert_eq!(hub.get_availability("wb").unwrap(), AvailabilityState::Available);
    hub.shutdown().await;
}

#[tokio::test]
async fn devices_are_independent() {
    let good = station(10_000);
    let bad = station(10_000);
    bad.set_refuse_connect(true);
    let mocks = HashMap::from([
        ("good".to_string(), good),
        ("bad".to_string(), bad),
    ]);
    let hub = start(&config(&["good", "bad"], false), &mocks);

    wait_for(&hub, "good", |s| s.sequence >= 3).await;
    assert_eq!(hub.get_availability("good").unwrap(), AvailabilityState::Available);
    assert_eq!(hub.get_availability("bad").unwrap(), AvailabilityState::Unavailable);
    assert!(hub.get_snapshot("bad").unwrap().is_none());
    hub.shutdown().await;
}

#[tokio::test]
async fn commands_write_through_the_hub() {
    let mock = station(10_000);
    let mocks = HashMap::from([("wb".to_string(), mock.clone())]);
    let hub = start(&config(&["wb"], false), &mocks);
    wait_availability(&hub, "wb", AvailabilityState::Available).await;

    hub.command(
        "wb",
        WallboxCommand::SetCurrentLimit {
            connector: Connector::A,
            amps: 10,
        },
    )
    .await
    .unwrap();
    assert_eq!(mock.register(2106), 10);

    let snap = wait_for(&hub, "wb", |s| {
        s.connector(Connector::A)
            .is_some_and(|c| c.current_limit_a == 10)
    })
    .await;
    assert!(!snap.stale);
    hub.shutdown().await;
}

#[tokio::test]
async fn energy_counters_track_and_reset() {
    let mock = station(10_000);
    let mocks = HashMap::from([("wb".to_string(), mock.clone())]);
    let hub = start(&config(&["wb"], false), &mocks);
    wait_for(&hub, "wb", |_| true).await;

    // +1.5 kWh on the cumulative register
    mock.set_registers(4108, &[0, 11_500]);
    let snap = wait_for(&hub, "wb", |s| {
        s.connector(Connector::A)
            .is_some_and(|c| c.energy.daily_kwh > 1.0)
    })
    .await;
    let energy = snap.connector(Connector::A).unwrap().energy;
    assert!((energy.daily_kwh - 1.5).abs() < 1e-9);
    assert!((energy.yearly_kwh - 1.5).abs() < 1e-9);

    hub.command(
        "wb",
        WallboxCommand::ResetEnergyCounters {
            connector: None,
            periods: CounterPeriods {
                daily: true,
                ..Default::default()
            },
        },
    )
    .await
    .unwrap();
    let snap = hub.get_snapshot("wb").unwrap().unwrap();
    let energy = snap.connector(Connector::A).unwrap().energy;
    assert!(energy.daily_kwh.abs() < 1e-9);
    assert!((energy.monthly_kwh - 1.5).abs() < 1e-9);
    hub.shutdown().await;
}

#[tokio::test]
async fn solar_surplus_sets_current() {
    let mock = station(10_000);
    let mocks = HashMap::from([("wb".to_string(), mock.clone())]);
    let hub = start(&config(&["wb"], true), &mocks);
    wait_availability(&hub, "wb", AvailabilityState::Available).await;

    hub.publish_surplus("wb", 2760.0).unwrap();
    tokio::time::timeout(WAIT, async {
        while mock.register(2106) != 12 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("setpoint never written");

    hub.set_solar_enabled("wb", false).unwrap();
    hub.publish_surplus("wb", 6900.0).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.register(2106), 12);
    hub.shutdown().await;
}

#[tokio::test]
async fn reconnect_command_rebuilds_session() {
    let mock = station(10_000);
    let mocks = HashMap::from([("wb".to_string(), mock.clone())]);
    let hub = start(&config(&["wb"], false), &mocks);
    let first = wait_for(&hub, "wb", |_| true).await;

    hub.command("wb", WallboxCommand::Reconnect).await.unwrap();
    let later = wait_for(&hub, "wb", |s| s.connection_epoch > first.connection_epoch).await;
    assert!(!later.stale);
    hub.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_prompt_during_backoff() {
    let mock = station(10_000);
    mock.set_persistent_failure(Some(HeliosError::timeout("gone")));
    let mut cfg = config(&["wb"], false);
    cfg.retry = RetryConfig {
        max_attempts: 10,
        base_delay_ms: 60_000,
        max_delay_ms: 60_000,
    };
    let mocks = HashMap::from([("wb".to_string(), mock)]);
    let hub = start(&cfg, &mocks);
    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::time::timeout(Duration::from_secs(2), hub.shutdown())
        .await
        .expect("shutdown blocked on backoff");
}
