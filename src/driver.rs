//! Polling coordinator for one wallbox
//!
//! The driver owns the poll loop: it connects, detects the connector
//! topology, reads every block each cycle and publishes one immutable
//! snapshot per successful cycle. Availability only flips after a run of
//! consecutive failed cycles, so a single dropped packet never reaches
//! consumers as an outage.

mod commands;
pub mod energy;
mod runtime_poll;
mod snapshot;
mod types;

pub use commands::{DriverHandle, SnapshotStream, WallboxCommand};
pub use energy::{CounterPeriods, EnergyCounters, EnergyTracker};
pub use types::{
    AvailabilityState, ConnectorSnapshot, DeviceSnapshot, DriverCommand, LinkState, PhaseReading,
    StationSnapshot,
};

use crate::config::DeviceConfig;
use crate::logging::{ErrorThrottle, LogContext, StructuredLogger, get_logger_with_context};
use crate::modbus::ModbusConnectionManager;
use crate::registers::{Connector, RegisterMap};
use crate::topology::ConnectorTopology;
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Poll loop state for one device
pub struct WallboxDriver {
    device: DeviceConfig,
    device_id: String,
    map: Arc<RegisterMap>,
    manager: Arc<ModbusConnectionManager>,
    tz: Tz,

    link: LinkState,
    /// Cached until the next full reconnect
    topology: Option<ConnectorTopology>,
    consecutive_failures: u32,
    throttle: ErrorThrottle,
    sequence: u64,
    energy: BTreeMap<Connector, EnergyTracker>,

    snapshot_tx: watch::Sender<Option<Arc<DeviceSnapshot>>>,
    availability_tx: watch::Sender<AvailabilityState>,
    link_tx: watch::Sender<LinkState>,
    commands_rx: mpsc::UnboundedReceiver<DriverCommand>,
    cancel: CancellationToken,
    logger: StructuredLogger,
}

impl WallboxDriver {
    /// Build the driver and the handle consumers talk to
    pub fn new(
        device: DeviceConfig,
        tz: Tz,
        map: Arc<RegisterMap>,
        manager: Arc<ModbusConnectionManager>,
        cancel: CancellationToken,
    ) -> (Self, DriverHandle) {
        let device_id = device.unique_id();
        let logger =
            get_logger_with_context(LogContext::new("driver").with_device(&device_id));

        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (availability_tx, availability_rx) = watch::channel(AvailabilityState::Unavailable);
        let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let handle = DriverHandle::new(
            device_id.clone(),
            device.read_only,
            Arc::clone(&map),
            Arc::clone(&manager),
            snapshot_rx,
            availability_rx,
            link_rx,
            commands_tx,
        );

        let driver = Self {
            device,
            device_id,
            map,
            manager,
            tz,
            link: LinkState::Disconnected,
            topology: None,
            consecutive_failures: 0,
            throttle: ErrorThrottle::default(),
            sequence: 0,
            energy: BTreeMap::new(),
            snapshot_tx,
            availability_tx,
            link_tx,
            commands_rx,
            cancel,
            logger,
        };
        (driver, handle)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn topology(&self) -> Option<ConnectorTopology> {
        self.topology
    }

    /// Run until cancelled
    pub async fn run(mut self) {
        self.logger.info(&format!(
            "Starting poll loop for {}:{} unit {} every {:?}",
            self.device.host,
            self.device.port,
            self.device.slave_id,
            self.device.poll_interval()
        ));

        let mut ticker = interval(self.device.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.poll_once().await;
                }
                Some(cmd) = self.commands_rx.recv() => self.handle_command(cmd).await,
            }
        }

        self.manager.disconnect().await;
        self.set_link(LinkState::Disconnected);
        self.logger.info("Poll loop stopped");
    }

    fn set_link(&mut self, link: LinkState) {
        if self.link != link {
            self.logger
                .debug(&format!("Link state {:?} -> {:?}", self.link, link));
            self.link = link;
            self.link_tx.send_replace(link);
        }
    }

    fn set_availability(&self, availability: AvailabilityState) -> bool {
        self.availability_tx.send_if_modified(|current| {
            if *current == availability {
                false
            } else {
                *current = availability;
                true
            }
        })
    }
}
