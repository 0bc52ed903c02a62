use super::types::{AvailabilityState, DeviceSnapshot, LinkState};
use crate::error::{HeliosError, Result};
use crate::registers::{Block, Connector, DecodedBlock};
use crate::topology::{self, ConnectorTopology};
use chrono::Utc;
use std::sync::Arc;

impl super::WallboxDriver {
    /// Run one poll cycle
    ///
    /// Reconnects and re-detects the topology first when the link is down.
    /// Returns the published snapshot, or the error that failed the cycle.
    pub async fn poll_once(&mut self) -> Result<Arc<DeviceSnapshot>> {
        if self.link == LinkState::Disconnected
            && let Err(err) = self.establish().await
        {
            self.set_link(LinkState::Disconnected);
            self.on_cycle_failure(&err).await;
            return Err(err);
        }

        let started = std::time::Instant::now();
        match self.read_cycle().await {
            Ok(snapshot) => {
                let snapshot = self.publish(snapshot);
                self.on_cycle_success(started.elapsed());
                Ok(snapshot)
            }
            Err(err) => {
                self.on_cycle_failure(&err).await;
                Err(err)
            }
        }
    }

    async fn establish(&mut self) -> Result<()> {
        self.set_link(LinkState::Connecting);
        self.manager.connect().await?;
        let topology = topology::detect(&self.manager, &self.logger).await;
        self.topology = Some(topology);
        self.logger.info(&format!(
            "Connected (epoch {}), {:?} connector station",
            self.manager.connection_epoch(),
            topology
        ));
        self.set_link(LinkState::Polling);
        Ok(())
    }

    async fn read_block(&self, block: Block, connector: Option<Connector>) -> Result<DecodedBlock> {
        let words = self
            .manager
            .read_block(block.base(connector), block.len())
            .await?;
        let decoded = self.map.decode_block(block, &words);
        for (offset, value) in decoded.anomalies() {
            self.logger.debug(&format!(
                "Unexpected value at {:?}+{} ({}): {:?}",
                block,
                offset,
                connector.map(|c| c.to_string()).unwrap_or_default(),
                value
            ));
        }
        Ok(decoded)
    }

    /// Read every block; nothing is committed unless all reads succeed
    async fn read_cycle(&mut self) -> Result<DeviceSnapshot> {
        let topology = self.topology.unwrap_or(ConnectorTopology::Single);

        let mut connectors = Vec::with_capacity(topology.connectors().len());
        for &connector in topology.connectors() {
            let state = self.read_block(Block::ConnectorState, Some(connector)).await?;
            let meter = self.read_block(Block::Wattmeter, Some(connector)).await?;
            connectors.push((connector, state, meter));
        }
        let global = self.read_block(Block::GlobalConfig, None).await?;

        Ok(self.assemble(Utc::now(), topology, &connectors, &global))
    }

    fn on_cycle_success(&mut self, elapsed: std::time::Duration) {
        if self.consecutive_failures > 0 {
            self.logger.info(&format!(
                "Device reachable again after {} failed cycle(s)",
                self.consecutive_failures
            ));
        }
        self.consecutive_failures = 0;
        self.throttle.reset();
        self.set_link(LinkState::Polling);
        if self.set_availability(AvailabilityState::Available) {
            self.logger.info("Device available");
        }
        self.logger
            .trace(&format!("Poll cycle completed in {:?}", elapsed));
    }

    async fn on_cycle_failure(&mut self, err: &HeliosError) {
        if self.cancel.is_cancelled() || matches!(err, HeliosError::Cancelled) {
            return;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.throttle.record() {
            self.logger.warn(&format!(
                "Poll cycle failed ({} in a row): {}",
                self.consecutive_failures, err
            ));
        } else {
            self.logger.debug(&format!("Poll cycle failed: {}", err));
        }

        if self.consecutive_failures < self.device.failure_threshold {
            if self.link != LinkState::Disconnected {
                self.set_link(LinkState::Degraded);
            }
            return;
        }

        if self.link != LinkState::Disconnected {
            self.manager.disconnect().await;
            self.topology = None;
            self.set_link(LinkState::Disconnected);
        }
        if self.set_availability(AvailabilityState::Unavailable) {
            self.logger.warn(&format!(
                "Device unavailable after {} consecutive failed cycles",
                self.consecutive_failures
            ));
            self.republish_stale();
        }
    }

    pub(super) fn publish(&mut self, mut snapshot: DeviceSnapshot) -> Arc<DeviceSnapshot> {
        self.sequence += 1;
        snapshot.sequence = self.sequence;
        let snapshot = Arc::new(snapshot);
        self.snapshot_tx.send_replace(Some(Arc::clone(&snapshot)));
        snapshot
    }

    /// Keep the last values visible but flag them as stale
    fn republish_stale(&mut self) {
        let last = self.snapshot_tx.borrow().clone();
        if let Some(last) = last {
            let mut stale = (*last).clone();
            stale.stale = true;
            stale.timestamp = Utc::now();
            self.publish(stale);
        }
    }
}
