//! Single or dual connector detection
//!
//! Connector A is always present. Whether connector B exists is decided by
//! reading its status block once per connection: a station without it
//! either rejects the address or answers with an empty placeholder.

use crate::error::DeviceException;
use crate::logging::StructuredLogger;
use crate::modbus::ModbusConnectionManager;
use crate::registers::{Block, Connector, EvState, status};
use serde::Serialize;

/// Number of connectors the station exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectorTopology {
    Single,
    Dual,
}

impl ConnectorTopology {
    pub fn connectors(self) -> &'static [Connector] {
        match self {
            ConnectorTopology::Single => &[Connector::A],
            ConnectorTopology::Dual => &Connector::ALL,
        }
    }
}

/// EV-state words a missing connector reports
const ABSENT_SENTINELS: [u16; 2] = [0, 0xFFFF];

/// Interpret the EV-state word of the connector B status block
///
/// A faulted connector (state 90) is still present and counts as `Dual`.
pub fn classify_probe(ev_state_word: u16) -> ConnectorTopology {
    if ABSENT_SENTINELS.contains(&ev_state_word) {
        return ConnectorTopology::Single;
    }
    match EvState::from_raw(ev_state_word) {
        EvState::Unknown(_) => ConnectorTopology::Single,
        _ => ConnectorTopology::Dual,
    }
}

/// Probe connector B through the retrying manager
///
/// Retries happen inside the manager, so a timeout seen here already means
/// the attempt budget is spent. Any failure falls back to `Single`.
pub async fn detect(
    manager: &ModbusConnectionManager,
    logger: &StructuredLogger,
) -> ConnectorTopology {
    let base = Block::ConnectorState.base(Some(Connector::B));
    match manager.read_block(base, Block::ConnectorState.len()).await {
        Ok(words) => {
            let word = words
                .get(usize::from(status::EV_STATE))
                .copied()
                .unwrap_or(0);
            let topology = classify_probe(word);
            logger.info(&format!(
                "Connector B probe returned EV state {}; topology {:?}",
                word, topology
            ));
            topology
        }
        Err(err) => match err.exception() {
            Some(DeviceException::IllegalDataAddress | DeviceException::IllegalFunction) => {
                logger.info("Connector B registers not implemented; single connector station");
                ConnectorTopology::Single
            }
            _ => {
                logger.warn(&format!(
                    "Connector B probe failed ({}); assuming single connector",
                    err
                ));
                ConnectorTopology::Single
            }
        },
    }
}
