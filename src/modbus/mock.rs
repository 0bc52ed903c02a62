//! In-memory transport used by unit and integration tests
//!
//! The mock keeps a flat register image addressed by absolute register
//! number, so writes are visible to subsequent reads. Failures can be
//! queued (consumed one per request), made persistent, or bound to the start
//! address of a read. Every request is recorded as a start/end event pair so
//! tests can check that requests never overlap.

use super::ModbusTransport;
use crate::error::{HeliosError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One recorded transport event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Connect,
    Disconnect,
    Start(MockOp),
    End(MockOp),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Read { address: u16, count: u16 },
    Write { address: u16, values: Vec<u16> },
}

#[derive(Debug, Default)]
struct MockState {
    registers: HashMap<u16, u16>,
    connected: bool,
    refuse_connect: bool,
    queued_failures: VecDeque<HeliosError>,
    persistent_failure: Option<HeliosError>,
    address_failures: HashMap<u16, HeliosError>,
    delay: Duration,
    events: Vec<MockEvent>,
    reads: u32,
    writes: u32,
    connects: u32,
}

/// Cloneable handle; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // Poisoning only happens if a test already panicked
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Seed consecutive registers starting at `address`
    pub fn with_registers(self, address: u16, words: &[u16]) -> Self {
        self.set_registers(address, words);
        self
    }

    pub fn set_registers(&self, address: u16, words: &[u16]) {
        let mut state = self.state();
        for (i, word) in words.iter().enumerate() {
            state.registers.insert(address + i as u16, *word);
        }
    }

    pub fn register(&self, address: u16) -> u16 {
        self.state().registers.get(&address).copied().unwrap_or(0)
    }

    /// Sleep this long inside every request
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state().delay = delay;
        self
    }

    /// Fail the next request with `err`
    pub fn push_failure(&self, err: HeliosError) {
        self.state().queued_failures.push_back(err);
    }

    /// Fail every request until cleared
    pub fn set_persistent_failure(&self, err: Option<HeliosError>) {
        self.state().persistent_failure = err;
    }

    /// Fail every read that starts at `address`
    pub fn fail_reads_at(&self, address: u16, err: HeliosError) {
        self.state().address_failures.insert(address, err);
    }

    pub fn set_refuse_connect(&self, refuse: bool) {
        self.state().refuse_connect = refuse;
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state().events.clone()
    }

    pub fn read_count(&self) -> u32 {
        self.state().reads
    }

    pub fn write_count(&self) -> u32 {
        self.state().writes
    }

    pub fn connect_count(&self) -> u32 {
        self.state().connects
    }

    /// Writes as (address, words) in the order they reached the mock
    pub fn writes(&self) -> Vec<(u16, Vec<u16>)> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::End(MockOp::Write { address, values }) => {
                    Some((*address, values.clone()))
                }
                _ => None,
            })
            .collect()
    }

    async fn run(&self, op: MockOp) -> Result<Vec<u16>> {
        let delay = {
            let mut state = self.state();
            if !state.connected {
                return Err(HeliosError::connection("Not connected to Modbus server"));
            }
            match &op {
                MockOp::Read { .. } => state.reads += 1,
                MockOp::Write { .. } => state.writes += 1,
            }
            state.events.push(MockEvent::Start(op.clone()));
            state.delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.events.push(MockEvent::End(op.clone()));

        let failure = state
            .queued_failures
            .pop_front()
            .or_else(|| state.persistent_failure.clone())
            .or_else(|| match &op {
                MockOp::Read { address, .. } => state.address_failures.get(address).cloned(),
                MockOp::Write { .. } => None,
            });
        if let Some(err) = failure {
            if err.is_connection_error() {
                state.connected = false;
            }
            return Err(err);
        }

        match op {
            MockOp::Read { address, count } => Ok((0..count)
                .map(|i| {
                    state
                        .registers
                        .get(&(address + i))
                        .copied()
                        .unwrap_or(0)
                })
                .collect()),
            MockOp::Write { address, values } => {
                for (i, word) in values.iter().enumerate() {
                    state.registers.insert(address + i as u16, *word);
                }
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait::async_trait]
impl ModbusTransport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state();
        if state.connected {
            return Ok(());
        }
        state.events.push(MockEvent::Connect);
        if state.refuse_connect {
            return Err(HeliosError::connection("Connection refused"));
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut state = self.state();
        if state.connected {
            state.connected = false;
            state.events.push(MockEvent::Disconnect);
        }
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn read_holding_registers(
        &mut self,
        _unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.run(MockOp::Read { address, count }).await
    }

    async fn write_single_register(&mut self, _unit: u8, address: u16, value: u16) -> Result<()> {
        self.run(MockOp::Write {
            address,
            values: vec![value],
        })
        .await
        .map(|_| ())
    }

    async fn write_multiple_registers(
        &mut self,
        _unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()> {
        self.run(MockOp::Write {
            address,
            values: values.to_vec(),
        })
        .await
        .map(|_| ())
    }
}
