use super::ModbusTransport;
use crate::error::{HeliosError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::retry::{RetryDecision, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One wire operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Only make sure the session is open
    Connect,
    Read { address: u16, count: u16 },
    WriteSingle { address: u16, value: u16 },
    WriteBlock { address: u16, values: Vec<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Words(Vec<u16>),
    Done,
}

/// Connection bookkeeping exposed for status reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Failed attempts since start
    pub connection_errors: u64,
    /// Failed attempts since the last success
    pub consecutive_errors: u32,
    /// Successful connects since start; doubles as the connection epoch
    pub connects: u64,
    pub last_connect_attempt: Option<DateTime<Utc>>,
    pub last_successful_connection: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Serialized, retrying access to one device
///
/// The transport sits behind a FIFO-fair `tokio::sync::Mutex`: concurrent
/// callers are served in arrival order and one request/response pair
/// completes before the next begins. The lock is held per attempt, not
/// across backoff sleeps, so other tasks can use the link while one waits.
pub struct ModbusConnectionManager {
    transport: Mutex<Box<dyn ModbusTransport>>,
    unit: u8,
    policy: RetryPolicy,
    cancel: CancellationToken,
    stats: std::sync::Mutex<ConnectionStats>,
    logger: StructuredLogger,
}

impl ModbusConnectionManager {
    pub fn new(
        transport: Box<dyn ModbusTransport>,
        unit: u8,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport: Mutex::new(transport),
            unit,
            policy,
            cancel,
            stats: std::sync::Mutex::new(ConnectionStats::default()),
            logger: get_logger_with_context(LogContext::new("modbus_manager")),
        }
    }

    /// Attach the device id to log lines
    pub fn with_device(mut self, device_id: &str) -> Self {
        self.logger = get_logger_with_context(LogContext::new("modbus_manager").with_device(device_id));
        self
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute a request with retries; aborts promptly on cancellation
    pub async fn execute(&self, request: Request) -> Result<Response> {
        if self.cancel.is_cancelled() {
            return Err(HeliosError::Cancelled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(HeliosError::Cancelled),
            result = self.execute_with_retry(&request) => result,
        }
    }

    async fn execute_with_retry(&self, request: &Request) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(request).await {
                Ok(response) => {
                    self.record_success();
                    return Ok(response);
                }
                Err(err) => {
                    self.record_failure(&err);
                    match self.policy.decide(attempt, &err) {
                        RetryDecision::FailFast => {
                            self.logger.debug(&format!(
                                "{:?} failed after {} attempt(s): {}",
                                request, attempt, err
                            ));
                            return Err(err);
                        }
                        RetryDecision::RetryAfter(delay) => {
                            self.logger.debug(&format!(
                                "Attempt {} failed ({}); retrying in {:?}",
                                attempt, err, delay
                            ));
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::ReconnectThenRetry(delay) => {
                            self.logger.debug(&format!(
                                "Attempt {} failed ({}); reconnecting in {:?}",
                                attempt, err, delay
                            ));
                            self.transport.lock().await.disconnect().await;
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }

    async fn attempt(&self, request: &Request) -> Result<Response> {
        let mut transport = self.transport.lock().await;

        if !transport.is_connected() {
            self.record_connect_attempt();
            transport.connect().await?;
            self.record_connected();
        }

        match request {
            Request::Connect => Ok(Response::Done),
            Request::Read { address, count } => transport
                .read_holding_registers(self.unit, *address, *count)
                .await
                .map(Response::Words),
            Request::WriteSingle { address, value } => transport
                .write_single_register(self.unit, *address, *value)
                .await
                .map(|()| Response::Done),
            Request::WriteBlock { address, values } => transport
                .write_multiple_registers(self.unit, *address, values)
                .await
                .map(|()| Response::Done),
        }
    }

    /// Open the session, retrying per policy
    pub async fn connect(&self) -> Result<()> {
        self.execute(Request::Connect).await.map(|_| ())
    }

    /// Drop the session
    pub async fn disconnect(&self) {
        self.transport.lock().await.disconnect().await;
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_connected()
    }

    /// Read `count` holding registers starting at `address`
    pub async fn read_block(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        match self.execute(Request::Read { address, count }).await? {
            Response::Words(words) => Ok(words),
            Response::Done => Err(HeliosError::malformed("Read returned no data")),
        }
    }

    pub async fn write_single(&self, address: u16, value: u16) -> Result<()> {
        self.execute(Request::WriteSingle { address, value })
            .await
            .map(|_| ())
    }

    pub async fn write_block(&self, address: u16, values: Vec<u16>) -> Result<()> {
        self.execute(Request::WriteBlock { address, values })
            .await
            .map(|_| ())
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Successful connects so far; changes whenever the session is rebuilt
    pub fn connection_epoch(&self) -> u64 {
        self.stats.lock().map(|s| s.connects).unwrap_or_default()
    }

    fn record_connect_attempt(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.last_connect_attempt = Some(Utc::now());
        }
    }

    fn record_connected(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.connects += 1;
            stats.last_successful_connection = Some(Utc::now());
        }
    }

    fn record_success(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.consecutive_errors = 0;
        }
    }

    fn record_failure(&self, err: &HeliosError) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.connection_errors += 1;
            stats.consecutive_errors = stats.consecutive_errors.saturating_add(1);
            stats.last_error = Some(err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::mock::{MockEvent, MockTransport};
    use std::sync::Arc;
    use std::time::Duration;

    fn manager(mock: &MockTransport, attempts: u32) -> ModbusConnectionManager {
        ModbusConnectionManager::new(
            Box::new(mock.clone()),
            1,
            RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(4)),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn transient_failures_then_success_uses_k_attempts() {
        let mock = MockTransport::new().with_registers(2104, &[4]);
        for _ in 0..3 {
            mock.push_failure(HeliosError::protocol(6, "ServerDeviceBusy"));
        }
        let m = manager(&mock, 4);
        let words = m.read_block(2104, 1).await.unwrap();
        assert_eq!(words, vec![4]);
        assert_eq!(mock.read_count(), 4);
        assert_eq!(m.stats().consecutive_errors, 0);
    }

    #[tokio::test]
    async fn device_exception_is_single_attempt() {
        let mock = MockTransport::new();
        mock.push_failure(HeliosError::protocol(2, "IllegalDataAddress"));
        let m = manager(&mock, 5);
        let err = m.read_block(2004, 9).await.unwrap_err();
        assert_eq!(
            err.exception(),
            Some(crate::error::DeviceException::IllegalDataAddress)
        );
        assert_eq!(mock.read_count(), 1);
    }

    #[tokio::test]
    async fn timeouts_reconnect_between_attempts() {
        let mock = MockTransport::new();
        mock.push_failure(HeliosError::timeout("slow"));
        mock.push_failure(HeliosError::timeout("slow"));
        let m = manager(&mock, 3);
        m.write_single(2106, 16).await.unwrap();
        assert_eq!(mock.write_count(), 3);
        assert_eq!(mock.connect_count(), 3);
        assert_eq!(m.connection_epoch(), 3);
        assert_eq!(mock.register(2106), 16);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let mock = MockTransport::new();
        mock.set_persistent_failure(Some(HeliosError::timeout("gone")));
        let m = manager(&mock, 3);
        let err = m.read_block(2100, 9).await.unwrap_err();
        assert!(matches!(err, HeliosError::Timeout { .. }));
        assert_eq!(mock.read_count(), 3);
        assert_eq!(m.stats().consecutive_errors, 3);
    }

    #[tokio::test]
    async fn refused_connect_counts_as_attempt() {
        let mock = MockTransport::new();
        mock.set_refuse_connect(true);
        let m = manager(&mock, 2);
        assert!(m.connect().await.unwrap_err().is_connection_error());
        assert_eq!(mock.read_count(), 0);
        assert!(m.stats().last_connect_attempt.is_some());
        assert!(m.stats().last_successful_connection.is_none());
    }

    #[tokio::test]
    async fn concurrent_requests_never_interleave() {
        let mock = MockTransport::new().with_delay(Duration::from_millis(10));
        let m = Arc::new(manager(&mock, 1));
        m.connect().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..4u16 {
            let reader = Arc::clone(&m);
            tasks.push(tokio::spawn(async move { reader.read_block(2100, 9).await.map(|_| ()) }));
            let writer = Arc::clone(&m);
            tasks.push(tokio::spawn(async move { writer.write_single(2106, 6 + i).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let ops: Vec<MockEvent> = mock
            .events()
            .into_iter()
            .filter(|e| matches!(e, MockEvent::Start(_) | MockEvent::End(_)))
            .collect();
        assert_eq!(ops.len(), 16);
        for pair in ops.chunks(2) {
            match (&pair[0], &pair[1]) {
                (MockEvent::Start(a), MockEvent::End(b)) => assert_eq!(a, b),
                other => panic!("interleaved requests: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_backoff() {
        let mock = MockTransport::new();
        mock.set_persistent_failure(Some(HeliosError::timeout("gone")));
        let cancel = CancellationToken::new();
        let m = ModbusConnectionManager::new(
            Box::new(mock.clone()),
            1,
            RetryPolicy::new(10, Duration::from_secs(30), Duration::from_secs(30)),
            cancel.clone(),
        );
        let handle = tokio::spawn(async move { m.read_block(2100, 9).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(HeliosError::Cancelled)));
        assert_eq!(mock.read_count(), 1);
    }
}
