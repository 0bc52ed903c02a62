use std::collections::BTreeMap;
use tracing::{debug, error, info, trace, warn};

/// Context information for log messages
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component name (e.g., "driver", "modbus", "solar")
    pub component: String,
    /// Device unique id for multi-wallbox setups
    pub device: Option<String>,
    /// Additional context fields
    pub extra_fields: BTreeMap<String, String>,
}

impl LogContext {
    /// Create a new log context
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            device: None,
            extra_fields: BTreeMap::new(),
        }
    }

    /// Set device id
    pub fn with_device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    /// Add extra field
    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

/// Structured logger with context
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    pub(crate) context: LogContext,
}

impl StructuredLogger {
    /// Create a new structured logger with context
    pub fn new(context: LogContext) -> Self {
        Self { context }
    }

    /// Log an info message with context
    pub fn info(&self, message: &str) {
        let fields = self.format_fields();
        info!(%fields, "{}", message);
    }
    /// Log a warning message with context
    pub fn warn(&self, message: &str) {
        let fields = self.format_fields();
        warn!(%fields, "{}", message);
    }
    /// Log an error message with context
    pub fn error(&self, message: &str) {
        let fields = self.format_fields();
        error!(%fields, "{}", message);
    }
    /// Log a debug message with context
    pub fn debug(&self, message: &str) {
        let fields = self.format_fields();
        debug!(%fields, "{}", message);
    }
    /// Log a trace message with context
    pub fn trace(&self, message: &str) {
        let fields = self.format_fields();
        trace!(%fields, "{}", message);
    }

    /// Format context fields for logging
    fn format_fields(&self) -> String {
        let mut fields = vec![format!("component={}", self.context.component)];
        if let Some(ref device) = self.context.device {
            fields.push(format!("device={}", device));
        }
        for (key, value) in &self.context.extra_fields {
            fields.push(format!("{}={}", key, value));
        }
        fields.join(",")
    }
}

/// Create a logger for a specific component
pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}
/// Create a logger with full context
pub fn get_logger_with_context(context: LogContext) -> StructuredLogger {
    StructuredLogger::new(context)
}

/// Rate limiter for repeated failure messages
///
/// The first failure of a streak and every `every`-th one after it are
/// reported loudly; the rest go to debug.
#[derive(Debug, Clone)]
pub struct ErrorThrottle {
    every: u32,
    count: u32,
}

impl ErrorThrottle {
    pub const DEFAULT_EVERY: u32 = 10;

    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            count: 0,
        }
    }

    /// Record one failure; true when it should be logged at warn level
    pub fn record(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.count == 1 || self.count % self.every == 0
    }

    /// Failures recorded since the last reset
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

impl Default for ErrorThrottle {
    fn default() -> Self {
        Self::new(Self::DEFAULT_EVERY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_context() {
        let context = LogContext::new("test")
            .with_device("wb_502_1")
            .with_field("key", "value".to_string());

        assert_eq!(context.component, "test");
        assert_eq!(context.device.as_deref(), Some("wb_502_1"));
        assert_eq!(context.extra_fields.get("key"), Some(&"value".to_string()));

        let logger = get_logger_with_context(context);
        assert_eq!(
            logger.format_fields(),
            "component=test,device=wb_502_1,key=value"
        );
    }

    #[test]
    fn throttle_reports_first_and_every_tenth() {
        let mut throttle = ErrorThrottle::default();
        let loud: Vec<u32> = (1..=25).filter(|_| throttle.record()).collect::<Vec<_>>();
        assert_eq!(loud.len(), 3);
        assert_eq!(throttle.count(), 25);
        throttle.reset();
        assert!(throttle.record());
    }
}
