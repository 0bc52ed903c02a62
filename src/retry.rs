//! Bounded retry with exponential backoff
//!
//! The policy is pure: it only answers "what next" for a failed attempt. The
//! connection manager owns the loop, the sleeping, and the reconnects.

use crate::config::RetryConfig;
use crate::error::HeliosError;
use std::time::Duration;

/// How a failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Device asked us to come back later, or the reply was garbled
    Transient,
    /// TCP session is suspect; drop it before the next attempt
    Reconnect,
    /// Retrying cannot help
    Fatal,
}

/// Outcome of consulting the policy after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    ReconnectThenRetry(Duration),
    FailFast,
}

/// Classify an error for retry purposes
pub fn classify(error: &HeliosError) -> FailureClass {
    match error {
        HeliosError::Connection { .. } | HeliosError::Timeout { .. } => FailureClass::Reconnect,
        HeliosError::Malformed { .. } => FailureClass::Transient,
        HeliosError::Protocol { .. } => match error.exception() {
            Some(exception) if exception.is_transient() => FailureClass::Transient,
            _ => FailureClass::Fatal,
        },
        _ => FailureClass::Fatal,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.max_delay())
    }

    /// Never retries; useful for probes that must not block
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Decide what to do after `attempt` (1-based) failed with `error`
    pub fn decide(&self, attempt: u32, error: &HeliosError) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::FailFast;
        }
        match classify(error) {
            FailureClass::Fatal => RetryDecision::FailFast,
            FailureClass::Transient => RetryDecision::RetryAfter(self.backoff(attempt)),
            FailureClass::Reconnect => RetryDecision::ReconnectThenRetry(self.backoff(attempt)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(250))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(250));
        assert_eq!(p.backoff(40), Duration::from_millis(250));
    }

    #[test]
    fn classification() {
        assert_eq!(
            classify(&HeliosError::timeout("t")),
            FailureClass::Reconnect
        );
        assert_eq!(
            classify(&HeliosError::connection("reset")),
            FailureClass::Reconnect
        );
        assert_eq!(
            classify(&HeliosError::protocol(6, "busy")),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&HeliosError::protocol(5, "ack")),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&HeliosError::protocol(2, "illegal address")),
            FailureClass::Fatal
        );
        assert_eq!(
            classify(&HeliosError::read_only("no")),
            FailureClass::Fatal
        );
        assert_eq!(classify(&HeliosError::Cancelled), FailureClass::Fatal);
    }

    #[test]
    fn decide_respects_attempt_budget() {
        let p = policy();
        let timeout = HeliosError::timeout("t");
        assert_eq!(
            p.decide(1, &timeout),
            RetryDecision::ReconnectThenRetry(Duration::from_millis(100))
        );
        assert_eq!(
            p.decide(2, &HeliosError::protocol(6, "busy")),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(p.decide(3, &timeout), RetryDecision::FailFast);
        assert_eq!(
            p.decide(1, &HeliosError::protocol(3, "illegal value")),
            RetryDecision::FailFast
        );
    }

    #[test]
    fn zero_attempts_clamped_to_one() {
        let p = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(p.max_attempts(), 1);
        assert_eq!(
            p.decide(1, &HeliosError::timeout("t")),
            RetryDecision::FailFast
        );
    }
}
