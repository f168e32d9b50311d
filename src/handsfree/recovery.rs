//! Error bookkeeping and the retry policy

use crate::config::RecoveryConfig;
use crate::error::{ErrorClass, HandsfreeError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// The most recent failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub error: String,
    pub code: &'static str,
    pub class: ErrorClass,
    pub timestamp: DateTime<Utc>,
    /// Retry attempt this failure belongs to (0 = first try)
    pub attempt: u32,
    #[serde(skip)]
    pub source: HandsfreeError,
}

/// What to do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Tear down, wait, and reinitialise
    Retry { attempt: u32, delay: Duration },
    /// Stop in the error state and tell the observer
    Surface,
}

/// Counts retries for one run of hands-free capture
#[derive(Debug)]
pub struct RetryState {
    max_retries: u32,
    backoff: Duration,
    attempts: u32,
    unknown_seen: u32,
}

impl RetryState {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            attempts: 0,
            unknown_seen: 0,
        }
    }

    /// Retries spent since the last stable period
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Classify `error`, record it, and decide whether to retry
    pub fn decide(&mut self, error: HandsfreeError) -> (ErrorRecord, RecoveryDecision) {
        let class = error.classify(self.unknown_seen);
        if matches!(error, HandsfreeError::UnknownPlatform(_)) {
            self.unknown_seen += 1;
        }

        let record = ErrorRecord {
            error: error.to_string(),
            code: error.code(),
            class,
            timestamp: Utc::now(),
            attempt: self.attempts,
            source: error,
        };

        let decision = if class == ErrorClass::Transient && self.attempts < self.max_retries {
            self.attempts += 1;
            RecoveryDecision::Retry {
                attempt: self.attempts,
                delay: self.backoff,
            }
        } else {
            RecoveryDecision::Surface
        };

        (record, decision)
    }

    /// Capture has been healthy; future failures start a fresh retry budget
    pub fn mark_stable(&mut self) {
        if self.attempts > 0 {
            tracing::debug!("Capture stable again after {} retries", self.attempts);
        }
        self.attempts = 0;
    }

    /// Forget everything, including unknown platform errors seen
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.unknown_seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(max_retries: u32) -> RetryState {
        RetryState::new(&RecoveryConfig {
            max_retries,
            retry_backoff_ms: 50,
            ..RecoveryConfig::default()
        })
    }

    #[test]
    fn test_transient_retries_until_exhausted() {
        let mut retry = state(2);
        let busy = || HandsfreeError::DeviceBusy("held".into());

        let (record, decision) = retry.decide(busy());
        assert_eq!(record.attempt, 0);
        assert_eq!(
            decision,
            RecoveryDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(50)
            }
        );
        assert!(matches!(retry.decide(busy()).1, RecoveryDecision::Retry { attempt: 2, .. }));

        let (record, decision) = retry.decide(busy());
        assert_eq!(decision, RecoveryDecision::Surface);
        assert_eq!(record.attempt, 2);
        assert_eq!(record.class, ErrorClass::Transient);
    }

    #[test]
    fn test_terminal_surfaces_immediately() {
        let mut retry = state(3);
        let (record, decision) = retry.decide(HandsfreeError::PermissionDenied);
        assert_eq!(decision, RecoveryDecision::Surface);
        assert_eq!(record.class, ErrorClass::Terminal);
        assert_eq!(record.code, "permission_denied");
        assert_eq!(retry.attempts(), 0);
    }

    #[test]
    fn test_unknown_platform_retried_once() {
        let mut retry = state(3);
        let unknown = || HandsfreeError::UnknownPlatform("odd".into());
        assert!(matches!(retry.decide(unknown()).1, RecoveryDecision::Retry { .. }));
        assert_eq!(retry.decide(unknown()).1, RecoveryDecision::Surface);

        // Stability restores the retry budget but not the unknown allowance
        retry.mark_stable();
        assert_eq!(retry.decide(unknown()).1, RecoveryDecision::Surface);

        retry.reset();
        assert!(matches!(retry.decide(unknown()).1, RecoveryDecision::Retry { .. }));
    }

    #[test]
    fn test_zero_retries_surfaces_transient() {
        let mut retry = state(0);
        assert_eq!(
            retry.decide(HandsfreeError::ResourceFailure("ctx".into())).1,
            RecoveryDecision::Surface
        );
    }
}
