//! Log suppression for background loops that fail repeatedly.

use tracing::{info, warn};

/// Tracks consecutive failures of a repeating operation (broker polling,
/// sweeps) and tells the caller when a failure is still worth logging.
#[derive(Debug)]
pub struct FailureTracker {
    operation: &'static str,
    consecutive_failures: u32,
    max_logged_failures: u32,
}

impl FailureTracker {
    pub fn new(operation: &'static str, max_logged_failures: u32) -> Self {
        Self {
            operation,
            consecutive_failures: 0,
            max_logged_failures,
        }
    }

    /// Record a failure. Returns `true` while the failure should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures == self.max_logged_failures + 1 {
            warn!(
                "{}: suppressing further failure logs after {} consecutive failures",
                self.operation, self.max_logged_failures
            );
        }
        self.consecutive_failures <= self.max_logged_failures
    }

    /// Record a success, logging recovery if failures had been suppressed.
    pub fn record_success(&mut self) {
        if self.consecutive_failures > self.max_logged_failures {
            info!(
                "{}: recovered after {} consecutive failures",
                self.operation, self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}
