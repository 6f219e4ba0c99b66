//! Health verdicts from consecutive probe outcomes.

use stackseq_common::types::HealthState;
use stackseq_compose::model::HealthCheck;

use crate::backend::ProbeOutcome;

/// Tracks consecutive probe failures for one instance.
///
/// A pass (re)establishes `healthy` and resets the counter. `unhealthy`
/// is reported once consecutive failures reach the retry count; until
/// then the previous verdict stands.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    retries: u32,
    failures: u32,
    state: HealthState,
}

impl HealthTracker {
    /// Creates a tracker in `starting`. A retry count of 0 behaves as 1.
    #[must_use]
    pub fn new(check: &HealthCheck) -> Self {
        Self {
            retries: check.retries.max(1),
            failures: 0,
            state: HealthState::Starting,
        }
    }

    /// Current verdict.
    #[must_use]
    pub const fn state(&self) -> HealthState {
        self.state
    }

    /// Consecutive failures so far.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Folds in one probe outcome. Returns the new verdict if it changed.
    pub fn record(&mut self, outcome: &ProbeOutcome) -> Option<HealthState> {
        let next = match outcome {
            ProbeOutcome::Passed => {
                self.failures = 0;
                HealthState::Healthy
            }
            ProbeOutcome::Failed(_) => {
                self.failures = self.failures.saturating_add(1);
                if self.failures >= self.retries {
                    HealthState::Unhealthy
                } else {
                    self.state
                }
            }
        };
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }
}
