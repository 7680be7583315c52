//! Pure processing-policy decisions.
//!
//! Given a message's retry count and last-updated time, decides whether the
//! consumer may attempt delivery. Exhaustion is checked before staleness so
//! a message that is both reports as exhausted.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Outcome of evaluating a message against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessDecision {
    /// The message may be delivered.
    Process,
    /// The message sat in `processing` past the stale threshold.
    Stale,
    /// The retry budget is spent.
    Exhausted,
}

/// Processing policy configuration.
///
/// A pure decision function: `evaluate` depends only on its arguments and
/// this configuration, which keeps the retry/stale logic testable in
/// isolation from every collaborator.
#[derive(Debug, Clone)]
pub struct ProcessingPolicy {
    max_retries: u32,
    stale_after: Duration,
}

impl ProcessingPolicy {
    /// Creates a policy from a retry budget and stale threshold.
    pub fn new(max_retries: u32, stale_after: Duration) -> Self {
        Self { max_retries, stale_after }
    }

    /// The configured retry budget.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The configured stale threshold.
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Decides whether a message may be processed.
    pub fn evaluate(
        &self,
        retry_count: u32,
        updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ProcessDecision {
        if retry_count >= self.max_retries {
            return ProcessDecision::Exhausted;
        }

        if now.signed_duration_since(updated_at) > self.stale_delta() {
            return ProcessDecision::Stale;
        }

        ProcessDecision::Process
    }

    /// Whether a `processing` record last touched at `updated_at` is stale.
    pub fn is_stale(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(updated_at) > self.stale_delta()
    }

    /// The cutoff below which `updated_at` values count as stale.
    pub fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.stale_delta()
    }

    fn stale_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.stale_after).unwrap_or(TimeDelta::MAX)
    }
}
