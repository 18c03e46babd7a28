//! Retry and failure policies for a session.

use std::time::Duration;

use flowgrid_core::{FailurePolicy, SchedulerSettings};
use serde::{Deserialize, Serialize};

/// What to do after a launch rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionDecision {
    /// Return to pending; do not place again before `not_before` (epoch ms).
    Retry { not_before: u64 },
    /// The attempt budget is spent.
    GiveUp,
}

/// Policies applied by a session to its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPolicy {
    pub max_launch_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub failure: FailurePolicy,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for SessionPolicy {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            max_launch_attempts: settings.max_launch_attempts,
            backoff_base: settings.backoff_base,
            backoff_max: settings.backoff_max,
            failure: settings.failure_policy,
        }
    }
}

impl SessionPolicy {
    pub fn with_failure(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }

    /// Delay after the `attempt`-th rejection: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1u32 << exp).min(self.backoff_max)
    }

    /// Decide what follows the `attempts`-th consecutive rejection at `now`.
    pub fn on_rejection(&self, attempts: u32, now: u64) -> RejectionDecision {
        if attempts >= self.max_launch_attempts {
            RejectionDecision::GiveUp
        } else {
            let delay = self.backoff(attempts).as_millis() as u64;
            RejectionDecision::Retry {
                not_before: now.saturating_add(delay),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SessionPolicy {
        SessionPolicy {
            max_launch_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(300),
            failure: FailurePolicy::AbortSession,
        }
    }

    #[test]
    fn retries_until_budget_spent() {
        let p = policy();
        assert_eq!(p.on_rejection(1, 1_000), RejectionDecision::Retry { not_before: 1_100 });
        assert_eq!(p.on_rejection(2, 1_000), RejectionDecision::Retry { not_before: 1_200 });
        assert_eq!(p.on_rejection(3, 1_000), RejectionDecision::GiveUp);
    }

    #[test]
    fn backoff_is_capped() {
        let p = policy();
        assert_eq!(p.backoff(3), Duration::from_millis(300));
        assert_eq!(p.backoff(10), Duration::from_millis(300));
    }

    #[test]
    fn default_follows_scheduler_settings() {
        let p = SessionPolicy::default();
        assert_eq!(p.max_launch_attempts, 3);
        assert_eq!(p.failure, FailurePolicy::AbortSession);
    }
}
