// src/policy.rs

//! Fork rotation and shutdown policies.
//!
//! Both policies are plain values fixed for the lifetime of one supervisor
//! run. Zero is the "unlimited" sentinel for the fork budgets; prefer the
//! helper accessors over checking for zero at call sites.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::types::ExitReason;

/// Parameters governing when an executor rotates to a fresh fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ForkPolicy {
    /// Time budget per fork (`0` = unlimited).
    pub max_seconds_per_fork: Duration,
    /// Job budget per fork (`0` = unlimited).
    pub max_jobs_per_fork: u64,
    /// Delay between `after_fork` and the first claim attempt.
    pub start_lag: Duration,
}

impl ForkPolicy {
    #[inline]
    pub fn time_limit(&self) -> Option<Duration> {
        if self.max_seconds_per_fork.is_zero() {
            None
        } else {
            Some(self.max_seconds_per_fork)
        }
    }

    #[inline]
    pub fn job_limit(&self) -> Option<u64> {
        if self.max_jobs_per_fork == 0 {
            None
        } else {
            Some(self.max_jobs_per_fork)
        }
    }
}

/// Parameters governing how shutdown triggers reach a live executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownPolicy {
    /// Signal a stuck executor instead of killing it outright.
    pub term_child: bool,
    /// Treat `SIGTERM` as a drain of the in-flight job (needs `term_child`).
    pub graceful_term: bool,
    /// How long to wait for a voluntary exit before escalating.
    pub term_timeout: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            term_child: false,
            graceful_term: false,
            term_timeout: Duration::from_secs(4),
        }
    }
}

/// Per-fork budget tracker evaluated by the executor between jobs.
///
/// The time budget is measured from the completion of the fork's first
/// job: a fork always gets to finish one job before its clock starts.
#[derive(Debug, Clone)]
pub struct ForkBudget {
    policy: ForkPolicy,
    armed_at: Option<Instant>,
}

impl ForkBudget {
    pub fn new(policy: ForkPolicy) -> Self {
        Self {
            policy,
            armed_at: None,
        }
    }

    /// Record a finished job. Arms the fork clock on the first one.
    pub fn job_finished(&mut self, now: Instant) {
        if self.armed_at.is_none() {
            self.armed_at = Some(now);
        }
    }

    /// Whether the fork should end, checked in order: time, then job count.
    pub fn exhausted(&self, processed: u64, now: Instant) -> Option<ExitReason> {
        if let (Some(limit), Some(armed)) = (self.policy.time_limit(), self.armed_at) {
            if now.saturating_duration_since(armed) >= limit {
                return Some(ExitReason::TimeLimit);
            }
        }
        if let Some(limit) = self.policy.job_limit() {
            if processed >= limit {
                return Some(ExitReason::JobLimit);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(secs: u64, jobs: u64) -> ForkPolicy {
        ForkPolicy {
            max_seconds_per_fork: Duration::from_secs(secs),
            max_jobs_per_fork: jobs,
            start_lag: Duration::ZERO,
        }
    }

    #[test]
    fn zero_means_unlimited() {
        let p = policy(0, 0);
        assert_eq!(p.time_limit(), None);
        assert_eq!(p.job_limit(), None);

        let mut budget = ForkBudget::new(p);
        let start = Instant::now();
        budget.job_finished(start);
        assert_eq!(
            budget.exhausted(1_000_000, start + Duration::from_secs(3600)),
            None
        );
    }

    #[test]
    fn job_limit_is_inclusive() {
        let budget = ForkBudget::new(policy(0, 20));
        let now = Instant::now();
        assert_eq!(budget.exhausted(19, now), None);
        assert_eq!(budget.exhausted(20, now), Some(ExitReason::JobLimit));
    }

    #[test]
    fn time_budget_starts_after_first_job() {
        let mut budget = ForkBudget::new(policy(3, 0));
        let t0 = Instant::now();

        // Not armed yet: a long first job never trips the time budget.
        assert_eq!(budget.exhausted(0, t0 + Duration::from_secs(10)), None);

        // 2s jobs: first finishes at t=2, arming the clock.
        budget.job_finished(t0 + Duration::from_secs(2));
        assert_eq!(budget.exhausted(1, t0 + Duration::from_secs(2)), None);
        budget.job_finished(t0 + Duration::from_secs(4));
        assert_eq!(budget.exhausted(2, t0 + Duration::from_secs(4)), None);
        budget.job_finished(t0 + Duration::from_secs(6));
        assert_eq!(
            budget.exhausted(3, t0 + Duration::from_secs(6)),
            Some(ExitReason::TimeLimit)
        );
    }

    #[test]
    fn time_checked_before_jobs() {
        let mut budget = ForkBudget::new(policy(1, 2));
        let t0 = Instant::now();
        budget.job_finished(t0);
        assert_eq!(
            budget.exhausted(2, t0 + Duration::from_secs(5)),
            Some(ExitReason::TimeLimit)
        );
    }
}
