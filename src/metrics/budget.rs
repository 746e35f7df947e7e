//! Resource budget enforcement for a supervisor session.

use std::time::{Duration, Instant};

/// Resource limits for a session. Zero on a dimension means "no limit".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    pub max_tokens: u64,
    pub max_duration: Duration,
    pub max_iterations: u32,
    /// Fraction of a limit at which warnings begin. 0 falls back to 0.8.
    pub warn_threshold: f64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_tokens: 1_000_000,
            max_duration: Duration::from_secs(8 * 60 * 60),
            max_iterations: 100,
            warn_threshold: 0.8,
        }
    }
}

/// Consumption state at the time of a check.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BudgetStatus {
    pub tokens_used: u64,
    pub tokens_max: u64,
    pub duration_used: Duration,
    pub duration_max: Duration,
    pub iterations_used: u32,
    pub iterations_max: u32,
    pub warning: bool,
    pub exceeded: bool,
    pub reason: String,
}

/// Tracks consumption against a budget. The duration clock starts at
/// construction.
#[derive(Debug)]
pub struct BudgetEnforcer {
    budget: Budget,
    start: Instant,
}

impl BudgetEnforcer {
    pub fn new(mut budget: Budget) -> Self {
        if budget.warn_threshold == 0.0 {
            budget.warn_threshold = 0.8;
        }
        Self {
            budget,
            start: Instant::now(),
        }
    }

    /// Evaluate current consumption. Limits are checked in order: tokens,
    /// duration, iterations; the first exceeded limit is reported. When
    /// nothing is exceeded, a warning is raised if any configured limit's
    /// ratio is at or past the threshold.
    pub fn check(&self, tokens_used: u64, iterations_used: u32) -> BudgetStatus {
        let elapsed = self.start.elapsed();

        let mut status = BudgetStatus {
            tokens_used,
            tokens_max: self.budget.max_tokens,
            duration_used: elapsed,
            duration_max: self.budget.max_duration,
            iterations_used,
            iterations_max: self.budget.max_iterations,
            ..BudgetStatus::default()
        };

        if self.budget.max_tokens > 0 && tokens_used >= self.budget.max_tokens {
            status.exceeded = true;
            status.reason = format!(
                "token budget exceeded: {tokens_used}/{}",
                self.budget.max_tokens
            );
            return status;
        }
        if !self.budget.max_duration.is_zero() && elapsed >= self.budget.max_duration {
            status.exceeded = true;
            status.reason = format!(
                "duration budget exceeded: {}s/{}s",
                elapsed.as_secs(),
                self.budget.max_duration.as_secs()
            );
            return status;
        }
        if self.budget.max_iterations > 0 && iterations_used >= self.budget.max_iterations {
            status.exceeded = true;
            status.reason = format!(
                "iteration budget exceeded: {iterations_used}/{}",
                self.budget.max_iterations
            );
            return status;
        }

        let threshold = self.budget.warn_threshold;
        if self.budget.max_tokens > 0
            && tokens_used as f64 >= self.budget.max_tokens as f64 * threshold
        {
            status.warning = true;
            status.reason = format!(
                "approaching token limit: {tokens_used}/{} ({:.0}%)",
                self.budget.max_tokens,
                tokens_used as f64 / self.budget.max_tokens as f64 * 100.0
            );
        }
        if !self.budget.max_duration.is_zero()
            && elapsed.as_secs_f64() >= self.budget.max_duration.as_secs_f64() * threshold
        {
            status.warning = true;
            status.reason = format!(
                "approaching duration limit: {}s/{}s",
                elapsed.as_secs(),
                self.budget.max_duration.as_secs()
            );
        }
        if self.budget.max_iterations > 0
            && iterations_used as f64 >= self.budget.max_iterations as f64 * threshold
        {
            status.warning = true;
            status.reason = format!(
                "approaching iteration limit: {iterations_used}/{}",
                self.budget.max_iterations
            );
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(max_tokens: u64, max_iterations: u32) -> Budget {
        Budget {
            max_tokens,
            max_duration: Duration::ZERO,
            max_iterations,
            warn_threshold: 0.8,
        }
    }

    #[test]
    fn under_budget_is_clean() {
        let enforcer = BudgetEnforcer::new(budget(1000, 100));
        let status = enforcer.check(100, 5);
        assert!(!status.exceeded);
        assert!(!status.warning);
        assert!(status.reason.is_empty());
    }

    #[test]
    fn tokens_exceed_first() {
        let enforcer = BudgetEnforcer::new(budget(1000, 10));
        let status = enforcer.check(1000, 10);
        assert!(status.exceeded);
        assert!(status.reason.contains("token budget exceeded"));
    }

    #[test]
    fn iterations_exceed_when_tokens_fine() {
        let enforcer = BudgetEnforcer::new(budget(1000, 10));
        let status = enforcer.check(1, 10);
        assert!(status.exceeded);
        assert!(status.reason.contains("iteration budget exceeded"));
    }

    #[test]
    fn warning_at_threshold() {
        let enforcer = BudgetEnforcer::new(budget(1000, 100));
        let status = enforcer.check(800, 5);
        assert!(!status.exceeded);
        assert!(status.warning);
        assert!(status.reason.contains("approaching token limit"));
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let enforcer = BudgetEnforcer::new(budget(0, 0));
        let status = enforcer.check(u64::MAX, u32::MAX);
        assert!(!status.exceeded);
        assert!(!status.warning);
    }

    #[test]
    fn exceeded_is_monotonic_in_usage() {
        let enforcer = BudgetEnforcer::new(budget(1000, 0));
        assert!(enforcer.check(1000, 0).exceeded);
        assert!(enforcer.check(5000, 0).exceeded);
    }

    #[test]
    fn zero_warn_threshold_defaults() {
        let enforcer = BudgetEnforcer::new(Budget {
            warn_threshold: 0.0,
            ..budget(1000, 0)
        });
        let status = enforcer.check(799, 0);
        assert!(!status.warning);
        let status = enforcer.check(800, 0);
        assert!(status.warning);
    }
}
