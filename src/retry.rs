use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::TaskDefinition;

/// Computes the wait before retry number `attempt` (1 for the first retry).
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32, base: Duration) -> Duration;
}

/// Waits `base` before every retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConstantBackoff;

impl BackoffPolicy for ConstantBackoff {
    fn delay(&self, _attempt: u32, base: Duration) -> Duration {
        base
    }
}

/// `base * multiplier^(attempt - 1)`, capped at `max_interval`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExponentialBackoff {
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl ExponentialBackoff {
    pub fn new(multiplier: f64, max_interval: Duration) -> Self {
        let mut policy = Self {
            multiplier,
            max_interval,
        };

        // 修正非法取值
        if policy.multiplier.is_nan() || policy.multiplier <= 0.0 {
            policy.multiplier = 2.0;
        }
        if policy.max_interval.is_zero() {
            policy.max_interval = Duration::from_secs(30);
        }
        if policy.max_interval > Duration::from_secs(150) {
            policy.max_interval = Duration::from_secs(150);
        }

        policy
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32, base: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff = base.as_secs_f64() * self.multiplier.powi(exponent);

        if !backoff.is_finite() || backoff >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }

        Duration::from_secs_f64(backoff)
    }
}

/// Retry decisions for the scheduler.
///
/// Attempts are numbered from 0; attempt 0 is the first execution and is not
/// a retry.
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: Arc<dyn BackoffPolicy>,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::constant()
    }
}

impl RetryManager {
    pub fn new(policy: Arc<dyn BackoffPolicy>) -> Self {
        Self { policy }
    }

    pub fn constant() -> Self {
        Self::new(Arc::new(ConstantBackoff))
    }

    pub fn exponential(multiplier: f64, max_interval: Duration) -> Self {
        Self::new(Arc::new(ExponentialBackoff::new(multiplier, max_interval)))
    }

    /// `attempt` is the number of the attempt that would run next.
    pub fn should_retry(&self, attempt: u32, max_retries: u32) -> bool {
        attempt <= max_retries
    }

    pub fn backoff_delay(&self, attempt: u32, base: Duration) -> Duration {
        self.policy.delay(attempt, base)
    }

    /// Backoff for a task, honouring its own policy override if it has one.
    pub fn backoff_for(&self, task: &TaskDefinition, attempt: u32) -> Duration {
        match task.backoff() {
            Some(policy) => policy.delay(attempt, task.retry_delay()),
            None => self.backoff_delay(attempt, task.retry_delay()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_allowed_up_to_max() {
        let manager = RetryManager::default();
        assert!(manager.should_retry(1, 2));
        assert!(manager.should_retry(2, 2));
        assert!(!manager.should_retry(3, 2));
        assert!(!manager.should_retry(1, 0));
    }

    #[test]
    fn constant_policy_returns_base() {
        let manager = RetryManager::constant();
        let base = Duration::from_millis(250);
        for attempt in 1..5 {
            assert_eq!(manager.backoff_delay(attempt, base), base);
        }
    }

    #[test]
    fn exponential_policy_grows_monotonically_and_caps() {
        let manager = RetryManager::exponential(2.0, Duration::from_secs(10));
        let base = Duration::from_secs(1);

        assert_eq!(manager.backoff_delay(1, base), Duration::from_secs(1));
        assert_eq!(manager.backoff_delay(2, base), Duration::from_secs(2));
        assert_eq!(manager.backoff_delay(3, base), Duration::from_secs(4));
        assert_eq!(manager.backoff_delay(5, base), Duration::from_secs(10));
        assert_eq!(manager.backoff_delay(400, base), Duration::from_secs(10));

        let delays: Vec<_> = (1..20).map(|a| manager.backoff_delay(a, base)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn exponential_policy_normalises_bad_settings() {
        let policy = ExponentialBackoff::new(-1.0, Duration::ZERO);
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_interval, Duration::from_secs(30));

        assert_eq!(ExponentialBackoff::new(f64::NAN, Duration::from_secs(5)).multiplier, 2.0);

        let capped = ExponentialBackoff::new(3.0, Duration::from_secs(600));
        assert_eq!(capped.max_interval, Duration::from_secs(150));
    }

    #[test]
    fn task_override_wins_over_manager_policy() {
        let task = crate::TaskDefinition::noop("load")
            .with_retries(3, Duration::from_secs(1))
            .with_backoff(Arc::new(ExponentialBackoff::new(3.0, Duration::from_secs(60))));
        let manager = RetryManager::constant();

        assert_eq!(manager.backoff_for(&task, 3), Duration::from_secs(9));
        let plain = crate::TaskDefinition::noop("end").with_retries(3, Duration::from_secs(1));
        assert_eq!(manager.backoff_for(&plain, 3), Duration::from_secs(1));
    }
}
