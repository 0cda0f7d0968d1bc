//! Retry policy for background tasks, exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::WorkerConfig;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total deliveries allowed, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub add_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
            ..Default::default()
        }
    }

    /// Whether a task that just failed its `attempt`-th retry (0-based) may run again.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter {
            // Up to 25% on top.
            let jitter = (backoff_ms as f64 * 0.25 * rand::thread_rng().gen_range(0.0..1.0)) as u64;
            duration += Duration::from_millis(jitter);
        }

        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy();
        assert_eq!(p.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(p.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(p.backoff_duration(3), Duration::from_millis(800));
        assert_eq!(p.backoff_duration(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let p = RetryPolicy {
            add_jitter: true,
            ..policy()
        };
        for _ in 0..50 {
            let d = p.backoff_duration(1);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_attempt_budget() {
        let p = policy();
        assert!(p.allows_retry(0));
        assert!(p.allows_retry(1));
        assert!(!p.allows_retry(2));
    }
}
