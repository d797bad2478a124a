//! Retry backoff policy.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Computes backoff delays for machine-transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Total attempts per point, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// The delay before retrying after the given failed attempt
    /// (0-indexed): exponential growth, capped, jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_ms as f64 * self.config.multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_ms as f64);
        let jittered = if self.config.jitter > 0.0 {
            let jitter = self.config.jitter.min(1.0);
            let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
            capped * factor
        } else {
            capped
        };
        Duration::from_millis(jittered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter,
            max_attempts: 4,
        })
    }

    #[test]
    fn grows_exponentially_until_capped() {
        let p = policy(0.0);
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(400));
        // 100 * 2^5 = 3200, capped at 1000.
        assert_eq!(p.delay(5), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let p = policy(0.5);
        for attempt in 0..4 {
            let base = (100u64 * 2u64.pow(attempt)).min(1_000) as f64;
            let d = p.delay(attempt).as_millis() as f64;
            assert!(d >= base * 0.5 - 1.0 && d <= base * 1.5 + 1.0, "{d} vs {base}");
        }
    }

    #[test]
    fn at_least_one_attempt() {
        let p = RetryPolicy::new(RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        });
        assert_eq!(p.max_attempts(), 1);
    }
}
