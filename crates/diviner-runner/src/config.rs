//! Runner configuration.

use serde::{Deserialize, Serialize};

/// Tunables for the runner loop. Defaults are sensible for interactive
/// studies; long-running fleets usually raise the retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub retry: RetryConfig,
    /// Upper bound on points requested from the oracle in one
    /// consultation, so a wide parameter space does not flood it.
    pub oracle_batch: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            oracle_batch: 16,
        }
    }
}

/// Exponential backoff with jitter, bounded attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_ms: u64,
    /// Ceiling on any single delay, in milliseconds.
    pub max_ms: u64,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions (0 disables).
    pub jitter: f64,
    /// Total attempts per point, including the first.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 1.5,
            jitter: 0.2,
            max_attempts: 3,
        }
    }
}
