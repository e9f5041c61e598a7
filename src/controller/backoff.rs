//! Per-pod exponential failure back-off for the controller's error policy.
//!
//! kube-runtime's `error_policy` only sees the failing object, so the failure
//! count per object key is tracked here and cleared on the next success.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Back-off bounds for failed reconciliations.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2,
        }
    }
}

/// Tracks consecutive failures per object key.
#[derive(Debug, Default)]
pub struct FailureBackoff {
    config: BackoffConfig,
    failures: Mutex<HashMap<String, u32>>,
}

impl FailureBackoff {
    /// Create a tracker with custom bounds
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn next_delay(&self, key: &str) -> Duration {
        let attempt = match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key.to_string()).or_insert(0);
                *count = count.saturating_add(1);
                *count
            }
            // A poisoned map only loses history; fall back to the first step.
            Err(_) => 1,
        };
        self.delay_for(attempt)
    }

    /// Forget the failures of `key` after a successful reconcile.
    pub fn reset(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .config
            .backoff_multiplier
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.config
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }
}
