//! Per-object exponential requeue delays for failed reconciliations

use std::{collections::HashMap, sync::Mutex, time::Duration};

#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(5 * 60))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure of `key` and returns how long to wait before retrying it.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let attempt = failures.entry(key.to_string()).or_insert(0);
        let delay = self
            .initial
            .checked_mul(2u32.saturating_pow(*attempt))
            .map_or(self.max, |delay| delay.min(self.max));
        *attempt = attempt.saturating_add(1);
        delay
    }

    /// Forgets all failures of `key`, after it was reconciled successfully.
    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }
}
