//! Exponential backoff between failed accepts.

use std::time::Duration;

/// Delay policy for consecutive accept failures.
///
/// The first failure waits `base`, each further one doubles it, capped
/// at `max`. A `max` of zero disables waiting entirely.
#[derive(Debug, Clone)]
pub struct AcceptBackoff {
    base_ms: u64,
    max_ms: u64,
    failures: u32,
}

impl AcceptBackoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let exponential_base = 2u64.saturating_pow(self.failures);
        self.failures = self.failures.saturating_add(1);

        let delay_ms = self.base_ms.saturating_mul(exponential_base);
        Duration::from_millis(delay_ms.min(self.max_ms))
    }

    /// Forget earlier failures after a successful accept.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
