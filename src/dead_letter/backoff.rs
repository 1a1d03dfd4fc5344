//! Retry delay strategies

use std::fmt::Debug;
use std::time::Duration;

/// Decides how long to wait before the next retry
pub trait Backoff: Send + Sync + Debug {
    /// Delay after the `attempt`-th failed retry (1-based)
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Same delay after every failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Doubling delay starting at `base`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}
