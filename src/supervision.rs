//! Restart backoff for entity instances.

use std::time::Duration;

use rand::Rng;

/// Jittered, bounded exponential backoff applied when an entity instance
/// fails and restarts from its durable state.
///
/// The `n`th restart (zero-based) waits
/// `min(max_backoff, min_backoff * 2^n) * (1 + r)` with `r` drawn uniformly
/// from `[0, random_factor]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    /// Delay before the first restart.
    pub min_backoff: Duration,
    /// Upper bound of the un-jittered delay.
    pub max_backoff: Duration,
    /// Fraction of the delay added as random jitter.
    pub random_factor: f64,
    /// Consecutive failed restarts after which the instance gives up and
    /// stops. It is spawned again on the next command.
    pub max_restarts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            random_factor: 0.1,
            max_restarts: 10,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.min(31));
        let base = self
            .min_backoff
            .saturating_mul(exp)
            .min(self.max_backoff);
        let factor = self.random_factor.max(0.0);
        if factor == 0.0 {
            return base;
        }
        base.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..=factor))
    }
}
