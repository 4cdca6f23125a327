//! Exponential backoff for re-queued step invocations: the full base delay
//! plus up to 100% random jitter on top, so a delay never drops below its
//! base.
//!
//! The engine never sleeps itself; the scheduler asks for a delay and
//! re-dispatches the failed step after it elapses.

use std::time::Duration;

use plumber_types::config::{BackoffConfig, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_ATTEMPTS};
use rand::Rng;

// ---------------------------------------------------------------------------
// BackoffPolicy
// ---------------------------------------------------------------------------

/// Delay calculator for retries.
///
/// `delay(n)` lies in `[base, 2 * base)` where
/// `base = initial_delay_ms * 2^(n - 1)`. There is no upper cap; the attempt
/// limit is enforced by [`BackoffPolicy::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            initial_delay_ms,
            max_attempts,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial_delay_ms, config.max_attempts)
    }

    /// Un-jittered delay for a 1-based attempt. Attempt 0 is treated as 1.
    ///
    /// Saturates at `u64::MAX` instead of overflowing.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.max(1) - 1;
        2u64.checked_pow(exponent)
            .and_then(|factor| factor.checked_mul(self.initial_delay_ms))
            .unwrap_or(u64::MAX)
    }

    /// Jittered delay in milliseconds using the supplied RNG.
    pub fn delay_ms_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let base = self.base_delay_ms(attempt);
        if base == 0 {
            return 0;
        }
        base.saturating_add(rng.gen_range(0..base))
    }

    /// Jittered delay in milliseconds using the thread-local RNG.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.delay_ms_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.initial_delay_ms, 3000);
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn test_base_delay_doubles() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay_ms(1), 3000);
        assert_eq!(policy.base_delay_ms(2), 6000);
        assert_eq!(policy.base_delay_ms(3), 12000);
        assert_eq!(policy.base_delay_ms(0), 3000);
    }

    #[test]
    fn test_delay_bounds() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=10 {
            let lower = 3000 * 2u64.pow(attempt - 1);
            let upper = 3000 * 2u64.pow(attempt);
            for _ in 0..200 {
                let delay = policy.delay_ms_with_rng(attempt, &mut rng);
                assert!(delay >= lower, "attempt {attempt}: {delay} < {lower}");
                assert!(delay < upper, "attempt {attempt}: {delay} >= {upper}");
            }
        }
    }

    #[test]
    fn test_delay_duration_matches_bounds() {
        let policy = BackoffPolicy::new(100, 5);
        let delay = policy.delay(2);
        assert!(delay >= Duration::from_millis(200));
        assert!(delay < Duration::from_millis(400));
    }

    #[test]
    fn test_large_attempt_saturates() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay_ms(64), u64::MAX);
        assert_eq!(policy.base_delay_ms(u32::MAX), u64::MAX);
        assert_eq!(policy.delay_ms(200), u64::MAX);
    }

    #[test]
    fn test_zero_initial_delay() {
        let policy = BackoffPolicy::new(0, 3);
        assert_eq!(policy.delay_ms(4), 0);
    }

    #[test]
    fn test_should_retry() {
        let policy = BackoffPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_from_config() {
        let config = BackoffConfig {
            initial_delay_ms: 500,
            max_attempts: 7,
        };
        assert_eq!(BackoffPolicy::from_config(&config), BackoffPolicy::new(500, 7));
    }
}
