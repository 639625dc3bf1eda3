//! Retry scheduling.
//!
//! Everything here is a pure function of the attempt count; the only
//! input that is not is the jitter source, which callers may supply.

use rand::Rng;
use std::time::Duration;
use tidesync_protocol::Timestamp;

/// Exponent cap. Past it the delay is pinned to `max_delay` anyway and
/// the shift would overflow.
const MAX_EXPONENT: u32 = 31;

/// Exponential backoff with additive jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound of the un-jittered delay.
    pub max_delay: Duration,
    /// Jitter as a fraction of the delay, in `[0, 1]`.
    pub jitter_factor: f64,
    /// Failures after which an entry is given up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Creates the default policy: 1 s base, 60 s cap, 10% jitter, no ceiling.
    pub fn new() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
            max_attempts: None,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the jitter factor, clamped to `[0, 1]`.
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = if factor.is_nan() {
            0.0
        } else {
            factor.clamp(0.0, 1.0)
        };
        self
    }

    /// Sets the attempt ceiling.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Un-jittered delay after `attempt` earlier failures.
    ///
    /// `min(max_delay, base_delay * 2^attempt)`, non-decreasing in `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_EXPONENT);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay with jitter drawn from `rng`, in `[backoff, backoff * (1 + jitter))`.
    pub fn jittered<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let unit: f64 = rng.gen();
        delay.saturating_add(delay.mul_f64(self.jitter_factor * unit))
    }

    /// Delay with jitter from the thread-local generator.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.jittered(attempt, &mut rand::thread_rng())
    }

    /// Wall-clock time of the next attempt.
    pub fn next_retry_at(&self, now: Timestamp, attempt: u32) -> Timestamp {
        now.saturating_add(self.delay(attempt))
    }

    /// Returns true once `failures` reaches the ceiling.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_progression() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(5), Duration::from_secs(32));
        assert_eq!(policy.backoff(6), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn no_jitter_is_exact() {
        let policy = RetryPolicy::default().with_jitter_factor(0.0);
        assert_eq!(policy.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn ceiling() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(1_000));

        let policy = policy.with_max_attempts(3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }

    #[test]
    fn jitter_factor_is_clamped() {
        assert_eq!(RetryPolicy::default().with_jitter_factor(-1.0).jitter_factor, 0.0);
        assert_eq!(RetryPolicy::default().with_jitter_factor(7.0).jitter_factor, 1.0);
        assert_eq!(RetryPolicy::default().with_jitter_factor(f64::NAN).jitter_factor, 0.0);
    }

    #[test]
    fn next_retry_at_is_in_the_future() {
        let policy = RetryPolicy::default();
        let now = Timestamp::from_millis(10_000);
        let at = policy.next_retry_at(now, 0);
        assert!(at >= Timestamp::from_millis(11_000));
        assert!(at < Timestamp::from_millis(11_100));
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_bounded(
            base_ms in 1u64..5_000,
            max_ms in 1u64..600_000,
            attempts in 0u32..80,
        ) {
            let policy = RetryPolicy::default()
                .with_base_delay(Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(max_ms));
            let mut previous = Duration::ZERO;
            for attempt in 0..=attempts {
                let delay = policy.backoff(attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }

        #[test]
        fn jitter_is_additive(seed in any::<u64>(), attempt in 0u32..40, factor in 0.0f64..1.0) {
            let policy = RetryPolicy::default().with_jitter_factor(factor);
            let mut rng = StdRng::seed_from_u64(seed);
            let base = policy.backoff(attempt);
            let delay = policy.jittered(attempt, &mut rng);
            prop_assert!(delay >= base);
            prop_assert!(delay <= base.mul_f64(1.0 + factor) + Duration::from_micros(1));
        }
    }
}
