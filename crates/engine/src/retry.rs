use std::time::Duration;

use courier_common::config::AppConfig;

/// Exponential backoff with uniform jitter.
///
/// The delay before retry `n` (1-based, counting failed attempts) is
/// `min(base * 2^(n-1), max) + U(0, jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_ms),
            Duration::from_millis(config.retry_max_ms),
            Duration::from_millis(config.retry_jitter_ms),
        )
    }

    /// Backoff without jitter for the given failed attempt.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base = (self.base.as_millis() as u64).max(1);
        let max = (self.max.as_millis() as u64).max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(factor).min(max))
    }

    /// Backoff including a random jitter component.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.jitter_delay()
    }

    fn jitter_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(fastrand::u64(0..=jitter_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(200),
            Duration::from_secs(10),
            Duration::from_millis(100),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            Duration::ZERO,
        );
        assert_eq!(policy.base_delay(10), Duration::from_millis(500));
        // Huge attempt numbers must not overflow.
        assert_eq!(policy.base_delay(200), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_millis(50),
        );
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_zero_base_is_clamped() {
        let policy = RetryPolicy::new(Duration::ZERO, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.base_delay(1), Duration::from_millis(1));
    }
}
