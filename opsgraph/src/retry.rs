//! Retry policy for transient provider errors.

use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff: the delay doubles per attempt, is capped at
/// `max_delay`, and carries jitter so that parallel branches hitting the
/// same throttled provider do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The delay to sleep after `attempt` (1-based) has failed. Uniform
    /// jitter over the upper half of the backoff window.
    pub fn delay(&self, attempt: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(20));
        let capped = doubled.min(self.max_delay);
        let half = capped / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        // Jitter keeps each delay within [window/2, window].
        for (attempt, window_ms) in [(1u32, 100u64), (2, 200), (3, 400), (4, 800), (5, 1000), (12, 1000)] {
            let d = policy.delay(attempt);
            let window = Duration::from_millis(window_ms);
            assert!(d >= window / 2, "attempt {}: {:?} too short", attempt, d);
            assert!(d <= window, "attempt {}: {:?} too long", attempt, d);
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert!(policy.delay(u32::MAX) <= policy.max_delay);
    }
}
