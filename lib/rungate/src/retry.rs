//! Bounded exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

/// Retry schedule shared by lock acquisition and gateway reloads.
///
/// Delay for attempt `n` (0-based) is `min(base * 2^n, max_delay)`; with
/// jitter enabled a uniformly random delay in `[delay/2, delay]` is used.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
            jitter: true,
        }
    }

    /// A fixed delay between attempts, without growth or jitter.
    pub fn fixed(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base: delay,
            max_delay: delay,
            max_attempts,
            jitter: false,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        let delay = self
            .base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let millis = delay.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
        Duration::from_millis(jittered)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(1), Some(5))
    }
}
