//! Retry policy: capped exponential backoff with jitter

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Maximum transport attempts per delivery record
    pub ceiling: u32,
    /// Fraction of the delay added as random jitter (0.0 disables)
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, ceiling: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            ceiling,
            jitter: 0.1,
        }
    }

    pub fn normal() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(60_000), 5)
    }

    /// Shorter backoff and more attempts for level-2 decisions
    pub fn urgent() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_millis(5_000), 8)
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// `min(base × 2^attempts, max)` before jitter
    pub fn base_delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Base delay plus jitter, never above `max_delay`
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let delay = self.base_delay_for(attempts);
        if self.jitter.is_nan() || self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        (delay + delay.mul_f64(extra)).min(self.max_delay)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.ceiling
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(*self)
    }
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

/// Stateful sleeper over a `RetryPolicy`, for loops that retry in place
#[derive(Debug)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current_attempt: 0,
        }
    }

    /// Resume from a persisted attempt count.
    ///
    /// The next `sleep` waits `delay_for(attempts)`, so after the k-th failed
    /// attempt of a record the wait is `base × 2^(k-1)` whether or not the
    /// process restarted in between.
    pub fn starting_at(mut self, attempts: u32) -> Self {
        self.current_attempt = attempts;
        self
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.policy.exhausted(self.current_attempt) {
            return Err(MaxRetriesExceeded);
        }

        let delay = self.policy.delay_for(self.current_attempt);

        log::debug!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.policy.ceiling,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
