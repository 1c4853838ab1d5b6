use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff for upload retries. A task whose attempt
/// counter reaches `max_attempts` is given up on rather than retried forever.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
            jitter: true,
        }
    }

    /// Deterministic delays, for tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let cap_ms = self.max_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        // Shift is capped so the multiplier cannot overflow.
        let exp = base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(cap_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}
