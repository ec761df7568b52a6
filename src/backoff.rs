use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with jitter, used between group rejoins and
/// between fetch retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            attempt: 0,
        }
    }

    /// Delay without jitter for the given attempt.
    fn base_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay_ms = delay.min(self.max.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Returns the next delay and advances the attempt counter. The jitter
    /// draws uniformly from the upper half of the base delay.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let base_ms = base.as_millis() as u64;
        if base_ms < 2 {
            return base;
        }
        let jittered = rand::thread_rng().gen_range(base_ms / 2..=base_ms);
        Duration::from_millis(jittered)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(30))
    }
}
