use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Exponential reconnect delay with a ceiling and random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, without jitter applied.
    pub fn base_delay(&self) -> Duration {
        let factor = self.config.multiplier.max(1.0).powi(self.attempt.min(64) as i32);
        let millis = self.config.initial.as_millis() as f64 * factor;
        let capped = millis.min(self.config.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let scale = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);
        base.mul_f64(scale)
    }
}
