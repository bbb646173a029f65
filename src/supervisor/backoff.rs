use std::time::Duration;

use crate::config::BackoffConfig;

/// Reconnect delays: `initial * multiplier^n`, capped at `max`.
///
/// Consecutive delays never decrease until [`Backoff::reset`].
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial_ms: config.initial_ms,
            max_ms: config.max_ms.max(config.initial_ms),
            multiplier: config.multiplier.max(1.0),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let raw = self.initial_ms as f64 * self.multiplier.powi(self.attempt as i32);
        let ms = raw.min(self.max_ms as f64) as u64;
        if ms < self.max_ms {
            self.attempt += 1;
        }
        Duration::from_millis(ms)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
