//! Exponential retry delay with a consecutive-failure counter.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Backoff state owned by a single watch loop.
///
/// The first delay after construction or [`reset`](CountedBackoff::reset) is
/// zero; after that it starts at `initial_interval` and grows by `multiplier`
/// up to `max_interval`, with symmetric jitter of `randomization_factor`.
#[derive(Debug, Clone)]
pub struct CountedBackoff {
    config: BackoffConfig,
    current: Duration,
    failures: u32,
}

impl CountedBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: Duration::ZERO,
            failures: 0,
        }
    }

    /// Returns the delay to wait before the next attempt and advances the
    /// exponential sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.jittered(self.current);
        self.current = if self.current.is_zero() {
            self.config.initial_interval
        } else {
            Duration::try_from_secs_f64(self.current.as_secs_f64() * self.config.multiplier)
                .unwrap_or(self.config.max_interval)
                .min(self.config.max_interval)
        };
        delay
    }

    /// Zeroes the delay and the failure counter.
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
        self.failures = 0;
    }

    pub fn increment_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    fn jittered(&self, interval: Duration) -> Duration {
        let factor = self.config.randomization_factor;
        if interval.is_zero() || factor <= 0.0 {
            return interval;
        }
        let secs = interval.as_secs_f64();
        let delta = secs * factor;
        let jittered = rand::thread_rng().gen_range((secs - delta)..=(secs + delta));
        Duration::try_from_secs_f64(jittered)
            .unwrap_or(interval)
            .min(self.config.max_interval)
    }
}
