//! Wall-clock abstraction used for lease expiration math.
//!
//! Timers (tickers, backoff sleeps, step-down cooldowns) always go through
//! `tokio::time`; only comparisons against store-side expiration timestamps
//! read a [`Clock`].

use std::fmt;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub trait Clock: Send + Sync + fmt::Debug + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A wall clock driven by the tokio timer.
///
/// Captures the wall time once and then advances with `tokio::time::Instant`,
/// so it follows `tokio::time::pause`/`advance` in tests and stays consistent
/// with the tickers used by the voter loop.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall: DateTime<Utc>,
    start: Instant,
}

impl TokioClock {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self {
            wall: Utc::now(),
            start: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().duration_since(self.start);
        match chrono::Duration::from_std(elapsed) {
            Ok(elapsed) => self.wall + elapsed,
            Err(_) => Utc::now(),
        }
    }
}
