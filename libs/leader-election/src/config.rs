//! Client configuration.
//!
//! Durations accept either a bare integer (seconds) or a string with one of
//! the `ms`, `s`, `m` or `h` units:
//!
//! ```yaml
//! max_failed_steps: 10
//! channel_capacity: 1
//! min_term: 1s
//! backoff:
//!   initial_interval: 500ms
//!   multiplier: 1.5
//!   randomization_factor: 0.5
//!   max_interval: 1m
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Deserializer, de};
use tracing::debug;

use crate::error::{ElectionError, ElectionResult};

/// Number of consecutive failures tolerated before a watch position is reset.
pub const DEFAULT_MAX_FAILED_STEPS: u32 = 10;
/// Capacity of the channels between watch loops and dispatchers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;
/// Store TTLs have one second granularity.
pub const DEFAULT_MIN_TERM: Duration = Duration::from_secs(1);

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Top-level configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Retry policy for watch loops.
    pub backoff: BackoffConfig,
    /// Failed watch (re)establishments tolerated before a forced reset.
    pub max_failed_steps: u32,
    /// Buffer size of value/action channels.
    pub channel_capacity: usize,
    /// Shortest accepted voter term.
    #[serde(deserialize_with = "deserialize_duration")]
    pub min_term: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_failed_steps: DEFAULT_MAX_FAILED_STEPS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            min_term: DEFAULT_MIN_TERM,
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Fraction of the current interval used as jitter on either side.
    pub randomization_factor: f64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_interval: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            multiplier: DEFAULT_MULTIPLIER,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            max_interval: DEFAULT_MAX_INTERVAL,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> ElectionResult<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ElectionError::Config(format!(
                "backoff multiplier must be >= 1, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(ElectionError::Config(format!(
                "backoff randomization_factor must be within [0, 1], got {}",
                self.randomization_factor
            )));
        }
        if self.initial_interval > self.max_interval {
            return Err(ElectionError::Config(format!(
                "backoff initial_interval {:?} exceeds max_interval {:?}",
                self.initial_interval, self.max_interval
            )));
        }
        Ok(())
    }
}

impl ElectionConfig {
    /// Read and validate a YAML config file.
    pub fn parse<P: AsRef<Path>>(path: P) -> ElectionResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "reading election config");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(s: &str) -> ElectionResult<Self> {
        let cfg: ElectionConfig = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> ElectionResult<()> {
        self.backoff.validate()?;
        if self.max_failed_steps == 0 {
            return Err(ElectionError::Config(
                "max_failed_steps must be greater than zero".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ElectionError::Config(
                "channel_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a duration string with an optional unit suffix.
/// Accepts: "30", "30s", "500ms", "5m", "1h". No unit means seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".into());
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(end);
    let num = num
        .parse::<u64>()
        .map_err(|e| format!("invalid number in duration '{s}': {e}"))?;

    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(num),
        "ms" => Duration::from_millis(num),
        "m" => num
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or("duration value overflow")?,
        "h" => num
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or("duration value overflow")?,
        other => {
            return Err(format!(
                "unknown time unit '{other}', only 'h', 'm', 's' or 'ms' are supported"
            ));
        }
    };
    Ok(duration)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    String(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::String(s) => parse_duration(&s).map_err(de::Error::custom),
    }
}
