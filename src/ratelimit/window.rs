//! Window durations and their time units.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{QuotaError, Result};

/// Unit in which a caller expresses a window length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[serde(alias = "ms", alias = "millisecond")]
    Milliseconds,
    #[default]
    #[serde(alias = "s", alias = "second")]
    Seconds,
    #[serde(alias = "m", alias = "minute")]
    Minutes,
    #[serde(alias = "h", alias = "hour")]
    Hours,
    #[serde(alias = "d", alias = "day")]
    Days,
}

impl TimeUnit {
    /// Number of milliseconds in one unit.
    pub fn millis(&self) -> u64 {
        match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
        }
    }
}

impl FromStr for TimeUnit {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ms" | "millisecond" | "milliseconds" => Ok(TimeUnit::Milliseconds),
            "s" | "second" | "seconds" => Ok(TimeUnit::Seconds),
            "m" | "minute" | "minutes" => Ok(TimeUnit::Minutes),
            "h" | "hour" | "hours" => Ok(TimeUnit::Hours),
            "d" | "day" | "days" => Ok(TimeUnit::Days),
            other => Err(QuotaError::InvalidWindow(format!("unknown time unit {:?}", other))),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeUnit::Milliseconds => "milliseconds",
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
        };
        f.write_str(name)
    }
}

/// Normalize a window given in `unit` to seconds.
///
/// Fails with [`QuotaError::InvalidWindow`] for NaN, infinite or non-positive values.
pub fn window_seconds(window: f64, unit: TimeUnit) -> Result<f64> {
    if !window.is_finite() || window <= 0.0 {
        return Err(QuotaError::InvalidWindow(format!(
            "window must be a positive number, got {}",
            window
        )));
    }
    Ok(window * unit.millis() as f64 / 1000.0)
}

/// Window length in whole milliseconds, rounded up so that it stays positive.
pub fn window_millis(window: f64, unit: TimeUnit) -> Result<i64> {
    let seconds = window_seconds(window, unit)?;
    let millis = (seconds * 1000.0).ceil();
    if millis >= i64::MAX as f64 {
        return Err(QuotaError::InvalidWindow(format!(
            "window of {} {} is too large",
            window, unit
        )));
    }
    Ok(millis as i64)
}
