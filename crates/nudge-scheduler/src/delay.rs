//! Step delay → absolute run time.
//!
//! Only fixed unit-based offsets are supported; there is no cron syntax.

use chrono::{DateTime, Duration, Utc};
use nudge_core::error::{NudgeError, Result};
use serde::{Deserialize, Serialize};

/// Delay unit of a sequence step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    /// Parse a stored unit name. Unknown or missing units fall back to hours.
    pub fn parse_or_default(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_lowercase()).as_deref() {
            Some("minutes") | Some("minute") => DelayUnit::Minutes,
            Some("days") | Some("day") => DelayUnit::Days,
            Some("hours") | Some("hour") => DelayUnit::Hours,
            Some(other) => {
                tracing::debug!("Unknown delay unit '{other}', using hours");
                DelayUnit::Hours
            }
            None => DelayUnit::Hours,
        }
    }

    /// `None` when `value` units do not fit in a `Duration`.
    fn span(self, value: i64) -> Option<Duration> {
        match self {
            DelayUnit::Minutes => Duration::try_minutes(value),
            DelayUnit::Hours => Duration::try_hours(value),
            DelayUnit::Days => Duration::try_days(value),
        }
    }
}

/// Delay as authored on a step. Both fields are optional in stored data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDelay {
    #[serde(default)]
    pub value: Option<i64>,
    #[serde(default)]
    pub unit: Option<String>,
}

impl StepDelay {
    pub fn new(value: i64, unit: &str) -> Self {
        Self {
            value: Some(value),
            unit: Some(unit.to_string()),
        }
    }

    /// Offset from the trigger point. Missing or non-positive values mean
    /// "run immediately"; `None` when the value is out of range.
    pub fn offset(&self) -> Option<Duration> {
        let value = self.value.filter(|v| *v > 0).unwrap_or(0);
        DelayUnit::parse_or_default(self.unit.as_deref()).span(value)
    }
}

/// Absolute run instant for a step triggered at `now`.
///
/// Stored delays come from operators, so an offset past the representable
/// calendar is a `Schedule` error rather than an overflow.
pub fn run_at(delay: &StepDelay, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    delay
        .offset()
        .and_then(|offset| now.checked_add_signed(offset))
        .ok_or_else(|| {
            NudgeError::Schedule(format!(
                "Step delay {:?} {} is out of range",
                delay.value,
                delay.unit.as_deref().unwrap_or("hours")
            ))
        })
}
