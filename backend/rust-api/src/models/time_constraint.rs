use chrono::{DateTime, Duration, Utc};
use std::{fmt, str::FromStr};

/// Sentinel stored on tasks without a time budget.
pub const UNLIMITED: &str = "00:00:00";

/// Largest accepted hour count, about 114 years.
pub const MAX_HOURS: i64 = 999_999;

/// Time budget of a task, stored as a literal `"HH:MM:SS"` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeConstraint {
    Unlimited,
    Limited { millis: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeConstraintError {
    #[error("time constraint must look like HH:MM:SS, got {0:?}")]
    Format(String),
    #[error("time constraint is out of range (minutes and seconds below 60, at most 999999 hours), got {0:?}")]
    OutOfRange(String),
}

impl TimeConstraint {
    pub fn parse(raw: &str) -> Result<Self, TimeConstraintError> {
        raw.parse()
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, TimeConstraint::Unlimited)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match self {
            TimeConstraint::Unlimited => None,
            TimeConstraint::Limited { millis } => Some(*millis),
        }
    }

    /// Saturates at the latest representable instant instead of overflowing.
    pub fn deadline(&self, started_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration_ms().map(|ms| {
            Duration::try_milliseconds(ms)
                .and_then(|budget| started_at.checked_add_signed(budget))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    /// Remaining budget at `now`, clamped to zero. `None` for unlimited tasks.
    pub fn remaining(&self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline(started_at)
            .map(|deadline| (deadline - now).max(Duration::zero()))
    }

    pub fn is_expired(&self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.remaining(started_at, now)
            .map(|left| left <= Duration::zero())
            .unwrap_or(false)
    }
}

impl FromStr for TimeConstraint {
    type Err = TimeConstraintError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let parts: Vec<&str> = trimmed.split(':').collect();
        if parts.len() != 3
            || parts
                .iter()
                .any(|p| p.len() < 2 || !p.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(TimeConstraintError::Format(raw.to_string()));
        }

        let out_of_range = || TimeConstraintError::OutOfRange(raw.to_string());
        // Digits only by now, so a parse failure means the value overflowed.
        let field = |s: &str| s.parse::<i64>().map_err(|_| out_of_range());
        let hours = field(parts[0])?;
        let minutes = field(parts[1])?;
        let seconds = field(parts[2])?;

        if minutes >= 60 || seconds >= 60 || hours > MAX_HOURS {
            return Err(out_of_range());
        }

        let millis = hours
            .checked_mul(60)
            .and_then(|m| m.checked_add(minutes))
            .and_then(|m| m.checked_mul(60))
            .and_then(|s| s.checked_add(seconds))
            .and_then(|s| s.checked_mul(1000))
            .ok_or_else(out_of_range)?;
        if millis == 0 {
            Ok(TimeConstraint::Unlimited)
        } else {
            Ok(TimeConstraint::Limited { millis })
        }
    }
}

impl fmt::Display for TimeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeConstraint::Unlimited => f.write_str(UNLIMITED),
            TimeConstraint::Limited { millis } => {
                let total = millis / 1000;
                write!(
                    f,
                    "{:02}:{:02}:{:02}",
                    total / 3600,
                    (total / 60) % 60,
                    total % 60
                )
            }
        }
    }
}
