use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_INTERVAL_HOURS;

/// When a subscriber's saved queries are polled. Times are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Schedule {
    Interval { hours: u32 },
    Daily { hour: u32, minute: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid schedule: {0}")]
pub struct ScheduleParseError(pub String);

impl Schedule {
    pub fn interval(hours: u32) -> Result<Self, ScheduleParseError> {
        if hours == 0 {
            return Err(ScheduleParseError("interval must be at least 1 hour".into()));
        }
        if hours > MAX_INTERVAL_HOURS {
            return Err(ScheduleParseError(format!(
                "interval must be at most {MAX_INTERVAL_HOURS} hours"
            )));
        }
        Ok(Schedule::Interval { hours })
    }

    pub fn daily(hour: u32, minute: u32) -> Result<Self, ScheduleParseError> {
        if hour > 23 || minute > 59 {
            return Err(ScheduleParseError(format!("{hour:02}:{minute:02} is not a valid time")));
        }
        Ok(Schedule::Daily { hour, minute })
    }

    /// Never checked subscribers are always due.
    pub fn is_due(&self, last_check: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_check else {
            return true;
        };
        match *self {
            Schedule::Interval { hours } => now - last >= interval_span(hours),
            Schedule::Daily { hour, minute } => match latest_daily_slot(hour, minute, now) {
                Some(slot) => slot > last,
                None => false,
            },
        }
    }

    pub fn next_due(&self, last_check: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_due(last_check, now) {
            return now;
        }
        match *self {
            Schedule::Interval { hours } => {
                // is_due returned false, so last_check is set
                let last = last_check.unwrap_or(now);
                last.checked_add_signed(interval_span(hours))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            Schedule::Daily { hour, minute } => latest_daily_slot(hour, minute, now)
                .and_then(|slot| slot.checked_add_signed(Duration::days(1)))
                .unwrap_or(now),
        }
    }
}

/// Also caps values deserialized without going through `Schedule::interval`.
fn interval_span(hours: u32) -> Duration {
    Duration::hours(i64::from(hours.min(MAX_INTERVAL_HOURS)))
}

/// The most recent `HH:MM` slot at or before `now`.
fn latest_daily_slot(hour: u32, minute: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let today = now.date_naive().and_time(time).and_utc();
    if today <= now {
        Some(today)
    } else {
        today.checked_sub_signed(Duration::days(1))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval { hours } => write!(f, "{hours}h"),
            Schedule::Daily { hour, minute } => write!(f, "daily {hour:02}:{minute:02}"),
        }
    }
}

/// Accepts `6h`, `6`, `daily 08:30` (the forms produced by `Display`).
impl FromStr for Schedule {
    type Err = ScheduleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Some(rest) = s.strip_prefix("daily") {
            let rest = rest.trim();
            let (h, m) = rest
                .split_once(':')
                .ok_or_else(|| ScheduleParseError(format!("expected HH:MM, got '{rest}'")))?;
            let hour = h
                .trim()
                .parse::<u32>()
                .map_err(|_| ScheduleParseError(format!("bad hour '{h}'")))?;
            let minute = m
                .trim()
                .parse::<u32>()
                .map_err(|_| ScheduleParseError(format!("bad minute '{m}'")))?;
            return Schedule::daily(hour, minute);
        }

        let digits = s.strip_suffix('h').unwrap_or(&s).trim();
        let hours = digits
            .parse::<u32>()
            .map_err(|_| ScheduleParseError(format!("unrecognised schedule '{s}'")))?;
        Schedule::interval(hours)
    }
}
