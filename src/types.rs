//! Core time types for the rollup store
//!
//! This module defines the calendar model every tier is built on:
//!
//! - **`Timestamp`**: UTC milliseconds since the Unix epoch
//! - **`Period`**: Summarization granularity with a total order (coarsest first)
//! - **`Direction`**: Which way to walk the period chain
//! - **`DateRange`**: Closed `[start, end]` interval with calendar alignment
//!
//! # Example
//!
//! ```rust
//! use rollup_store::types::{DateRange, Period};
//!
//! // 2010-01-30T23:50:00Z
//! let t = 1_264_895_400_000;
//! let hour = DateRange::align(Period::Hourly, t);
//!
//! assert!(hour.includes(t));
//! assert_eq!(hour.end - hour.start, 3_599_999);
//! assert!(DateRange::lies_on_boundary(hour.start, Period::Hourly));
//! ```

use chrono::{DateTime, Datelike, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// UTC milliseconds since the Unix epoch
pub type Timestamp = i64;

/// First instant of year 1 (0001-01-01T00:00:00.000Z)
pub const MIN_TIMESTAMP: Timestamp = -62_135_596_800_000;

/// Last instant of year 9999 (9999-12-31T23:59:59.999Z)
pub const MAX_TIMESTAMP: Timestamp = 253_402_300_799_999;

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const FIFTEEN_MINUTES_MS: i64 = 15 * MINUTE_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Summarization granularity
///
/// Variants are declared coarsest first, so the derived `Ord` gives
/// `Forever < Yearly < ... < Realtime`. "Less granular" means coarser.
///
/// Weekly buckets sit outside the regular roll-up chain because weeks do not
/// align to months: `Daily.less_granular()` skips to `Monthly`, and
/// `Weekly` escalates to `Monthly` going coarser or `Daily` going finer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    /// One bucket for all time
    Forever,
    /// Calendar year
    Yearly,
    /// Calendar month
    Monthly,
    /// Sunday-start week
    Weekly,
    /// Calendar day
    Daily,
    /// Clock hour
    Hourly,
    /// Quarter hour
    FifteenMinute,
    /// Clock minute
    Minutely,
    /// Clock second
    Secondly,
    /// The raw instant, never summarized
    Realtime,
}

/// Direction to walk the period chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward `Forever`
    Coarser,
    /// Toward `Realtime`
    Finer,
}

impl Period {
    /// Every period, coarsest first
    pub const ALL: [Period; 10] = [
        Period::Forever,
        Period::Yearly,
        Period::Monthly,
        Period::Weekly,
        Period::Daily,
        Period::Hourly,
        Period::FifteenMinute,
        Period::Minutely,
        Period::Secondly,
        Period::Realtime,
    ];

    /// Lowercase name used in config files and backend keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Forever => "forever",
            Period::Yearly => "yearly",
            Period::Monthly => "monthly",
            Period::Weekly => "weekly",
            Period::Daily => "daily",
            Period::Hourly => "hourly",
            Period::FifteenMinute => "fifteen_minute",
            Period::Minutely => "minutely",
            Period::Secondly => "secondly",
            Period::Realtime => "realtime",
        }
    }

    /// The next coarser tier in the roll-up chain
    pub fn less_granular(&self) -> Option<Period> {
        match self {
            Period::Realtime => Some(Period::Secondly),
            Period::Secondly => Some(Period::Minutely),
            Period::Minutely => Some(Period::FifteenMinute),
            Period::FifteenMinute => Some(Period::Hourly),
            Period::Hourly => Some(Period::Daily),
            Period::Daily => Some(Period::Monthly),
            Period::Weekly => Some(Period::Monthly),
            Period::Monthly => Some(Period::Yearly),
            Period::Yearly => Some(Period::Forever),
            Period::Forever => None,
        }
    }

    /// The next finer tier in the roll-up chain
    pub fn more_granular(&self) -> Option<Period> {
        match self {
            Period::Forever => Some(Period::Yearly),
            Period::Yearly => Some(Period::Monthly),
            Period::Monthly => Some(Period::Daily),
            Period::Weekly => Some(Period::Daily),
            Period::Daily => Some(Period::Hourly),
            Period::Hourly => Some(Period::FifteenMinute),
            Period::FifteenMinute => Some(Period::Minutely),
            Period::Minutely => Some(Period::Secondly),
            Period::Secondly => Some(Period::Realtime),
            Period::Realtime => None,
        }
    }

    /// Step once in `direction`
    pub fn step(&self, direction: Direction) -> Option<Period> {
        match direction {
            Direction::Coarser => self.less_granular(),
            Direction::Finer => self.more_granular(),
        }
    }

    /// Walk from `self` (inclusive) in `direction` until a supported tier is found
    ///
    /// Returns `None` once the chain is exhausted.
    pub fn closest_supported(self, supported: &[Period], direction: Direction) -> Option<Period> {
        let mut current = Some(self);
        while let Some(period) = current {
            if supported.contains(&period) {
                return Some(period);
            }
            current = period.step(direction);
        }
        None
    }

    /// The coarsest period of a set
    pub fn least_granular(periods: &[Period]) -> Option<Period> {
        periods.iter().copied().min()
    }

    /// The finest period of a set
    pub fn most_granular(periods: &[Period]) -> Option<Period> {
        periods.iter().copied().max()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Period::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| ValidationError::UnknownName {
                kind: "period",
                value: s.to_string(),
            })
    }
}

/// Closed time interval `[start, end]` in UTC milliseconds
///
/// Ordering is by start, then end, which keeps per-tier result sets
/// chronological.
///
/// # Example
///
/// ```rust
/// use rollup_store::types::DateRange;
///
/// let range = DateRange::new(1000, 2000).unwrap();
/// assert!(range.includes(1000));
/// assert!(range.includes(2000));
/// assert!(!range.includes(2001));
///
/// assert!(DateRange::new(2000, 1000).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateRange {
    /// First millisecond (inclusive)
    pub start: Timestamp,
    /// Last millisecond (inclusive)
    pub end: Timestamp,
}

impl DateRange {
    /// Create a range, rejecting `start > end`
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Snap `instant` to the bucket of `period` that contains it
    ///
    /// Instants outside year 1..=9999 are clamped first. `Realtime` maps to
    /// the instant itself; every other period widens to calendar boundaries
    /// with millisecond-exact edges.
    pub fn align(period: Period, instant: Timestamp) -> DateRange {
        let t = instant.clamp(MIN_TIMESTAMP, MAX_TIMESTAMP);
        let (start, end) = match period {
            Period::Realtime => (t, t),
            Period::Secondly => fixed_width(t, SECOND_MS),
            Period::Minutely => fixed_width(t, MINUTE_MS),
            Period::FifteenMinute => fixed_width(t, FIFTEEN_MINUTES_MS),
            Period::Hourly => fixed_width(t, HOUR_MS),
            Period::Daily => fixed_width(t, DAY_MS),
            Period::Weekly => {
                let day = t.div_euclid(DAY_MS);
                // 1970-01-01 was a Thursday, four days after a Sunday
                let since_sunday = (day + 4).rem_euclid(7);
                let start = (day - since_sunday) * DAY_MS;
                (start, start + 7 * DAY_MS - 1)
            },
            Period::Monthly => {
                let date = to_datetime(t);
                let (year, month) = (date.year(), date.month());
                let (next_year, next_month) = if month == 12 {
                    (year + 1, 1)
                } else {
                    (year, month + 1)
                };
                (
                    month_start(year, month),
                    month_start(next_year, next_month) - 1,
                )
            },
            Period::Yearly => {
                let year = to_datetime(t).year();
                (month_start(year, 1), month_start(year + 1, 1) - 1)
            },
            Period::Forever => (MIN_TIMESTAMP, MAX_TIMESTAMP),
        };
        DateRange {
            start: start.max(MIN_TIMESTAMP),
            end: end.min(MAX_TIMESTAMP),
        }
    }

    /// True if `instant` is exactly the start or the end of its `period` bucket
    pub fn lies_on_boundary(instant: Timestamp, period: Period) -> bool {
        let range = Self::align(period, instant);
        instant == range.start || instant == range.end
    }

    /// Closed-interval membership
    pub fn includes(&self, instant: Timestamp) -> bool {
        self.start <= instant && instant <= self.end
    }

    /// Iterate the `period` buckets overlapping this range, ascending
    pub fn buckets(&self, period: Period) -> Buckets {
        Buckets {
            period,
            next: Some(Self::align(period, self.start).start),
            end: self.end,
        }
    }

    /// Aligned start of every `period` bucket overlapping this range
    pub fn to_dates(&self, period: Period) -> Vec<Timestamp> {
        self.buckets(period).map(|b| b.start).collect()
    }

    /// Width of the range in milliseconds (`end - start + 1`)
    pub fn span_ms(&self) -> i64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} -> {}]",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}

/// Iterator over consecutive aligned buckets, see [`DateRange::buckets`]
#[derive(Debug, Clone)]
pub struct Buckets {
    period: Period,
    next: Option<Timestamp>,
    end: Timestamp,
}

impl Iterator for Buckets {
    type Item = DateRange;

    fn next(&mut self) -> Option<DateRange> {
        let cursor = self.next?;
        if cursor > self.end {
            self.next = None;
            return None;
        }
        let bucket = DateRange::align(self.period, cursor);
        self.next = if bucket.end >= MAX_TIMESTAMP {
            None
        } else {
            Some(bucket.end + 1)
        };
        Some(bucket)
    }
}

fn fixed_width(t: Timestamp, width: i64) -> (Timestamp, Timestamp) {
    let start = t - t.rem_euclid(width);
    (start, start + width - 1)
}

fn to_datetime(t: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn month_start(year: i32, month: u32) -> Timestamp {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(MIN_TIMESTAMP)
}

/// Render a timestamp as RFC 3339 with millisecond precision
pub fn format_timestamp(t: Timestamp) -> String {
    to_datetime(t).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 date-time, or a bare integer of epoch milliseconds
pub fn parse_timestamp(s: &str) -> Result<Timestamp, ValidationError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| ValidationError::UnknownName {
            kind: "timestamp",
            value: s.to_string(),
        })
}
