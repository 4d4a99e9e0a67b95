//! Period resolution: named periods to aligned bucket timestamps.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TollgateError;

/// Number of sub-segments a rate window is split into.
pub const RATE_SEGMENTS: i64 = 10;

const MILLIS_PER_SEC: i64 = 1000;

/// Named limit period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// Per-second limiting
    Second,
    /// Per-minute limiting
    Minute,
    /// Per-hour limiting
    Hour,
    /// Per-day limiting
    Day,
    /// Per-month limiting (31 day window)
    Month,
}

/// An aligned bucket position and the lifetime its bucket gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Bucket start, epoch milliseconds
    pub timestamp_ms: i64,
    /// Bucket TTL in seconds, equal to the period's window length
    pub ttl_secs: i64,
}

impl Period {
    /// All periods, shortest first.
    pub const ALL: [Period; 5] = [
        Period::Second,
        Period::Minute,
        Period::Hour,
        Period::Day,
        Period::Month,
    ];

    /// The period's name as stored in rule mappings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Second => "second",
            Period::Minute => "minute",
            Period::Hour => "hour",
            Period::Day => "day",
            Period::Month => "month",
        }
    }

    /// Window length in seconds. Also the TTL of every bucket for this period.
    pub fn window_secs(&self) -> i64 {
        match self {
            Period::Second => 1,
            Period::Minute => 60,
            Period::Hour => 60 * 60,
            Period::Day => 60 * 60 * 24,
            Period::Month => 60 * 60 * 24 * 31,
        }
    }

    /// Length of one rate sub-segment in milliseconds.
    pub fn segment_millis(&self) -> i64 {
        segment_millis(self.window_secs())
    }

    /// Reverse lookup from a window length.
    pub fn from_window_secs(secs: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.window_secs() == secs)
    }

    /// Fixed-window alignment: `now` truncated to the period's calendar boundary.
    pub fn quota_window(&self, now: DateTime<Utc>) -> Window {
        let secs = now.timestamp();
        let start_secs = match self {
            Period::Month => month_start(now),
            _ => secs.div_euclid(self.window_secs()) * self.window_secs(),
        };
        Window {
            timestamp_ms: start_secs * MILLIS_PER_SEC,
            ttl_secs: self.window_secs(),
        }
    }

    /// Sliding-window alignment: `now` floored to the sub-segment length.
    pub fn rate_window(&self, now: DateTime<Utc>) -> Window {
        let segment = self.segment_millis();
        Window {
            timestamp_ms: now.timestamp_millis().div_euclid(segment) * segment,
            ttl_secs: self.window_secs(),
        }
    }
}

/// Sub-segment length in milliseconds for a window of `ttl_secs`.
pub fn segment_millis(ttl_secs: i64) -> i64 {
    ttl_secs * MILLIS_PER_SEC / RATE_SEGMENTS
}

fn month_start(now: DateTime<Utc>) -> i64 {
    let day = now.date_naive();
    let first = day.with_day(1).unwrap_or(day);
    first.and_time(NaiveTime::MIN).and_utc().timestamp()
}

impl FromStr for Period {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "second" => Ok(Period::Second),
            "minute" => Ok(Period::Minute),
            "hour" => Ok(Period::Hour),
            "day" => Ok(Period::Day),
            "month" => Ok(Period::Month),
            other => Err(TollgateError::UnknownPeriod(other.to_string())),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
