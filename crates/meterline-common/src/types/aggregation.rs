//! Aggregation types and time windows

use crate::error::{MeteringError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How usage is folded into a single value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationType {
    Count,
    Sum,
    Avg,
    CountUnique,
    Latest,
}

impl AggregationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationType::Count => "COUNT",
            AggregationType::Sum => "SUM",
            AggregationType::Avg => "AVG",
            AggregationType::CountUnique => "COUNT_UNIQUE",
            AggregationType::Latest => "LATEST",
        }
    }

    /// Result column is an unsigned integer rather than a float
    pub fn is_integer_result(&self) -> bool {
        matches!(self, AggregationType::Count | AggregationType::CountUnique)
    }

    /// Whether a property name must be supplied
    pub fn requires_property(&self) -> bool {
        !matches!(self, AggregationType::Count)
    }

    /// Whether the property must hold numbers
    pub fn requires_numeric_property(&self) -> bool {
        matches!(
            self,
            AggregationType::Sum | AggregationType::Avg | AggregationType::Latest
        )
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationType {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "COUNT" => Ok(AggregationType::Count),
            "SUM" => Ok(AggregationType::Sum),
            "AVG" => Ok(AggregationType::Avg),
            "COUNT_UNIQUE" => Ok(AggregationType::CountUnique),
            "LATEST" => Ok(AggregationType::Latest),
            other => Err(MeteringError::Validation(format!(
                "invalid aggregation type: {}",
                other
            ))),
        }
    }
}

/// Bucket width for time-windowed usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowSize {
    #[serde(rename = "MINUTE")]
    Minute,
    #[serde(rename = "15MIN")]
    FifteenMinutes,
    #[serde(rename = "30MIN")]
    ThirtyMinutes,
    #[serde(rename = "HOUR")]
    Hour,
    #[serde(rename = "3HOUR")]
    ThreeHours,
    #[serde(rename = "6HOUR")]
    SixHours,
    #[serde(rename = "12HOUR")]
    TwelveHours,
    #[serde(rename = "DAY")]
    Day,
    #[serde(rename = "WEEK")]
    Week,
    #[serde(rename = "MONTH")]
    Month,
}

impl WindowSize {
    /// Fixed width in minutes, `None` for calendar months
    fn fixed_minutes(&self) -> Option<i64> {
        match self {
            WindowSize::Minute => Some(1),
            WindowSize::FifteenMinutes => Some(15),
            WindowSize::ThirtyMinutes => Some(30),
            WindowSize::Hour => Some(60),
            WindowSize::ThreeHours => Some(180),
            WindowSize::SixHours => Some(360),
            WindowSize::TwelveHours => Some(720),
            WindowSize::Day => Some(1440),
            WindowSize::Week => Some(10080),
            WindowSize::Month => None,
        }
    }

    /// ClickHouse expression truncating `expr` to the start of its bucket (UTC).
    /// Weeks start on Monday.
    pub fn bucket_sql(&self, expr: &str) -> String {
        match self {
            WindowSize::Minute => format!("toStartOfMinute({}, 'UTC')", expr),
            WindowSize::FifteenMinutes => {
                format!("toStartOfInterval({}, INTERVAL 15 MINUTE, 'UTC')", expr)
            }
            WindowSize::ThirtyMinutes => {
                format!("toStartOfInterval({}, INTERVAL 30 MINUTE, 'UTC')", expr)
            }
            WindowSize::Hour => format!("toStartOfHour({}, 'UTC')", expr),
            WindowSize::ThreeHours => {
                format!("toStartOfInterval({}, INTERVAL 3 HOUR, 'UTC')", expr)
            }
            WindowSize::SixHours => {
                format!("toStartOfInterval({}, INTERVAL 6 HOUR, 'UTC')", expr)
            }
            WindowSize::TwelveHours => {
                format!("toStartOfInterval({}, INTERVAL 12 HOUR, 'UTC')", expr)
            }
            WindowSize::Day => format!("toStartOfDay({}, 'UTC')", expr),
            WindowSize::Week => format!("toStartOfWeek({}, 1, 'UTC')", expr),
            WindowSize::Month => format!("toStartOfMonth({}, 'UTC')", expr),
        }
    }

    /// `STEP` interval for `WITH FILL`
    pub fn step_sql(&self) -> &'static str {
        match self {
            WindowSize::Minute => "INTERVAL 1 MINUTE",
            WindowSize::FifteenMinutes => "INTERVAL 15 MINUTE",
            WindowSize::ThirtyMinutes => "INTERVAL 30 MINUTE",
            WindowSize::Hour => "INTERVAL 1 HOUR",
            WindowSize::ThreeHours => "INTERVAL 3 HOUR",
            WindowSize::SixHours => "INTERVAL 6 HOUR",
            WindowSize::TwelveHours => "INTERVAL 12 HOUR",
            WindowSize::Day => "INTERVAL 1 DAY",
            WindowSize::Week => "INTERVAL 7 DAY",
            WindowSize::Month => "INTERVAL 1 MONTH",
        }
    }

    /// Start of the bucket containing `ts`, matching [`WindowSize::bucket_sql`]
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            WindowSize::Month => {
                let first = NaiveDate::from_ymd_opt(ts.year(), ts.month(), 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0));
                match first {
                    Some(naive) => Utc.from_utc_datetime(&naive),
                    None => ts,
                }
            }
            WindowSize::Week => {
                let day = WindowSize::Day.bucket_start(ts);
                day - Duration::days(ts.weekday().num_days_from_monday() as i64)
            }
            other => {
                // Fixed intervals are aligned to the unix epoch
                let width = other.fixed_minutes().unwrap_or(60) * 60;
                let secs = ts.timestamp();
                let start = secs - secs.rem_euclid(width);
                Utc.timestamp_opt(start, 0).single().unwrap_or(ts)
            }
        }
    }

    /// Start of the bucket after the one starting at `bucket`
    pub fn next_bucket(&self, bucket: DateTime<Utc>) -> DateTime<Utc> {
        match self.fixed_minutes() {
            Some(minutes) => bucket + Duration::minutes(minutes),
            None => {
                let (year, month) = if bucket.month() == 12 {
                    (bucket.year() + 1, 1)
                } else {
                    (bucket.year(), bucket.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| Utc.from_utc_datetime(&naive))
                    .unwrap_or(bucket + Duration::days(31))
            }
        }
    }

    /// Every bucket start in `[start, end)`
    pub fn buckets(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        let mut bucket = self.bucket_start(start);
        while bucket < end {
            out.push(bucket);
            bucket = self.next_bucket(bucket);
        }
        out
    }
}
