//! Time buckets, truncation granularities and the injectable clock.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Canonical timestamp rendering, e.g. `2013-01-01T00:00:00.000Z`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Start instant in epoch milliseconds, used as the bucket key.
    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// True if `other` lies entirely inside this interval.
    pub fn contains_interval(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('/')
            .ok_or_else(|| format!("interval '{s}' is not of the form start/end"))?;
        let start = parse_timestamp(start).map_err(|e| format!("bad interval start: {e}"))?;
        let end = parse_timestamp(end).map_err(|e| format!("bad interval end: {e}"))?;
        if end < start {
            return Err(format!("interval '{s}' ends before it starts"));
        }
        Ok(Interval::new(start, end))
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Width of one sink's time bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentGranularity {
    Minute,
    FiveMinute,
    FifteenMinute,
    ThirtyMinute,
    #[default]
    Hour,
    SixHour,
    Day,
}

impl SegmentGranularity {
    pub fn millis(&self) -> i64 {
        match self {
            SegmentGranularity::Minute => MINUTE_MS,
            SegmentGranularity::FiveMinute => 5 * MINUTE_MS,
            SegmentGranularity::FifteenMinute => 15 * MINUTE_MS,
            SegmentGranularity::ThirtyMinute => 30 * MINUTE_MS,
            SegmentGranularity::Hour => HOUR_MS,
            SegmentGranularity::SixHour => 6 * HOUR_MS,
            SegmentGranularity::Day => DAY_MS,
        }
    }

    /// The aligned bucket containing `ts`. Pre-epoch instants round down.
    pub fn bucket(&self, ts: DateTime<Utc>) -> Interval {
        let width = self.millis();
        let offset = ts.timestamp_millis().rem_euclid(width);
        let start = ts.trunc_subsecs(3) - TimeDelta::milliseconds(offset);
        Interval::new(start, start + TimeDelta::milliseconds(width))
    }
}

/// Truncation applied to row timestamps before rollup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryGranularity {
    #[default]
    None,
    Minute,
    FifteenMinute,
    Hour,
    Day,
    All,
}

impl QueryGranularity {
    /// Truncate an epoch-millisecond timestamp. `All` collapses every row onto `i64::MIN`;
    /// callers clamp that to the bucket start.
    pub fn truncate(&self, millis: i64) -> i64 {
        let width = match self {
            QueryGranularity::None => return millis,
            QueryGranularity::All => return i64::MIN,
            QueryGranularity::Minute => MINUTE_MS,
            QueryGranularity::FifteenMinute => 15 * MINUTE_MS,
            QueryGranularity::Hour => HOUR_MS,
            QueryGranularity::Day => DAY_MS,
        };
        millis - millis.rem_euclid(width)
    }
}

/// Source of processing time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

pub type ClockRef = Arc<dyn Clock>;

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.millis.store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
