use std::fmt;
use std::sync::Arc;

use crate::time::{Interval, format_timestamp};

/// Caller-supplied version function.
pub type VersionFn = Arc<dyn Fn(&Interval) -> String + Send + Sync>;

/// Maps a bucket interval to the version string its sink carries for life.
#[derive(Clone, Default)]
pub enum VersioningPolicy {
    /// The interval's start instant, e.g. `2013-01-01T00:00:00.000Z`.
    #[default]
    IntervalStart,
    Custom(VersionFn),
}

impl VersioningPolicy {
    /// Always return `version`, whatever the interval.
    pub fn fixed(version: impl Into<String>) -> Self {
        let version = version.into();
        VersioningPolicy::Custom(Arc::new(move |_: &Interval| version.clone()))
    }

    pub fn version_for(&self, interval: &Interval) -> String {
        match self {
            VersioningPolicy::IntervalStart => format_timestamp(interval.start()),
            VersioningPolicy::Custom(f) => f(interval),
        }
    }
}

impl fmt::Debug for VersioningPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersioningPolicy::IntervalStart => f.write_str("IntervalStart"),
            VersioningPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{SegmentGranularity, parse_timestamp};

    #[test]
    fn test_interval_start_is_deterministic() {
        let interval =
            SegmentGranularity::Hour.bucket(parse_timestamp("2013-01-01T00:42:00Z").unwrap());
        let policy = VersioningPolicy::IntervalStart;
        assert_eq!(policy.version_for(&interval), "2013-01-01T00:00:00.000Z");
        assert_eq!(policy.version_for(&interval), policy.version_for(&interval));
    }

    #[test]
    fn test_custom_and_fixed() {
        let interval =
            SegmentGranularity::Day.bucket(parse_timestamp("2013-01-05T10:00:00Z").unwrap());
        let custom = VersioningPolicy::Custom(Arc::new(|i: &Interval| {
            format!("v-{}", i.start().format("%Y%m%d"))
        }));
        assert_eq!(custom.version_for(&interval), "v-20130105");
        assert_eq!(VersioningPolicy::fixed("rebuild-7").version_for(&interval), "rebuild-7");
    }
}
