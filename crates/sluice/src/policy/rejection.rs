use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Decides whether a row's event time is still acceptable at the current processing time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RejectionPolicy {
    /// Accept everything. Suitable for backfills.
    #[default]
    Noop,
    /// Accept rows within `window` of processing time in either direction.
    ServerTime { window: Duration },
}

impl RejectionPolicy {
    pub fn server_time(window: Duration) -> Self {
        RejectionPolicy::ServerTime { window }
    }

    pub fn accept(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            RejectionPolicy::Noop => true,
            RejectionPolicy::ServerTime { window } => {
                let window = TimeDelta::from_std(*window).unwrap_or(TimeDelta::MAX);
                let lag = now.signed_duration_since(timestamp);
                -window <= lag && lag <= window
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_timestamp;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap()
    }

    #[test]
    fn test_noop_accepts_anything() {
        let policy = RejectionPolicy::Noop;
        assert!(policy.accept(ts("1999-01-01T00:00:00Z"), ts("2013-01-01T00:00:00Z")));
        assert!(policy.accept(ts("2099-01-01T00:00:00Z"), ts("2013-01-01T00:00:00Z")));
    }

    #[test]
    fn test_server_time_window_is_inclusive_both_ways() {
        let policy = RejectionPolicy::server_time(Duration::from_secs(600));
        let now = ts("2013-01-01T12:00:00Z");

        assert!(policy.accept(ts("2013-01-01T11:50:00Z"), now));
        assert!(policy.accept(ts("2013-01-01T12:10:00Z"), now));
        assert!(!policy.accept(ts("2013-01-01T11:49:59.999Z"), now));
        assert!(!policy.accept(ts("2013-01-01T12:10:00.001Z"), now));
    }
}
