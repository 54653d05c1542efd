//! Time ranges and recent-hour id snapshots
//!
//! Queries over the last hour or two are served from in-memory
//! snapshots of "all ids seen this hour" instead of the per-day index.
//! The snapshots are published atomically and shared by both index
//! generations; the ingestion layer replaces them as hours roll over.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Milliseconds per hour
pub const MSEC_PER_HOUR: u64 = 3_600_000;

/// Milliseconds per day
pub const MSEC_PER_DAY: u64 = 24 * MSEC_PER_HOUR;

/// Half-open time range in unix milliseconds (both bounds inclusive)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl TimeRange {
    /// Create a time range
    pub fn new(min_timestamp: i64, max_timestamp: i64) -> Self {
        Self {
            min_timestamp,
            max_timestamp,
        }
    }

    /// The zero range, used when no time bound applies
    pub fn zero() -> Self {
        Self::default()
    }

    /// Check whether this is the zero range
    pub fn is_zero(&self) -> bool {
        self.min_timestamp == 0 && self.max_timestamp == 0
    }

    pub(crate) fn min_date(&self) -> u64 {
        self.min_timestamp as u64 / MSEC_PER_DAY
    }

    pub(crate) fn max_date(&self) -> u64 {
        self.max_timestamp as u64 / MSEC_PER_DAY
    }

    pub(crate) fn min_hour(&self) -> u64 {
        self.min_timestamp as u64 / MSEC_PER_HOUR
    }

    pub(crate) fn max_hour(&self) -> u64 {
        self.max_timestamp as u64 / MSEC_PER_HOUR
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.min_timestamp, self.max_timestamp)
    }
}

/// Snapshot of all metric ids seen during one hour, across all tenants
#[derive(Debug, Clone, Default)]
pub struct HourMetricIds {
    /// Hour number (unix milliseconds / [`MSEC_PER_HOUR`])
    pub hour: u64,
    /// Ids seen during the hour
    pub metric_ids: HashSet<u64>,
    /// True once the snapshot covers the hour completely; partial
    /// snapshots cannot answer queries
    pub is_full: bool,
}

/// Atomically replaceable hour snapshot, shared across generations
pub type SharedHourMetricIds = Arc<RwLock<Arc<HourMetricIds>>>;

/// Create an empty shared hour snapshot
pub fn new_shared_hour_metric_ids() -> SharedHourMetricIds {
    Arc::new(RwLock::new(Arc::new(HourMetricIds::default())))
}

/// Publish a replacement snapshot
pub fn publish_hour_metric_ids(shared: &SharedHourMetricIds, hm: HourMetricIds) {
    *shared.write() = Arc::new(hm);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_dates() {
        let tr = TimeRange::new(0, (MSEC_PER_DAY * 3) as i64);
        assert_eq!(tr.min_date(), 0);
        assert_eq!(tr.max_date(), 3);
        assert!(!tr.is_zero());
        assert!(TimeRange::zero().is_zero());
    }

    #[test]
    fn test_publish_hour_snapshot() {
        let shared = new_shared_hour_metric_ids();
        assert!(!shared.read().is_full);

        let mut ids = HashSet::new();
        ids.insert(7);
        publish_hour_metric_ids(
            &shared,
            HourMetricIds {
                hour: 12,
                metric_ids: ids,
                is_full: true,
            },
        );

        let hm = shared.read().clone();
        assert_eq!(hm.hour, 12);
        assert!(hm.is_full);
        assert!(hm.metric_ids.contains(&7));
    }
}
