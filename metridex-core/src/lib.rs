//! Metridex Core - Inverted Index Engine for a Multi-Tenant TSDB
//!
//! Metridex maps metric identity (name + label set) to internal numeric
//! identifiers and resolves tag-filter expressions into sorted
//! identifier lists over a time range.
//!
//! # Architecture
//!
//! - **Key codec**: one namespace prefix byte plus a big-endian tenant
//!   pair keeps byte order equal to logical order
//! - **Row writer**: one new series becomes one atomic batch of rows
//!   across five namespaces
//! - **Merge callback**: adjacent tag→ids rows are coalesced when the
//!   store compacts
//! - **Filter planner**: picks the cheapest positive filter, intersects
//!   the rest, and falls back to in-memory metric-name matching when a
//!   scan outruns its loop budget
//! - **Caches**: versioned tag-filter→TSIDs, id→TSID, id→name and
//!   useless-filter caches, all bounded working sets
//! - **Rollover**: two generations coexist during retention rollover;
//!   the previous one stays reachable through a ref-counted handle

pub mod cache;
pub mod filters;
pub mod keys;
pub mod mergeset;
pub mod metric_name;
pub mod rows;
pub mod time_index;
pub mod tsid;

mod db;
mod error;
mod search;

pub use cache::{invalidate_tag_cache, tag_filters_key_gen, WorkingSetCache};
pub use db::{IndexDb, IndexDbMetrics};
pub use error::{IndexError, Result};
pub use filters::{TagFilter, TagFilters};
pub use metric_name::{MetricName, Tag, TAG_SEPARATOR};
pub use rows::{merge_tag_rows, TagRowParser};
pub use time_index::{
    new_shared_hour_metric_ids, publish_hour_metric_ids, HourMetricIds, SharedHourMetricIds,
    TimeRange, MSEC_PER_DAY, MSEC_PER_HOUR,
};
pub use tsid::{MetricId, Tsid};

/// Metridex version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Maximum index scan loops per already found metric. More loops
    /// cost more than matching the found candidates by metric name.
    pub const MAX_INDEX_SCAN_LOOPS_PER_METRIC: usize = 400;

    /// Maximum day span served by the per-day index; longer ranges
    /// degrade to a pivot scan
    pub const MAX_DAYS_FOR_DATE_METRIC_IDS: u64 = 40;

    /// Tag-filter→TSIDs cache capacity (entries, per generation)
    pub const TAG_CACHE_CAPACITY: usize = 16 * 1024;

    /// Useless-filter cache capacity (entries, per generation)
    pub const USELESS_TAG_FILTERS_CACHE_CAPACITY: usize = 4 * 1024;

    /// MetricID→TSID cache capacity (entries, shared)
    pub const METRIC_ID_CACHE_CAPACITY: usize = 64 * 1024;

    /// MetricID→MetricName cache capacity (entries, shared)
    pub const METRIC_NAME_CACHE_CAPACITY: usize = 64 * 1024;
}
