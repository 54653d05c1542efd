//! Error types for the metridex index engine

use thiserror::Error;

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Index engine error types
#[derive(Error, Debug)]
pub enum IndexError {
    /// IO operation failed in the underlying store
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unparseable row, wrong tail length or undecompressable cache entry
    #[error("index corruption: {0}")]
    Corruption(String),

    /// The number of matching series exceeds the caller-supplied limit
    #[error("the number of matching unique timeseries exceeds {max_metrics}; either narrow down the search or increase the limit")]
    TooManyMatches { max_metrics: usize },

    /// A tag filter could not be compiled
    #[error("invalid tag filter: {0}")]
    InvalidFilter(String),

    /// Internal signal: the index scan exceeded its loop budget and the
    /// caller must fall back to matching candidate metric names in memory.
    /// Never crosses the public API boundary.
    #[error("too many index scan loops; falling back to metric name matching")]
    FallbackToNameMatch,

    /// Internal signal: the per-day index has no rows for the requested
    /// range. Never crosses the public API boundary.
    #[error("missing per-day metric ids for the requested time range")]
    MissingDateIndex,
}

impl IndexError {
    /// Check if the error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, IndexError::Corruption(_))
    }

    /// Check if the error is an internal planner signal that must be
    /// consumed before returning to the caller
    pub(crate) fn is_internal(&self) -> bool {
        matches!(
            self,
            IndexError::FallbackToNameMatch | IndexError::MissingDateIndex
        )
    }
}
