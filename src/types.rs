//! Core data types used throughout the select data-plane
//!
//! # Key Types
//!
//! - **`TimeRange`**: inclusive query time window in milliseconds
//! - **`SearchQuery`**: tag filter groups plus a time range
//! - **`TagFilterSpec`**: one unparsed tag filter as it arrives on the wire
//! - **`Deadline`**: absolute monotonic instant consulted cooperatively

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::StorageError;

/// Time range for queries (inclusive on both ends)
///
/// Both bounds are unix timestamps in milliseconds. Timestamps equal to
/// either bound are included.
///
/// # Example
///
/// ```rust
/// use tsdb_select::types::TimeRange;
///
/// let range = TimeRange::new(1000, 2000).unwrap();
/// assert!(range.contains(1000));
/// assert!(range.contains(2000));
/// assert!(!range.contains(999));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp in milliseconds (inclusive)
    pub min_timestamp: i64,

    /// End timestamp in milliseconds (inclusive)
    pub max_timestamp: i64,
}

impl TimeRange {
    /// Create a new time range, validating that `min <= max`.
    pub fn new(min_timestamp: i64, max_timestamp: i64) -> Result<Self, StorageError> {
        if min_timestamp > max_timestamp {
            return Err(StorageError::InvalidTimeRange {
                min: min_timestamp,
                max: max_timestamp,
                reason: "min timestamp exceeds max timestamp".to_string(),
            });
        }
        Ok(Self {
            min_timestamp,
            max_timestamp,
        })
    }

    /// Create a new time range without validation.
    ///
    /// Range operations behave unexpectedly if `min > max`; only use this
    /// when the inputs were already validated.
    pub fn new_unchecked(min_timestamp: i64, max_timestamp: i64) -> Self {
        Self {
            min_timestamp,
            max_timestamp,
        }
    }

    /// Check if a timestamp falls within this range (inclusive).
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.min_timestamp && timestamp <= self.max_timestamp
    }

    /// Check if this range overlaps another inclusive range.
    pub fn overlaps(&self, min: i64, max: i64) -> bool {
        self.min_timestamp <= max && self.max_timestamp >= min
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            min_timestamp: i64::MIN,
            max_timestamp: i64::MAX,
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min_timestamp, self.max_timestamp)
    }
}

/// One tag filter as it arrives from the query layer, before compilation.
///
/// `key == ""` addresses the metric name itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilterSpec {
    /// Label name; empty string selects on the metric name.
    pub key: String,

    /// Literal value or regular expression to match.
    pub value: String,

    /// Invert the match.
    #[serde(default)]
    pub is_negative: bool,

    /// Interpret `value` as an anchored regular expression.
    #[serde(default)]
    pub is_regexp: bool,
}

impl fmt::Display for TagFilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match (self.is_negative, self.is_regexp) {
            (false, false) => "=",
            (true, false) => "!=",
            (false, true) => "=~",
            (true, true) => "!~",
        };
        write!(f, "{}{}{:?}", self.key, op, self.value)
    }
}

/// A structured series selector: OR-ed groups of AND-ed tag filters plus
/// an inclusive time range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Start timestamp in milliseconds (inclusive).
    pub min_timestamp: i64,

    /// End timestamp in milliseconds (inclusive).
    pub max_timestamp: i64,

    /// Outer list is OR, inner lists are AND. An empty outer list
    /// matches every series.
    pub tag_filterss: Vec<Vec<TagFilterSpec>>,
}

impl SearchQuery {
    /// Create a search query over the given range and filter groups.
    pub fn new(
        min_timestamp: i64,
        max_timestamp: i64,
        tag_filterss: Vec<Vec<TagFilterSpec>>,
    ) -> Self {
        Self {
            min_timestamp,
            max_timestamp,
            tag_filterss,
        }
    }

    /// The query time range, not yet validated against storage.
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new_unchecked(self.min_timestamp, self.max_timestamp)
    }
}

/// An absolute deadline consulted cooperatively along the query path.
///
/// Carries the original timeout and a short label so timeout errors can
/// say which knob produced them. Cheap to clone into worker tasks.
#[derive(Debug, Clone)]
pub struct Deadline {
    deadline: Instant,
    timeout: Duration,
    label: String,
}

impl Deadline {
    /// Create a deadline `timeout` from now, labeled for error messages.
    pub fn new(timeout: Duration, label: impl Into<String>) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            label: label.into(),
        }
    }

    /// Whether the deadline has passed.
    pub fn exceeded(&self) -> bool {
        self.timeout.is_zero() || Instant::now() >= self.deadline
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self.timeout, self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range() {
        let range = TimeRange::new(100, 200).unwrap();
        assert!(range.contains(150));
        assert!(!range.contains(50));
        assert!(!range.contains(250));
        assert!(range.overlaps(190, 300));
        assert!(!range.overlaps(201, 300));

        assert!(TimeRange::new(200, 100).is_err());
    }

    #[test]
    fn test_deadline_zero_timeout_is_exceeded() {
        let deadline = Deadline::new(Duration::ZERO, "test");
        assert!(deadline.exceeded());
    }

    #[test]
    fn test_deadline_not_exceeded() {
        let deadline = Deadline::new(Duration::from_secs(3600), "test");
        assert!(!deadline.exceeded());
        assert!(deadline.to_string().contains("test"));
    }

    #[test]
    fn test_tag_filter_display() {
        let spec = TagFilterSpec {
            key: "host".to_string(),
            value: "web-.*".to_string(),
            is_negative: true,
            is_regexp: true,
        };
        assert_eq!(spec.to_string(), "host!~\"web-.*\"");
    }
}
