//! Error types for the select data-plane

use thiserror::Error;

/// Main error type returned by query operations.
///
/// Callers translate `Timeout` differently from the other variants
/// (a saturated deadline maps to a retryable status), so it is kept
/// distinguishable from storage-level search failures.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The query deadline was exceeded.
    #[error("timeout exceeded: {0}")]
    Timeout(String),

    /// A tag filter could not be parsed into a matcher.
    #[error("cannot parse tag filter: {0}")]
    FilterParse(String),

    /// The requested time range was rejected by storage.
    #[error("invalid time range [{min}, {max}]: {reason}")]
    TimeRangeInvalid {
        /// Requested minimum timestamp, milliseconds since epoch.
        min: i64,
        /// Requested maximum timestamp, milliseconds since epoch.
        max: i64,
        /// Why storage rejected the range.
        reason: String,
    },

    /// Storage-level search failure other than a deadline breach.
    #[error("search error after reading {blocks_read} data blocks: {source}")]
    Search {
        /// Number of blocks drained from storage before the failure.
        blocks_read: u64,
        /// The underlying storage error.
        #[source]
        source: StorageError,
    },

    /// A per-series decode failure.
    #[error("error during time series unpacking: {0}")]
    Decode(#[from] DecodeError),

    /// Internal invariant violation, e.g. a worker pool that went away.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Decode failures scoped to a single series.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The marshaled metric name of one series could not be parsed.
    #[error("cannot unmarshal metric name {name:?}: {source}")]
    MetricName {
        /// A short prefix of the offending bytes.
        name: Vec<u8>,
        /// The underlying framing error.
        #[source]
        source: EncodingError,
    },

    /// A block payload failed codec-level decoding.
    #[error("cannot unmarshal block: {0}")]
    Codec(#[from] EncodingError),
}

/// Errors produced by the storage engine boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The deadline passed to the storage search expired mid-scan.
    #[error("storage deadline exceeded")]
    DeadlineExceeded,

    /// The search matched more unique series than the configured cap.
    #[error("the number of matching unique timeseries exceeds {limit}")]
    TooManySeries {
        /// The configured `max_unique_timeseries` cap.
        limit: usize,
    },

    /// The time range is malformed or outside retention.
    #[error("invalid time range [{min}, {max}]: {reason}")]
    InvalidTimeRange {
        /// Minimum timestamp of the rejected range.
        min: i64,
        /// Maximum timestamp of the rejected range.
        max: i64,
        /// Why the range was rejected.
        reason: String,
    },

    /// Rows handed to ingestion were malformed.
    #[error("invalid samples: {0}")]
    InvalidSamples(String),
}

/// Low-level framing and varint errors shared by the block codec and the
/// metric-name wire format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Input ended in the middle of a value.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A varint ran past 10 bytes.
    #[error("varint overflows 64 bits")]
    VarintOverflow,

    /// Payload decoded to a different row count than the header promised.
    #[error("row count mismatch: expected {expected}, got {got}")]
    RowCountMismatch {
        /// Rows promised by the block header.
        expected: usize,
        /// Rows actually decoded.
        got: usize,
    },

    /// Bytes were left over after decoding the promised row count.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
}

/// Result type alias for query operations.
pub type Result<T> = std::result::Result<T, QueryError>;
