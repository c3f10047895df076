//! tsdb-select - Parallel select data-plane for a time-series database
//!
//! Given a structured selector (tag filters plus a time range), this
//! crate locates all matching series, decodes their compressed sample
//! blocks in parallel, merges each series into one strictly time-ordered
//! stream, deduplicates coincident samples, and delivers every series to
//! a user callback running on a worker pool:
//!
//! - Two worker pools sized to the logical CPU count, fed through
//!   bounded channels with backpressure
//! - K-way heap merge with batched emission
//! - Pooled decode buffers with a size-bounded reset policy
//! - Cooperative deadline propagation and first-error short-circuit

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod query;
pub mod storage;
pub mod types;

// Re-export main types
pub use config::SearchConfig;
pub use error::{DecodeError, QueryError, StorageError};
pub use query::{QueryResults, SelectEngine, SeriesResult};
pub use storage::{MetricName, Storage, Tag, TagEntry, TsdbStatus};
pub use types::{Deadline, SearchQuery, TagFilterSpec, TimeRange};
