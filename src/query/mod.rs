//! Query core: the parallel unpack-and-merge pipeline
//!
//! Data flow for one search query:
//!
//! ```text
//! SearchQuery
//!      │
//!      ▼
//! ┌──────────────┐
//! │ Query driver │  Resolve filters, drain storage, group blocks per series
//! └──────┬───────┘
//!        │ QueryResults (one PackedSeries per metric name)
//!        ▼
//! ┌──────────────┐
//! │ Series pool  │  One worker per CPU, reusable per-worker result
//! └──────┬───────┘
//!        │ UnpackWork batches
//!        ▼
//! ┌──────────────┐
//! │ Unpack pool  │  One worker per CPU, decodes and clips blocks
//! └──────┬───────┘
//!        │ SortBlocks
//!        ▼
//! ┌──────────────┐
//! │ Merge + dedup│  K-way heap merge, then adjacent-sample dedup
//! └──────┬───────┘
//!        │
//!        ▼
//!   user callback (&SeriesResult, worker_id)
//! ```
//!
//! Both pools are fed through bounded channels; producers block when a
//! queue is full. Cancellation is cooperative: the deadline is checked
//! per drained storage block and at series-task start, never mid-decode
//! or mid-merge.

pub mod engine;
mod merge;
mod pool;
pub mod results;
mod sort_block;
mod unpack;

// Re-export main types
pub use engine::SelectEngine;
pub use results::{QueryResults, SeriesResult};
