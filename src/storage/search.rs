//! Storage search cursor
//!
//! A `Search` resolves tag filters to series under the unique-series cap
//! and then streams one `(metric name, block ref)` pair per stored block.
//! Failures are deferred: the stream simply ends and the caller asks
//! [`Search::take_error`] afterwards, so a drain loop stays a plain
//! `while let`.

use bytes::Bytes;
use tracing::trace;

use crate::error::StorageError;
use crate::storage::block::BlockRef;
use crate::storage::filters::TagFilters;
use crate::storage::Storage;
use crate::types::{Deadline, TimeRange};

/// One streamed search result: the series identity plus one of its blocks.
#[derive(Debug, Clone)]
pub struct MetricBlockRef {
    /// Marshaled metric name of the owning series.
    pub metric_name: Bytes,
    /// Handle to one stored block of that series.
    pub block_ref: BlockRef,
}

/// Pooled search state over the storage engine.
///
/// Lifecycle: [`Search::init`], then drain [`Search::next_metric_block`],
/// then [`Search::take_error`]; [`Search::close`] before returning the
/// value to its pool.
#[derive(Debug, Default)]
pub struct Search {
    entries: Vec<MetricBlockRef>,
    cursor: usize,
    deadline: Option<Deadline>,
    err: Option<StorageError>,
}

impl Search {
    /// Initialize the search and snapshot matching blocks.
    ///
    /// Returns an upper bound on the number of unique series the drain
    /// will yield, usable for presizing containers. Errors (series cap
    /// breach, expired deadline) are deferred to [`Search::take_error`].
    pub fn init(
        &mut self,
        storage: &Storage,
        tfss: &[TagFilters],
        tr: TimeRange,
        max_metrics: usize,
        deadline: Deadline,
    ) -> usize {
        self.close();
        match storage.snapshot_search(tfss, tr, max_metrics, &deadline) {
            Ok(snapshot) => {
                let series_count = snapshot.len();
                for (metric_name, blocks) in snapshot {
                    for block_ref in blocks {
                        self.entries.push(MetricBlockRef {
                            metric_name: metric_name.clone(),
                            block_ref,
                        });
                    }
                }
                trace!(
                    series = series_count,
                    blocks = self.entries.len(),
                    "search initialized"
                );
                self.deadline = Some(deadline);
                series_count
            }
            Err(err) => {
                self.err = Some(err);
                0
            }
        }
    }

    /// Next `(metric name, block ref)` pair, or `None` when the stream is
    /// exhausted or failed. Checks the deadline on every call.
    pub fn next_metric_block(&mut self) -> Option<MetricBlockRef> {
        if self.err.is_some() || self.cursor >= self.entries.len() {
            return None;
        }
        if let Some(deadline) = &self.deadline {
            if deadline.exceeded() {
                self.err = Some(StorageError::DeadlineExceeded);
                return None;
            }
        }
        let mbr = self.entries[self.cursor].clone();
        self.cursor += 1;
        Some(mbr)
    }

    /// Take the deferred error, if the stream ended on one.
    pub fn take_error(&mut self) -> Option<StorageError> {
        self.err.take()
    }

    /// Release snapshot references and clear state for pooling.
    pub fn close(&mut self) {
        self.entries.clear();
        self.cursor = 0;
        self.deadline = None;
        self.err = None;
    }
}
