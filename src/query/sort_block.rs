//! Decoded, range-clipped view of one storage block
//!
//! A `SortBlock` is what the merge engine consumes: decoded timestamps
//! and float values restricted to the query range, plus the merge
//! cursor. Instances are pooled; the internal block decode buffer and
//! both columns keep their capacity across uses.

use crate::error::DecodeError;
use crate::metrics;
use crate::query::pool::Pool;
use crate::storage::block::{append_decimal_to_float, Block, BlockRef};
use crate::types::TimeRange;

static SORT_BLOCK_POOL: Pool<SortBlock> = Pool::new(1024);

/// Take a pooled sort block.
pub(crate) fn get_sort_block() -> SortBlock {
    SORT_BLOCK_POOL.get_or_else(SortBlock::default)
}

/// Reset and return a sort block to the pool.
pub(crate) fn put_sort_block(mut sb: SortBlock) {
    sb.reset();
    SORT_BLOCK_POOL.put(sb);
}

/// One block's worth of decoded samples, clipped to the query range.
///
/// Invariants once unpacked: both columns are equally long, timestamps
/// are non-decreasing, and every entry lies inside the range passed to
/// [`SortBlock::unpack_from`].
#[derive(Debug, Default)]
pub(crate) struct SortBlock {
    /// Scratch decode buffer, reused across unpacks.
    block: Block,

    /// Clipped timestamps.
    pub(crate) timestamps: Vec<i64>,

    /// Values converted from scaled decimal, parallel to `timestamps`.
    pub(crate) values: Vec<f64>,

    /// Merge cursor: index of the next undelivered sample.
    pub(crate) next_idx: usize,
}

impl SortBlock {
    /// Clear for reuse, keeping capacity.
    pub(crate) fn reset(&mut self) {
        self.block.reset();
        self.timestamps.clear();
        self.values.clear();
        self.next_idx = 0;
    }

    /// Materialize `br` and append its samples within `tr`.
    ///
    /// Without `fetch_data` only the header is read, so the block
    /// contributes no samples and the whole row count lands on the
    /// skipped counter.
    pub(crate) fn unpack_from(
        &mut self,
        br: &BlockRef,
        tr: TimeRange,
        fetch_data: bool,
    ) -> Result<(), DecodeError> {
        br.read_block(&mut self.block, fetch_data);
        if fetch_data {
            self.block.unmarshal_data()?;
        }
        let timestamps = self.block.timestamps();

        // Timestamps are non-decreasing, so the in-range sub-slice is a
        // single window found by two linear scans.
        let mut i = 0;
        while i < timestamps.len() && timestamps[i] < tr.min_timestamp {
            i += 1;
        }
        let mut j = timestamps.len();
        while j > i && timestamps[j - 1] > tr.max_timestamp {
            j -= 1;
        }
        metrics::record_skipped_rows(self.block.rows_count() - (j - i));

        if i == j {
            return Ok(());
        }
        self.timestamps.extend_from_slice(&timestamps[i..j]);
        append_decimal_to_float(&mut self.values, &self.block.values()[i..j], self.block.scale());
        Ok(())
    }
}
