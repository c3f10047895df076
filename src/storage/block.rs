//! Stored sample blocks and their codec
//!
//! A block is the storage engine's atomic unit of compressed samples for
//! one series within a sub-range of time. The header carries the row
//! count, the decimal scale, and the time bounds; the timestamp and
//! value columns are marshaled separately as zigzag varint deltas.
//! Values are stored as scaled integers and converted to `f64` on the
//! select path.

use bytes::Bytes;
use std::sync::Arc;

use crate::error::EncodingError;
use crate::storage::encoding::{marshal_deltas, unmarshal_deltas};

/// Maximum number of rows a single stored block may hold.
pub const MAX_ROWS_PER_BLOCK: usize = 8192;

/// Fixed per-block metadata, always available without touching payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockHeader {
    /// Number of samples in the block.
    pub rows: usize,
    /// Power-of-ten exponent applied to stored integer values.
    pub scale: i16,
    /// Smallest timestamp in the block.
    pub min_timestamp: i64,
    /// Largest timestamp in the block.
    pub max_timestamp: i64,
}

/// Immutable stored form of one block: header plus marshaled columns.
#[derive(Debug)]
pub(crate) struct BlockData {
    pub(crate) header: BlockHeader,
    pub(crate) timestamps_data: Bytes,
    pub(crate) values_data: Bytes,
}

impl BlockData {
    /// Marshal a column pair into stored form.
    ///
    /// Timestamps must be non-decreasing and the columns equally long;
    /// ingestion validates this before calling.
    pub(crate) fn new(timestamps: &[i64], values: &[i64], scale: i16) -> Self {
        debug_assert_eq!(timestamps.len(), values.len());
        debug_assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
        let mut ts_buf = Vec::new();
        marshal_deltas(&mut ts_buf, timestamps);
        let mut val_buf = Vec::new();
        marshal_deltas(&mut val_buf, values);
        Self {
            header: BlockHeader {
                rows: timestamps.len(),
                scale,
                min_timestamp: timestamps.first().copied().unwrap_or(0),
                max_timestamp: timestamps.last().copied().unwrap_or(0),
            },
            timestamps_data: Bytes::from(ts_buf),
            values_data: Bytes::from(val_buf),
        }
    }
}

/// Lightweight handle to one stored block.
///
/// Cheap to clone; materializing the payload happens on demand through
/// [`BlockRef::read_block`].
#[derive(Debug, Clone)]
pub struct BlockRef {
    data: Arc<BlockData>,
}

impl BlockRef {
    pub(crate) fn new(data: Arc<BlockData>) -> Self {
        Self { data }
    }

    /// Time bounds from the block header, for range pruning.
    pub(crate) fn header(&self) -> &BlockHeader {
        &self.data.header
    }

    /// Materialize the block into `dst`.
    ///
    /// Always fills the header. Payload references are attached only when
    /// `fetch_data` is set; without them [`Block::unmarshal_data`] has
    /// nothing to decode and the decoded columns stay empty.
    pub(crate) fn read_block(&self, dst: &mut Block, fetch_data: bool) {
        dst.reset();
        dst.header = self.data.header;
        if fetch_data {
            dst.timestamps_data = self.data.timestamps_data.clone();
            dst.values_data = self.data.values_data.clone();
        }
    }
}

/// Reusable decode buffer for one block.
///
/// The decoded columns keep their capacity across uses so pooled blocks
/// stop allocating in steady state.
#[derive(Debug, Default)]
pub struct Block {
    header: BlockHeader,
    timestamps_data: Bytes,
    values_data: Bytes,
    timestamps: Vec<i64>,
    values: Vec<i64>,
}

impl Block {
    /// Clear the block for reuse, keeping column capacity.
    pub fn reset(&mut self) {
        self.header = BlockHeader::default();
        self.timestamps_data = Bytes::new();
        self.values_data = Bytes::new();
        self.timestamps.clear();
        self.values.clear();
    }

    /// Number of samples the block holds, from the header.
    pub fn rows_count(&self) -> usize {
        self.header.rows
    }

    /// Decimal scale applied to stored values.
    pub fn scale(&self) -> i16 {
        self.header.scale
    }

    /// Decode the attached payloads into the timestamp and value columns.
    ///
    /// Errors if either column is truncated, padded, or decodes to a row
    /// count different from the header.
    pub fn unmarshal_data(&mut self) -> Result<(), EncodingError> {
        self.timestamps.clear();
        self.values.clear();
        if self.timestamps_data.is_empty() && self.values_data.is_empty() && self.header.rows == 0 {
            return Ok(());
        }
        unmarshal_deltas(&mut self.timestamps, &self.timestamps_data, self.header.rows)?;
        unmarshal_deltas(&mut self.values, &self.values_data, self.header.rows)?;
        if self.timestamps.len() != self.values.len() {
            return Err(EncodingError::RowCountMismatch {
                expected: self.timestamps.len(),
                got: self.values.len(),
            });
        }
        Ok(())
    }

    /// Decoded timestamps; empty until [`Block::unmarshal_data`] ran.
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    /// Decoded scaled-integer values, same length as the timestamps.
    pub fn values(&self) -> &[i64] {
        &self.values
    }
}

/// Append `values` converted from scaled decimal to `f64`.
///
/// A stored integer `v` with scale `s` represents `v * 10^s`.
pub fn append_decimal_to_float(dst: &mut Vec<f64>, values: &[i64], scale: i16) {
    if scale == 0 {
        dst.extend(values.iter().map(|&v| v as f64));
        return;
    }
    let multiplier = 10f64.powi(i32::from(scale));
    dst.extend(values.iter().map(|&v| v as f64 * multiplier));
}

/// Collapse adjacent samples with equal timestamps, keeping the last
/// value of each run.
///
/// The merge core treats the choice of representative as this function's
/// business; it only relies on one sample surviving per timestamp.
pub fn deduplicate_samples(timestamps: &mut Vec<i64>, values: &mut Vec<f64>) {
    debug_assert_eq!(timestamps.len(), values.len());
    if timestamps.len() < 2 {
        return;
    }
    if timestamps.windows(2).all(|w| w[0] < w[1]) {
        // Common case: no duplicates.
        return;
    }
    let mut k = 0usize;
    for i in 1..timestamps.len() {
        if timestamps[i] == timestamps[k] {
            values[k] = values[i];
        } else {
            k += 1;
            timestamps[k] = timestamps[i];
            values[k] = values[i];
        }
    }
    timestamps.truncate(k + 1);
    values.truncate(k + 1);
}
