//! K-way merge of decoded sort blocks
//!
//! Produces one time-ordered stream over the union of the inputs, then
//! collapses coincident samples. The heap is keyed on each block's next
//! undelivered timestamp; instead of popping one sample at a time, the
//! loop drains the longest prefix of the top block that keeps ordering
//! against the next block's head, which amortizes heap traffic when
//! blocks barely overlap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::metrics;
use crate::query::results::SeriesResult;
use crate::query::sort_block::{put_sort_block, SortBlock};
use crate::storage::block::deduplicate_samples;

/// Reverse-ordered heap entry so `BinaryHeap` behaves as a min-heap on
/// the head timestamp.
struct MergeEntry(SortBlock);

impl MergeEntry {
    fn head_timestamp(&self) -> i64 {
        self.0.timestamps[self.0.next_idx]
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.head_timestamp() == other.head_timestamp()
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.head_timestamp().cmp(&self.head_timestamp())
    }
}

/// Merge `sbs` into `dst` in timestamp order, then deduplicate.
///
/// Empty blocks are filtered out up front; every block is returned to
/// the sort-block pool once drained. Ties between blocks are broken
/// arbitrarily and left to the dedup pass.
pub(crate) fn merge_sort_blocks(dst: &mut SeriesResult, sbs: Vec<SortBlock>) {
    let mut heap = BinaryHeap::with_capacity(sbs.len());
    for sb in sbs {
        if sb.timestamps.is_empty() {
            put_sort_block(sb);
            continue;
        }
        heap.push(MergeEntry(sb));
    }
    if heap.is_empty() {
        return;
    }

    while let Some(MergeEntry(mut top)) = heap.pop() {
        let next_ts = match heap.peek() {
            None => {
                // Last block standing: flush its remainder.
                dst.timestamps
                    .extend_from_slice(&top.timestamps[top.next_idx..]);
                dst.values.extend_from_slice(&top.values[top.next_idx..]);
                put_sort_block(top);
                break;
            }
            Some(next) => next.head_timestamp(),
        };

        let len = top.timestamps.len();
        let mut idx_next = len;
        if top.timestamps[len - 1] > next_ts {
            idx_next = top.next_idx;
            while top.timestamps[idx_next] <= next_ts {
                idx_next += 1;
            }
        }
        dst.timestamps
            .extend_from_slice(&top.timestamps[top.next_idx..idx_next]);
        dst.values
            .extend_from_slice(&top.values[top.next_idx..idx_next]);
        if idx_next < len {
            top.next_idx = idx_next;
            heap.push(MergeEntry(top));
        } else {
            put_sort_block(top);
        }
    }

    let before = dst.timestamps.len();
    deduplicate_samples(&mut dst.timestamps, &mut dst.values);
    metrics::record_deduplicated_samples(before - dst.timestamps.len());
}
