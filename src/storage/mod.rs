//! Storage engine boundary for the select data-plane
//!
//! This module holds everything the query core consumes from storage: the
//! block codec, metric names, compiled tag filters, the pooled search
//! cursor, and an in-memory columnar engine backing the label discovery
//! and admin endpoints.
//!
//! # Key Components
//!
//! - **`Storage`**: in-memory engine keyed by marshaled metric name
//! - **`Search`**: pooled cursor streaming `(metric name, block ref)` pairs
//! - **`Block` / `BlockRef`**: stored blocks and their decode buffers
//! - **`MetricName`**: series identity and its wire format
//! - **`TagFilters`**: compiled AND-groups of tag matchers

pub mod block;
pub(crate) mod encoding;
pub mod filters;
pub mod metric_name;
pub mod search;

pub use block::{append_decimal_to_float, deduplicate_samples, Block, BlockRef};
pub use filters::{setup_tfss, TagFilters};
pub use metric_name::{MetricName, Tag};
pub use search::{MetricBlockRef, Search};

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::StorageError;
use crate::storage::block::{BlockData, MAX_ROWS_PER_BLOCK};
use crate::types::{Deadline, TimeRange};

/// One label name together with the values seen for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    /// Label name.
    pub key: String,
    /// Distinct values recorded for the label.
    pub values: Vec<String>,
}

/// One `(name, count)` row of a cardinality ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopEntry {
    /// Metric name, label name, or `label=value` pair.
    pub name: String,
    /// Number of series (or values) accounted to `name`.
    pub count: u64,
}

/// Cardinality statistics for one day of data.
#[derive(Debug, Clone, Default)]
pub struct TsdbStatus {
    /// Series per metric name, highest first.
    pub series_count_by_metric_name: Vec<TopEntry>,
    /// Distinct values per label name, highest first.
    pub label_value_count_by_label_name: Vec<TopEntry>,
    /// Series per `label=value` pair, highest first.
    pub series_count_by_label_value_pair: Vec<TopEntry>,
}

struct SeriesEntry {
    metric_name: MetricName,
    blocks: Vec<BlockRef>,
}

#[derive(Default)]
struct StorageInner {
    /// Marshaled names in first-insert order, for deterministic scans.
    order: Vec<Bytes>,
    series: HashMap<Bytes, SeriesEntry>,
}

/// In-memory storage engine.
///
/// Series are keyed by the marshaled sorted metric name; each series owns
/// an append-only list of immutable blocks.
pub struct Storage {
    inner: RwLock<StorageInner>,
    retention: TimeRange,
}

impl Storage {
    /// Create an empty storage with unbounded retention.
    pub fn new() -> Self {
        Self::with_retention(TimeRange::default())
    }

    /// Create an empty storage that rejects queries outside `retention`.
    pub fn with_retention(retention: TimeRange) -> Self {
        Self {
            inner: RwLock::new(StorageInner::default()),
            retention,
        }
    }

    /// Append samples for one series.
    ///
    /// Values are scaled decimals: a stored `v` with scale `s` represents
    /// `v * 10^s`. Timestamps must be non-decreasing within the call;
    /// rows are split into blocks of at most [`MAX_ROWS_PER_BLOCK`].
    pub fn add_samples(
        &self,
        mn: &MetricName,
        timestamps: &[i64],
        values: &[i64],
        scale: i16,
    ) -> Result<(), StorageError> {
        if timestamps.len() != values.len() {
            return Err(StorageError::InvalidSamples(format!(
                "column length mismatch: {} timestamps, {} values",
                timestamps.len(),
                values.len()
            )));
        }
        if timestamps.is_empty() {
            return Ok(());
        }
        if timestamps.windows(2).any(|w| w[0] > w[1]) {
            return Err(StorageError::InvalidSamples(
                "timestamps must be non-decreasing".to_string(),
            ));
        }

        let sorted = mn.sorted();
        let key = Bytes::from(sorted.marshaled());
        let mut guard = self.inner.write();
        let StorageInner { order, series } = &mut *guard;
        let entry = series.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            SeriesEntry {
                metric_name: sorted,
                blocks: Vec::new(),
            }
        });
        for (ts_chunk, val_chunk) in timestamps
            .chunks(MAX_ROWS_PER_BLOCK)
            .zip(values.chunks(MAX_ROWS_PER_BLOCK))
        {
            entry
                .blocks
                .push(BlockRef::new(Arc::new(BlockData::new(
                    ts_chunk, val_chunk, scale,
                ))));
        }
        Ok(())
    }

    /// Validate a query time range against retention.
    pub fn check_time_range(&self, tr: TimeRange) -> Result<(), StorageError> {
        if tr.min_timestamp > tr.max_timestamp {
            return Err(StorageError::InvalidTimeRange {
                min: tr.min_timestamp,
                max: tr.max_timestamp,
                reason: "min timestamp exceeds max timestamp".to_string(),
            });
        }
        if tr.max_timestamp < self.retention.min_timestamp
            || tr.min_timestamp > self.retention.max_timestamp
        {
            return Err(StorageError::InvalidTimeRange {
                min: tr.min_timestamp,
                max: tr.max_timestamp,
                reason: format!("outside configured retention {}", self.retention),
            });
        }
        Ok(())
    }

    /// Number of unique series stored.
    pub fn series_count(&self) -> u64 {
        self.inner.read().order.len() as u64
    }

    /// Delete series matching any of the compiled filter groups, returning
    /// how many were removed.
    pub fn delete_series(&self, tfss: &[TagFilters]) -> usize {
        let mut inner = self.inner.write();
        let doomed: Vec<Bytes> = inner
            .order
            .iter()
            .filter(|key| {
                inner
                    .series
                    .get(*key)
                    .is_some_and(|e| filters::matches_any(tfss, &e.metric_name))
            })
            .cloned()
            .collect();
        for key in &doomed {
            inner.series.remove(key);
        }
        inner.order.retain(|key| !doomed.contains(key));
        debug!(deleted = doomed.len(), "deleted series");
        doomed.len()
    }

    /// Distinct label names across all series.
    ///
    /// The metric name itself is reported under the empty key, to be
    /// mapped by the caller. Results are sorted and capped at `max`.
    pub fn search_tag_keys(
        &self,
        max: usize,
        deadline: &Deadline,
    ) -> Result<Vec<String>, StorageError> {
        if deadline.exceeded() {
            return Err(StorageError::DeadlineExceeded);
        }
        let inner = self.inner.read();
        let mut keys = BTreeSet::new();
        for entry in inner.series.values() {
            if !entry.metric_name.metric_group.is_empty() {
                keys.insert(String::new());
            }
            for tag in &entry.metric_name.tags {
                keys.insert(tag.key.clone());
            }
        }
        Ok(keys.into_iter().take(max).collect())
    }

    /// Distinct values for one label name, sorted and capped at `max`.
    /// The empty key addresses metric names.
    pub fn search_tag_values(
        &self,
        key: &str,
        max: usize,
        deadline: &Deadline,
    ) -> Result<Vec<String>, StorageError> {
        if deadline.exceeded() {
            return Err(StorageError::DeadlineExceeded);
        }
        let inner = self.inner.read();
        let mut values = BTreeSet::new();
        for entry in inner.series.values() {
            if let Some(v) = entry.metric_name.tag_value(key) {
                values.insert(v.to_string());
            }
        }
        Ok(values.into_iter().take(max).collect())
    }

    /// Distinct suffixes of values for `key` that start with `prefix`,
    /// within series that have data in `tr`.
    ///
    /// A suffix containing `delim` is cut just past the first delimiter,
    /// so hierarchical names can be walked one level at a time.
    pub fn search_tag_value_suffixes(
        &self,
        tr: TimeRange,
        key: &str,
        prefix: &str,
        delim: u8,
        max: usize,
        deadline: &Deadline,
    ) -> Result<Vec<String>, StorageError> {
        if deadline.exceeded() {
            return Err(StorageError::DeadlineExceeded);
        }
        let inner = self.inner.read();
        let mut suffixes = BTreeSet::new();
        for entry in inner.series.values() {
            if !series_overlaps(entry, tr) {
                continue;
            }
            let Some(value) = entry.metric_name.tag_value(key) else {
                continue;
            };
            let Some(suffix) = value.strip_prefix(prefix) else {
                continue;
            };
            let cut = match suffix.bytes().position(|b| b == delim) {
                Some(i) => &suffix[..=i],
                None => suffix,
            };
            suffixes.insert(cut.to_string());
        }
        Ok(suffixes.into_iter().take(max).collect())
    }

    /// All label entries: every label name with its distinct values.
    /// Values per entry are capped at `max_values`, entries at `max_keys`.
    pub fn search_tag_entries(
        &self,
        max_keys: usize,
        max_values: usize,
        deadline: &Deadline,
    ) -> Result<Vec<TagEntry>, StorageError> {
        if deadline.exceeded() {
            return Err(StorageError::DeadlineExceeded);
        }
        let inner = self.inner.read();
        let mut by_key: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for entry in inner.series.values() {
            if !entry.metric_name.metric_group.is_empty() {
                by_key
                    .entry(String::new())
                    .or_default()
                    .insert(entry.metric_name.metric_group.clone());
            }
            for tag in &entry.metric_name.tags {
                by_key
                    .entry(tag.key.clone())
                    .or_default()
                    .insert(tag.value.clone());
            }
        }
        Ok(by_key
            .into_iter()
            .take(max_keys)
            .map(|(key, values)| TagEntry {
                key,
                values: values.into_iter().take(max_values).collect(),
            })
            .collect())
    }

    /// Cardinality statistics for the day `date` (days since epoch).
    pub fn tsdb_status_for_date(
        &self,
        date: u64,
        top_n: usize,
        deadline: &Deadline,
    ) -> Result<TsdbStatus, StorageError> {
        if deadline.exceeded() {
            return Err(StorageError::DeadlineExceeded);
        }
        let day_ms = 86_400_000i64;
        let day = TimeRange::new_unchecked(
            date as i64 * day_ms,
            (date as i64 + 1) * day_ms - 1,
        );
        let inner = self.inner.read();
        let mut by_metric: BTreeMap<String, u64> = BTreeMap::new();
        let mut values_by_label: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut by_pair: BTreeMap<String, u64> = BTreeMap::new();
        for entry in inner.series.values() {
            if !series_overlaps(entry, day) {
                continue;
            }
            *by_metric
                .entry(entry.metric_name.metric_group.clone())
                .or_default() += 1;
            for tag in &entry.metric_name.tags {
                values_by_label
                    .entry(tag.key.clone())
                    .or_default()
                    .insert(tag.value.clone());
                *by_pair
                    .entry(format!("{}={}", tag.key, tag.value))
                    .or_default() += 1;
            }
        }
        Ok(TsdbStatus {
            series_count_by_metric_name: top_entries(by_metric, top_n),
            label_value_count_by_label_name: top_entries(
                values_by_label
                    .into_iter()
                    .map(|(k, v)| (k, v.len() as u64))
                    .collect(),
                top_n,
            ),
            series_count_by_label_value_pair: top_entries(by_pair, top_n),
        })
    }

    /// Snapshot `(marshaled name, block refs)` for every series matching
    /// the filters with at least one block overlapping `tr`.
    ///
    /// Errors when more than `max_metrics` unique series match, or when
    /// the deadline expires mid-scan.
    pub(crate) fn snapshot_search(
        &self,
        tfss: &[TagFilters],
        tr: TimeRange,
        max_metrics: usize,
        deadline: &Deadline,
    ) -> Result<Vec<(Bytes, Vec<BlockRef>)>, StorageError> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for key in &inner.order {
            if deadline.exceeded() {
                return Err(StorageError::DeadlineExceeded);
            }
            let Some(entry) = inner.series.get(key) else {
                continue;
            };
            if !filters::matches_any(tfss, &entry.metric_name) {
                continue;
            }
            let blocks: Vec<BlockRef> = entry
                .blocks
                .iter()
                .filter(|br| {
                    let h = br.header();
                    tr.overlaps(h.min_timestamp, h.max_timestamp)
                })
                .cloned()
                .collect();
            if blocks.is_empty() {
                continue;
            }
            if out.len() >= max_metrics {
                return Err(StorageError::TooManySeries { limit: max_metrics });
            }
            out.push((key.clone(), blocks));
        }
        Ok(out)
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

fn series_overlaps(entry: &SeriesEntry, tr: TimeRange) -> bool {
    entry.blocks.iter().any(|br| {
        let h = br.header();
        tr.overlaps(h.min_timestamp, h.max_timestamp)
    })
}

fn top_entries(counts: BTreeMap<String, u64>, top_n: usize) -> Vec<TopEntry> {
    let mut entries: Vec<TopEntry> = counts
        .into_iter()
        .map(|(name, count)| TopEntry { name, count })
        .collect();
    // BTreeMap iteration gives ascending names, so equal counts stay
    // name-ordered after the stable sort.
    entries.sort_by(|a, b| b.count.cmp(&a.count));
    entries.truncate(top_n);
    entries
}
