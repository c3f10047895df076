//! Query driver and public surface of the select data-plane
//!
//! `SelectEngine` owns the storage handle and both worker pools. The
//! driver resolves a search query into a [`QueryResults`] handle holding
//! one packed series per matched metric name; label discovery and admin
//! operations pass through to storage behind the same deadline checks.

use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::SearchConfig;
use crate::error::{QueryError, StorageError};
use crate::metrics::InflightQueryGuard;
use crate::query::pool::Pool;
use crate::query::results::{QueryResults, SeriesPool};
use crate::query::unpack::{PackedSeries, UnpackPool};
use crate::storage::block::BlockRef;
use crate::storage::filters::setup_tfss;
use crate::storage::{Search, Storage, TagEntry, TsdbStatus};
use crate::types::{Deadline, SearchQuery, TimeRange};

static SEARCH_POOL: Pool<Search> = Pool::new(16);

fn get_storage_search() -> Search {
    SEARCH_POOL.get_or_else(Search::default)
}

/// Close a search and return it to the pool.
pub(crate) fn put_storage_search(mut search: Search) {
    search.close();
    SEARCH_POOL.put(search);
}

/// The select data-plane: storage handle, worker pools, and limits.
///
/// Workers are spawned once per engine, one per logical CPU for each of
/// the two stages, and run until the engine and every outstanding
/// [`QueryResults`] handle is dropped.
pub struct SelectEngine {
    storage: Arc<Storage>,
    config: SearchConfig,
    series_pool: SeriesPool,
}

impl SelectEngine {
    /// Create an engine with default limits. Must be called within a
    /// Tokio runtime; worker tasks are spawned here.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self::with_config(storage, SearchConfig::default())
    }

    /// Create an engine with explicit limits.
    pub fn with_config(storage: Arc<Storage>, config: SearchConfig) -> Self {
        let workers = num_cpus::get().max(1);
        let unpack_pool = UnpackPool::start(workers);
        let series_pool = SeriesPool::start(workers, unpack_pool);
        info!(workers, "select engine started");
        Self {
            storage,
            config,
            series_pool,
        }
    }

    /// The storage handle this engine searches.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Resolve `sq` to a [`QueryResults`] handle.
    ///
    /// One of [`QueryResults::run_parallel`] or [`QueryResults::cancel`]
    /// must consume the returned handle. With `fetch_data` unset only
    /// block headers are touched, which answers "which series exist"
    /// queries without decoding payloads.
    pub fn process_search_query(
        &self,
        sq: &SearchQuery,
        fetch_data: bool,
        deadline: Deadline,
    ) -> Result<QueryResults, QueryError> {
        if deadline.exceeded() {
            return Err(QueryError::Timeout(format!(
                "before starting the query processing: {deadline}"
            )));
        }
        let tfss = setup_tfss(&sq.tag_filterss)?;
        let tr = sq.time_range();
        self.storage.check_time_range(tr).map_err(|err| match err {
            StorageError::InvalidTimeRange { min, max, reason } => {
                QueryError::TimeRangeInvalid { min, max, reason }
            }
            other => QueryError::Search {
                blocks_read: 0,
                source: other,
            },
        })?;

        let _inflight = InflightQueryGuard::enter();

        let mut search = get_storage_search();
        let max_series = search.init(
            &self.storage,
            &tfss,
            tr,
            self.config.max_unique_timeseries,
            deadline.clone(),
        );

        // Block streams for one metric may interleave with another, so
        // group defensively while keeping first-occurrence order.
        let mut groups: HashMap<Bytes, Vec<BlockRef>> = HashMap::with_capacity(max_series);
        let mut order: Vec<Bytes> = Vec::with_capacity(max_series);
        let mut blocks_read: u64 = 0;
        while let Some(mbr) = search.next_metric_block() {
            blocks_read += 1;
            if deadline.exceeded() {
                put_storage_search(search);
                return Err(QueryError::Timeout(format!(
                    "while fetching data block #{blocks_read} from storage: {deadline}"
                )));
            }
            match groups.entry(mbr.metric_name.clone()) {
                Entry::Occupied(mut entry) => entry.get_mut().push(mbr.block_ref),
                Entry::Vacant(entry) => {
                    order.push(mbr.metric_name.clone());
                    entry.insert(vec![mbr.block_ref]);
                }
            }
        }
        if let Some(err) = search.take_error() {
            put_storage_search(search);
            return Err(match err {
                StorageError::DeadlineExceeded => {
                    QueryError::Timeout(format!("during the query: {deadline}"))
                }
                other => QueryError::Search {
                    blocks_read,
                    source: other,
                },
            });
        }

        let packed: Vec<PackedSeries> = order
            .into_iter()
            .map(|name| {
                let block_refs = groups.remove(&name).unwrap_or_default();
                PackedSeries::new(name, block_refs)
            })
            .collect();
        debug!(
            series = packed.len(),
            blocks = blocks_read,
            "search query processed"
        );
        Ok(QueryResults {
            tr,
            fetch_data,
            deadline,
            packed,
            search,
            series_tx: self.series_pool.sender(),
        })
    }

    /// All label names, sorted. The metric name is reported as
    /// `__name__`.
    pub fn get_labels(&self, deadline: Deadline) -> Result<Vec<String>, QueryError> {
        if deadline.exceeded() {
            return Err(timeout_before_start(&deadline));
        }
        let mut labels = self
            .storage
            .search_tag_keys(self.config.max_tag_keys, &deadline)
            .map_err(|err| map_storage_error(err, &deadline))?;
        for label in labels.iter_mut() {
            if label.is_empty() {
                *label = "__name__".to_string();
            }
        }
        labels.sort();
        Ok(labels)
    }

    /// All values of one label, sorted. `__name__` addresses metric
    /// names.
    pub fn get_label_values(
        &self,
        label_name: &str,
        deadline: Deadline,
    ) -> Result<Vec<String>, QueryError> {
        if deadline.exceeded() {
            return Err(timeout_before_start(&deadline));
        }
        let lookup = if label_name == "__name__" {
            ""
        } else {
            label_name
        };
        let mut values = self
            .storage
            .search_tag_values(lookup, self.config.max_tag_values, &deadline)
            .map_err(|err| map_storage_error(err, &deadline))?;
        values.sort();
        Ok(values)
    }

    /// Suffixes of values for `tag_key` starting with `tag_value_prefix`,
    /// cut at `delimiter`, within `tr`.
    pub fn get_tag_value_suffixes(
        &self,
        tr: TimeRange,
        tag_key: &str,
        tag_value_prefix: &str,
        delimiter: u8,
        deadline: Deadline,
    ) -> Result<Vec<String>, QueryError> {
        if deadline.exceeded() {
            return Err(timeout_before_start(&deadline));
        }
        self.storage
            .search_tag_value_suffixes(
                tr,
                tag_key,
                tag_value_prefix,
                delimiter,
                self.config.max_tag_value_suffixes,
                &deadline,
            )
            .map_err(|err| map_storage_error(err, &deadline))
    }

    /// Every label with its values, largest value sets first and ties
    /// broken by descending key. The metric name is reported as
    /// `__name__`.
    pub fn get_label_entries(&self, deadline: Deadline) -> Result<Vec<TagEntry>, QueryError> {
        if deadline.exceeded() {
            return Err(timeout_before_start(&deadline));
        }
        let mut entries = self
            .storage
            .search_tag_entries(self.config.max_tag_keys, self.config.max_tag_values, &deadline)
            .map_err(|err| map_storage_error(err, &deadline))?;
        for entry in entries.iter_mut() {
            if entry.key.is_empty() {
                entry.key = "__name__".to_string();
            }
        }
        entries.sort_by(|a, b| {
            b.values
                .len()
                .cmp(&a.values.len())
                .then_with(|| b.key.cmp(&a.key))
        });
        Ok(entries)
    }

    /// Cardinality statistics for `date` (days since epoch).
    pub fn get_tsdb_status_for_date(
        &self,
        deadline: Deadline,
        date: u64,
        top_n: usize,
    ) -> Result<TsdbStatus, QueryError> {
        if deadline.exceeded() {
            return Err(timeout_before_start(&deadline));
        }
        self.storage
            .tsdb_status_for_date(date, top_n, &deadline)
            .map_err(|err| map_storage_error(err, &deadline))
    }

    /// Number of unique series stored.
    pub fn get_series_count(&self, deadline: Deadline) -> Result<u64, QueryError> {
        if deadline.exceeded() {
            return Err(timeout_before_start(&deadline));
        }
        Ok(self.storage.series_count())
    }

    /// Delete every series matching `sq`'s filters, returning how many
    /// were removed.
    pub fn delete_series(&self, sq: &SearchQuery) -> Result<usize, QueryError> {
        let tfss = setup_tfss(&sq.tag_filterss)?;
        Ok(self.storage.delete_series(&tfss))
    }
}

fn timeout_before_start(deadline: &Deadline) -> QueryError {
    QueryError::Timeout(format!(
        "before starting the query processing: {deadline}"
    ))
}

fn map_storage_error(err: StorageError, deadline: &Deadline) -> QueryError {
    match err {
        StorageError::DeadlineExceeded => {
            QueryError::Timeout(format!("during the query: {deadline}"))
        }
        other => QueryError::Search {
            blocks_read: 0,
            source: other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MetricName;
    use crate::types::TagFilterSpec;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::new(Duration::from_secs(30), "test query")
    }

    fn mn(group: &str, tags: &[(&str, &str)]) -> MetricName {
        let mut mn = MetricName::new(group);
        for (k, v) in tags {
            mn.add_tag(*k, *v);
        }
        mn
    }

    fn match_all(min_timestamp: i64, max_timestamp: i64) -> SearchQuery {
        SearchQuery::new(min_timestamp, max_timestamp, vec![])
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_series_two_overlapping_blocks() {
        let storage = Arc::new(Storage::new());
        let name = mn("m", &[]);
        storage.add_samples(&name, &[10, 20, 30], &[1, 2, 3], 0).unwrap();
        storage
            .add_samples(&name, &[15, 25, 35], &[10, 20, 30], 0)
            .unwrap();
        let engine = SelectEngine::new(storage);

        let results = engine
            .process_search_query(&match_all(0, 100), true, deadline())
            .unwrap();
        assert_eq!(results.len(), 1);

        let collected: Arc<Mutex<Vec<(Vec<i64>, Vec<f64>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        results
            .run_parallel(move |rs, _worker_id| {
                sink.lock().push((rs.timestamps.clone(), rs.values.clone()));
            })
            .await
            .unwrap();

        let collected = collected.lock();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].0, vec![10, 15, 20, 25, 30, 35]);
        assert_eq!(collected[0].1, vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_clipping_to_query_range() {
        let storage = Arc::new(Storage::new());
        let name = mn("m", &[]);
        storage.add_samples(&name, &[10, 20, 30], &[1, 2, 3], 0).unwrap();
        storage
            .add_samples(&name, &[15, 25, 35], &[10, 20, 30], 0)
            .unwrap();
        let engine = SelectEngine::new(storage);

        let results = engine
            .process_search_query(&match_all(18, 28), true, deadline())
            .unwrap();
        let collected: Arc<Mutex<Vec<(Vec<i64>, Vec<f64>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        results
            .run_parallel(move |rs, _| {
                sink.lock().push((rs.timestamps.clone(), rs.values.clone()));
            })
            .await
            .unwrap();
        let collected = collected.lock();
        assert_eq!(collected[0].0, vec![20, 25]);
        assert_eq!(collected[0].1, vec![2.0, 20.0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_expired_deadline_before_entry() {
        let storage = Arc::new(Storage::new());
        let engine = SelectEngine::new(storage);
        let err = engine
            .process_search_query(
                &match_all(0, 100),
                true,
                Deadline::new(Duration::ZERO, "test"),
            )
            .unwrap_err();
        assert!(matches!(err, QueryError::Timeout(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_time_range() {
        let storage = Arc::new(Storage::new());
        let engine = SelectEngine::new(storage);
        let err = engine
            .process_search_query(&match_all(100, 0), true, deadline())
            .unwrap_err();
        assert!(matches!(err, QueryError::TimeRangeInvalid { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bad_filter_regex() {
        let storage = Arc::new(Storage::new());
        let engine = SelectEngine::new(storage);
        let sq = SearchQuery::new(
            0,
            100,
            vec![vec![TagFilterSpec {
                key: "host".to_string(),
                value: "([".to_string(),
                is_negative: false,
                is_regexp: true,
            }]],
        );
        let err = engine
            .process_search_query(&sq, true, deadline())
            .unwrap_err();
        assert!(matches!(err, QueryError::FilterParse(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_series_cap_maps_to_search_error() {
        let storage = Arc::new(Storage::new());
        for i in 0..5 {
            storage
                .add_samples(&mn("m", &[("i", &i.to_string())]), &[10], &[1], 0)
                .unwrap();
        }
        let config = SearchConfig {
            max_unique_timeseries: 2,
            ..SearchConfig::default()
        };
        let engine = SelectEngine::with_config(storage, config);
        let err = engine
            .process_search_query(&match_all(0, 100), true, deadline())
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Search {
                source: StorageError::TooManySeries { limit: 2 },
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_releases_handle() {
        let storage = Arc::new(Storage::new());
        storage.add_samples(&mn("m", &[]), &[10], &[1], 0).unwrap();
        let engine = SelectEngine::new(storage);
        let results = engine
            .process_search_query(&match_all(0, 100), true, deadline())
            .unwrap();
        results.cancel();

        // The engine keeps serving queries after a cancelled handle.
        let results = engine
            .process_search_query(&match_all(0, 100), true, deadline())
            .unwrap();
        assert_eq!(results.len(), 1);
        results.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_label_endpoints() {
        let storage = Arc::new(Storage::new());
        storage
            .add_samples(&mn("cpu", &[("host", "a")]), &[10], &[1], 0)
            .unwrap();
        storage
            .add_samples(&mn("cpu", &[("host", "b")]), &[10], &[1], 0)
            .unwrap();
        let engine = SelectEngine::new(storage);

        let labels = engine.get_labels(deadline()).unwrap();
        assert_eq!(labels, vec!["__name__".to_string(), "host".to_string()]);

        let names = engine.get_label_values("__name__", deadline()).unwrap();
        assert_eq!(names, vec!["cpu".to_string()]);

        let hosts = engine.get_label_values("host", deadline()).unwrap();
        assert_eq!(hosts, vec!["a".to_string(), "b".to_string()]);

        let entries = engine.get_label_entries(deadline()).unwrap();
        // host has two values, __name__ one.
        assert_eq!(entries[0].key, "host");
        assert_eq!(entries[1].key, "__name__");

        assert_eq!(engine.get_series_count(deadline()).unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_label_endpoints_respect_deadline() {
        let storage = Arc::new(Storage::new());
        let engine = SelectEngine::new(storage);
        let expired = Deadline::new(Duration::ZERO, "test");
        assert!(matches!(
            engine.get_labels(expired.clone()).unwrap_err(),
            QueryError::Timeout(_)
        ));
        assert!(matches!(
            engine.get_label_values("host", expired.clone()).unwrap_err(),
            QueryError::Timeout(_)
        ));
        assert!(matches!(
            engine.get_series_count(expired).unwrap_err(),
            QueryError::Timeout(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_series_via_engine() {
        let storage = Arc::new(Storage::new());
        storage
            .add_samples(&mn("cpu", &[("host", "a")]), &[10], &[1], 0)
            .unwrap();
        storage.add_samples(&mn("mem", &[]), &[10], &[1], 0).unwrap();
        let engine = SelectEngine::new(storage);
        let sq = SearchQuery::new(
            0,
            100,
            vec![vec![TagFilterSpec {
                key: "".to_string(),
                value: "cpu".to_string(),
                is_negative: false,
                is_regexp: false,
            }]],
        );
        assert_eq!(engine.delete_series(&sq).unwrap(), 1);
        assert_eq!(engine.get_series_count(deadline()).unwrap(), 1);
    }
}
