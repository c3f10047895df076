//! Per-series results and the series worker pool
//!
//! Each worker owns one reusable `SeriesResult` that it lends to the
//! user callback for the duration of a single series. A worker replaces
//! its buffer outright when a past query left it holding an outsized
//! allocation, which caps steady-state memory after outlier queries.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace};

use crate::error::QueryError;
use crate::metrics;
use crate::query::engine::put_storage_search;
use crate::query::unpack::{PackedSeries, UnpackPool};
use crate::storage::{MetricName, Search};
use crate::types::{Deadline, TimeRange};

/// Channel slots per series worker.
const SERIES_QUEUE_PER_WORKER: usize = 16;

/// One decoded, merged time series, handed to the user callback.
///
/// The callback must not retain the reference past its return: the
/// worker reuses this buffer for its next series.
#[derive(Debug, Default)]
pub struct SeriesResult {
    /// Identity of the series.
    pub metric_name: MetricName,

    /// Merged timestamps, strictly increasing after dedup.
    pub timestamps: Vec<i64>,

    /// Values parallel to `timestamps`.
    pub values: Vec<f64>,

    /// Marshaled form of `metric_name`, filled by callers that sort
    /// results downstream.
    pub metric_name_marshaled: Vec<u8>,
}

impl SeriesResult {
    /// Clear in place, keeping capacity.
    pub fn reset(&mut self) {
        self.metric_name.reset();
        self.timestamps.clear();
        self.values.clear();
        self.metric_name_marshaled.clear();
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the series carries no samples.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Replace the worker's result buffer when it holds a large, mostly
/// unused allocation and enough time passed since the last swap.
///
/// Capacity is measured in values; a buffer past one mebi-entries where
/// the live prefix is under a quarter of capacity is considered bloat.
pub(crate) fn should_reset_result(capacity: usize, len: usize, since_last_reset: Duration) -> bool {
    capacity > 1024 * 1024 && 4 * len < capacity && since_last_reset > Duration::from_secs(10)
}

pub(crate) type SeriesCallback = dyn Fn(&SeriesResult, u32) + Send + Sync;

pub(crate) struct SeriesWork {
    pts: PackedSeries,
    tr: TimeRange,
    fetch_data: bool,
    deadline: Deadline,
    f: Arc<SeriesCallback>,
    done: oneshot::Sender<Result<usize, QueryError>>,
}

/// Handle to the series worker pool. Workers run until every handle is
/// dropped.
#[derive(Clone)]
pub(crate) struct SeriesPool {
    tx: mpsc::Sender<SeriesWork>,
}

impl SeriesPool {
    /// Spawn `workers` series workers feeding block decodes into
    /// `unpack`. Must be called within a Tokio runtime.
    pub(crate) fn start(workers: usize, unpack: UnpackPool) -> Self {
        let (tx, rx) = mpsc::channel(workers * SERIES_QUEUE_PER_WORKER);
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..workers {
            let rx = Arc::clone(&rx);
            let unpack = unpack.clone();
            tokio::spawn(series_worker(worker_id as u32, rx, unpack));
        }
        Self { tx }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<SeriesWork> {
        self.tx.clone()
    }
}

async fn series_worker(
    worker_id: u32,
    rx: Arc<Mutex<mpsc::Receiver<SeriesWork>>>,
    unpack: UnpackPool,
) {
    trace!(worker_id, "series worker started");
    let mut rs = SeriesResult::default();
    let mut last_reset = Instant::now();
    loop {
        let work = { rx.lock().await.recv().await };
        let Some(mut work) = work else { break };

        if work.deadline.exceeded() {
            let _ = work.done.send(Err(QueryError::Timeout(format!(
                "during query execution: {}",
                work.deadline
            ))));
            continue;
        }
        if let Err(err) = work
            .pts
            .unpack(&unpack, &mut rs, work.tr, work.fetch_data)
            .await
        {
            let _ = work.done.send(Err(err));
            continue;
        }
        if !rs.timestamps.is_empty() || !work.fetch_data {
            (work.f)(&rs, worker_id);
        }
        let _ = work.done.send(Ok(rs.values.len()));

        if should_reset_result(rs.values.capacity(), rs.values.len(), last_reset.elapsed()) {
            // Drop the whole buffer rather than shrinking: the next
            // series re-grows it to its own working size.
            rs = SeriesResult::default();
            last_reset = Instant::now();
        }
    }
    trace!(worker_id, "series worker stopped");
}

/// Handle over everything one search query matched.
///
/// Returned by the query driver; terminal calls are
/// [`QueryResults::run_parallel`] and [`QueryResults::cancel`], both of
/// which consume the handle. The pooled storage search is released when
/// the handle drops, on every path.
#[derive(Debug)]
pub struct QueryResults {
    pub(crate) tr: TimeRange,
    pub(crate) fetch_data: bool,
    pub(crate) deadline: Deadline,
    pub(crate) packed: Vec<PackedSeries>,
    pub(crate) search: Search,
    pub(crate) series_tx: mpsc::Sender<SeriesWork>,
}

impl QueryResults {
    /// Number of matched series.
    pub fn len(&self) -> usize {
        self.packed.len()
    }

    /// Whether the query matched no series.
    pub fn is_empty(&self) -> bool {
        self.packed.is_empty()
    }

    /// Abandon the query and release storage resources.
    pub fn cancel(self) {}

    /// Run `f` for every matched series on the worker pool.
    ///
    /// `f` is called with the merged series and the id of the invoking
    /// worker (`0..cpus`), concurrently and in unspecified order, at
    /// most once per series. It must not retain the `&SeriesResult`
    /// borrow past its return. Returns the first error encountered;
    /// callbacks already invoked before an error are not retracted.
    pub async fn run_parallel<F>(mut self, f: F) -> Result<(), QueryError>
    where
        F: Fn(&SeriesResult, u32) + Send + Sync + 'static,
    {
        let f: Arc<SeriesCallback> = Arc::new(f);
        let series_total = self.packed.len();
        let mut completions = Vec::with_capacity(series_total);
        // Feed the workers, then drop the packed list so block-ref
        // memory frees while work is in flight.
        for pts in std::mem::take(&mut self.packed) {
            let (done_tx, done_rx) = oneshot::channel();
            let work = SeriesWork {
                pts,
                tr: self.tr,
                fetch_data: self.fetch_data,
                deadline: self.deadline.clone(),
                f: Arc::clone(&f),
                done: done_tx,
            };
            self.series_tx
                .send(work)
                .await
                .map_err(|_| QueryError::Internal("series worker pool is not running".to_string()))?;
            completions.push(done_rx);
        }

        let mut first_err: Option<QueryError> = None;
        let mut rows_total = 0usize;
        for done in completions {
            match done.await {
                Ok(Ok(rows)) => rows_total += rows,
                Ok(Err(err)) => {
                    // Keep the first error only; later ones are almost
                    // always consequences of it.
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(QueryError::Internal(
                            "series worker dropped its completion".to_string(),
                        ));
                    }
                }
            }
        }
        metrics::record_per_query_stats(rows_total, series_total);
        debug!(
            series = series_total,
            rows = rows_total,
            "parallel series run finished"
        );
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for QueryResults {
    fn drop(&mut self) {
        put_storage_search(std::mem::take(&mut self.search));
    }
}
