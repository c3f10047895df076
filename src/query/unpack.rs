//! Parallel block decoding
//!
//! Block decodes are batched into `UnpackWork` units and fed to a pool
//! of dedicated worker tasks over a bounded channel. Batching keeps
//! channel traffic at `O(total_blocks / cpus)` per query on wide
//! machines; the bounded channel is the backpressure mechanism. A
//! completed unit travels back to the series task through its
//! single-shot channel, carrying either decoded blocks or the first
//! decode error.

use bytes::Bytes;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::trace;

use crate::error::{DecodeError, QueryError};
use crate::query::merge::merge_sort_blocks;
use crate::query::pool::Pool;
use crate::query::results::SeriesResult;
use crate::query::sort_block::{get_sort_block, put_sort_block, SortBlock};
use crate::storage::block::BlockRef;
use crate::types::TimeRange;

/// Channel slots per unpack worker.
const UNPACK_QUEUE_PER_WORKER: usize = 128;

/// Maximum number of blocks a single work unit may carry.
///
/// Sized to the core count so one series fans out across all workers
/// without producing one channel send per block.
pub(crate) fn unpack_batch_size() -> usize {
    static SIZE: Lazy<usize> = Lazy::new(|| 8 * num_cpus::get().max(1));
    *SIZE
}

/// One block decode request.
pub(crate) struct UnpackWorkItem {
    pub(crate) br: BlockRef,
    pub(crate) tr: TimeRange,
}

/// A pooled batch of block decode requests and its output slot.
#[derive(Default)]
pub(crate) struct UnpackWork {
    pub(crate) ws: Vec<UnpackWorkItem>,
    pub(crate) sbs: Vec<SortBlock>,
    pub(crate) fetch_data: bool,
    pub(crate) err: Option<DecodeError>,
}

impl UnpackWork {
    /// Decode the batch in order, stopping at the first failure.
    ///
    /// On failure the in-progress sort block goes back to its pool and
    /// the remaining items are abandoned; blocks decoded before the
    /// failure stay in `sbs` for the consumer to release.
    fn unpack(&mut self) {
        for w in &self.ws {
            let mut sb = get_sort_block();
            match sb.unpack_from(&w.br, w.tr, self.fetch_data) {
                Ok(()) => self.sbs.push(sb),
                Err(err) => {
                    put_sort_block(sb);
                    self.err = Some(err);
                    return;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.ws.clear();
        // The consumer normally drains sbs before returning the unit;
        // anything left goes back to the sort-block pool here.
        for sb in self.sbs.drain(..) {
            put_sort_block(sb);
        }
        self.fetch_data = false;
        self.err = None;
    }
}

static UNPACK_WORK_POOL: Pool<UnpackWork> = Pool::new(256);

pub(crate) fn get_unpack_work() -> UnpackWork {
    UNPACK_WORK_POOL.get_or_else(UnpackWork::default)
}

pub(crate) fn put_unpack_work(mut upw: UnpackWork) {
    upw.reset();
    UNPACK_WORK_POOL.put(upw);
}

struct UnpackJob {
    work: UnpackWork,
    done: oneshot::Sender<UnpackWork>,
}

/// Handle to the block-unpack worker pool.
///
/// Workers run until every handle is dropped.
#[derive(Clone)]
pub(crate) struct UnpackPool {
    tx: mpsc::Sender<UnpackJob>,
}

impl UnpackPool {
    /// Spawn `workers` dedicated unpack workers. Must be called within a
    /// Tokio runtime.
    pub(crate) fn start(workers: usize) -> Self {
        let (tx, rx) = mpsc::channel(workers * UNPACK_QUEUE_PER_WORKER);
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..workers {
            let rx = Arc::clone(&rx);
            tokio::spawn(unpack_worker(worker_id as u32, rx));
        }
        Self { tx }
    }

    /// Enqueue one unit, blocking on channel backpressure. Returns the
    /// receiver its completed form will arrive on.
    async fn dispatch(
        &self,
        work: UnpackWork,
    ) -> Result<oneshot::Receiver<UnpackWork>, QueryError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(UnpackJob {
                work,
                done: done_tx,
            })
            .await
            .map_err(|_| QueryError::Internal("block unpack pool is not running".to_string()))?;
        Ok(done_rx)
    }
}

async fn unpack_worker(worker_id: u32, rx: Arc<Mutex<mpsc::Receiver<UnpackJob>>>) {
    trace!(worker_id, "block unpack worker started");
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(mut job) = job else { break };
        job.work.unpack();
        // The receiver may be gone if the query was abandoned; the unit
        // is simply dropped then.
        let _ = job.done.send(job.work);
    }
    trace!(worker_id, "block unpack worker stopped");
}

/// All block refs of one series, waiting to be decoded and merged.
///
/// Consumed exactly once: `unpack` drains `block_refs`.
#[derive(Debug)]
pub(crate) struct PackedSeries {
    pub(crate) metric_name: Bytes,
    pub(crate) block_refs: Vec<BlockRef>,
}

impl PackedSeries {
    pub(crate) fn new(metric_name: Bytes, block_refs: Vec<BlockRef>) -> Self {
        Self {
            metric_name,
            block_refs,
        }
    }

    /// Decode all blocks of this series through the unpack pool and
    /// merge them into `dst`.
    ///
    /// Every dispatched unit is awaited even after a failure: each unit
    /// owns pooled buffers that must be drained back. The error cut is
    /// logical, not structural; only the first error survives.
    pub(crate) async fn unpack(
        &mut self,
        pool: &UnpackPool,
        dst: &mut SeriesResult,
        tr: TimeRange,
        fetch_data: bool,
    ) -> Result<(), QueryError> {
        dst.reset();
        dst.metric_name
            .unmarshal(&self.metric_name)
            .map_err(|source| DecodeError::MetricName {
                name: self.metric_name.iter().copied().take(64).collect(),
                source,
            })?;

        let batch_size = unpack_batch_size();
        let mut completions = Vec::with_capacity(1 + self.block_refs.len() / batch_size);
        let mut upw = get_unpack_work();
        upw.fetch_data = fetch_data;
        for br in self.block_refs.drain(..) {
            if upw.ws.len() >= batch_size {
                completions.push(pool.dispatch(upw).await?);
                upw = get_unpack_work();
                upw.fetch_data = fetch_data;
            }
            upw.ws.push(UnpackWorkItem { br, tr });
        }
        completions.push(pool.dispatch(upw).await?);

        let mut sbs: Vec<SortBlock> = Vec::new();
        let mut first_err: Option<QueryError> = None;
        for done in completions {
            match done.await {
                Ok(mut upw) => {
                    if let Some(err) = upw.err.take() {
                        if first_err.is_none() {
                            first_err = Some(err.into());
                        }
                    }
                    if first_err.is_none() {
                        sbs.append(&mut upw.sbs);
                    } else {
                        for sb in upw.sbs.drain(..) {
                            put_sort_block(sb);
                        }
                    }
                    put_unpack_work(upw);
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(QueryError::Internal(
                            "block unpack worker dropped its completion".to_string(),
                        ));
                    }
                }
            }
        }
        if let Some(err) = first_err {
            for sb in sbs {
                put_sort_block(sb);
            }
            return Err(err);
        }
        merge_sort_blocks(dst, sbs);
        Ok(())
    }
}
