//! End-to-end tests for the select pipeline: storage ingest, search,
//! parallel unpack, merge, dedup, and callback delivery.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tsdb_select::{
    Deadline, MetricName, QueryError, SearchQuery, SelectEngine, Storage, TagFilterSpec, TimeRange,
};

fn deadline() -> Deadline {
    Deadline::new(Duration::from_secs(30), "test query")
}

fn metric(group: &str, tags: &[(&str, &str)]) -> MetricName {
    let mut mn = MetricName::new(group);
    for (k, v) in tags {
        mn.add_tag(*k, *v);
    }
    mn
}

fn match_all(min: i64, max: i64) -> SearchQuery {
    SearchQuery::new(min, max, vec![])
}

fn filter(key: &str, value: &str) -> TagFilterSpec {
    TagFilterSpec {
        key: key.to_string(),
        value: value.to_string(),
        is_negative: false,
        is_regexp: false,
    }
}

/// Collected callback output keyed by the series display name.
type Collected = Arc<Mutex<HashMap<String, Vec<(i64, f64)>>>>;

async fn run_and_collect(
    engine: &SelectEngine,
    sq: &SearchQuery,
    fetch_data: bool,
) -> Result<HashMap<String, Vec<(i64, f64)>>, QueryError> {
    let results = engine.process_search_query(sq, fetch_data, deadline())?;
    let collected: Collected = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&collected);
    results
        .run_parallel(move |rs, _worker_id| {
            let samples = rs
                .timestamps
                .iter()
                .zip(rs.values.iter())
                .map(|(&t, &v)| (t, v))
                .collect();
            let prev = sink.lock().insert(rs.metric_name.to_string(), samples);
            assert!(prev.is_none(), "series delivered more than once");
        })
        .await?;
    let collected = std::mem::take(&mut *collected.lock());
    Ok(collected)
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_blocks_merge_in_time_order() {
    let storage = Arc::new(Storage::new());
    let name = metric("cpu", &[("host", "a")]);
    storage
        .add_samples(&name, &[10, 20, 30], &[1, 2, 3], 0)
        .unwrap();
    storage
        .add_samples(&name, &[15, 25, 35], &[10, 20, 30], 0)
        .unwrap();
    let engine = SelectEngine::new(storage);

    let out = run_and_collect(&engine, &match_all(0, 100), true)
        .await
        .unwrap();
    assert_eq!(out.len(), 1);
    let samples = &out[&name.to_string()];
    assert_eq!(
        samples,
        &vec![
            (10, 1.0),
            (15, 10.0),
            (20, 2.0),
            (25, 20.0),
            (30, 3.0),
            (35, 30.0)
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn coincident_timestamps_are_deduplicated() {
    let storage = Arc::new(Storage::new());
    let name = metric("cpu", &[]);
    storage.add_samples(&name, &[10, 20], &[1, 2], 0).unwrap();
    storage.add_samples(&name, &[20, 30], &[99, 3], 0).unwrap();
    let engine = SelectEngine::new(storage);

    let out = run_and_collect(&engine, &match_all(0, 100), true)
        .await
        .unwrap();
    let samples = &out[&name.to_string()];
    let timestamps: Vec<i64> = samples.iter().map(|&(t, _)| t).collect();
    assert_eq!(timestamps, vec![10, 20, 30]);
    assert_eq!(samples[0].1, 1.0);
    assert_eq!(samples[2].1, 3.0);
    // The surviving duplicate value is the dedup policy's choice.
    assert!(samples[1].1 == 2.0 || samples[1].1 == 99.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn every_emitted_sample_is_inside_the_query_range() {
    let storage = Arc::new(Storage::new());
    for i in 0..20 {
        let name = metric("m", &[("i", &i.to_string())]);
        let ts: Vec<i64> = (0..50).map(|j| j * 7 + i).collect();
        let vals: Vec<i64> = ts.clone();
        storage.add_samples(&name, &ts, &vals, 0).unwrap();
    }
    let engine = SelectEngine::new(storage);

    let out = run_and_collect(&engine, &match_all(40, 200), true)
        .await
        .unwrap();
    assert!(!out.is_empty());
    for samples in out.values() {
        let timestamps: Vec<i64> = samples.iter().map(|&(t, _)| t).collect();
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        assert!(timestamps.iter().all(|&t| (40..=200).contains(&t)));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_matching_series_returns_ok_without_callbacks() {
    let storage = Arc::new(Storage::new());
    storage
        .add_samples(&metric("cpu", &[]), &[10], &[1], 0)
        .unwrap();
    let engine = SelectEngine::new(storage);

    let sq = SearchQuery::new(0, 100, vec![vec![filter("", "nothing_matches")]]);
    let results = engine.process_search_query(&sq, true, deadline()).unwrap();
    assert_eq!(results.len(), 0);
    assert!(results.is_empty());
    let out = run_and_collect(&engine, &sq, true).await.unwrap();
    assert!(out.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_series_callback_depends_on_fetch_data() {
    let storage = Arc::new(Storage::new());
    // Block bounds [10, 30] overlap the query range [15, 25] but no
    // sample does, so the series decodes to empty.
    storage
        .add_samples(&metric("cpu", &[]), &[10, 30], &[1, 3], 0)
        .unwrap();
    let engine = SelectEngine::new(storage);

    let out = run_and_collect(&engine, &match_all(15, 25), true)
        .await
        .unwrap();
    assert!(out.is_empty(), "no callback expected when fetching data");

    let out = run_and_collect(&engine, &match_all(15, 25), false)
        .await
        .unwrap();
    assert_eq!(out.len(), 1, "callback with empty result expected");
    assert!(out.values().next().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn callbacks_fire_once_per_series_with_bounded_worker_ids() {
    let storage = Arc::new(Storage::new());
    for i in 0..100 {
        let name = metric("m", &[("i", &i.to_string())]);
        storage
            .add_samples(&name, &[10 * i as i64 + 10], &[i as i64], 0)
            .unwrap();
    }
    let engine = SelectEngine::new(storage);

    let results = engine
        .process_search_query(&match_all(0, 10_000), true, deadline())
        .unwrap();
    assert_eq!(results.len(), 100);

    let cpus = num_cpus::get() as u32;
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    results
        .run_parallel(move |rs, worker_id| {
            assert!(worker_id < cpus);
            sink.lock().push(rs.metric_name.to_string());
        })
        .await
        .unwrap();

    let mut seen = std::mem::take(&mut *seen.lock());
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn filters_select_subsets_of_series() {
    let storage = Arc::new(Storage::new());
    storage
        .add_samples(&metric("cpu", &[("host", "a")]), &[10], &[1], 0)
        .unwrap();
    storage
        .add_samples(&metric("cpu", &[("host", "b")]), &[10], &[2], 0)
        .unwrap();
    storage
        .add_samples(&metric("mem", &[("host", "a")]), &[10], &[3], 0)
        .unwrap();
    let engine = SelectEngine::new(storage);

    let sq = SearchQuery::new(
        0,
        100,
        vec![vec![filter("", "cpu"), filter("host", "a")]],
    );
    let out = run_and_collect(&engine, &sq, true).await.unwrap();
    assert_eq!(out.len(), 1);
    assert!(out.keys().next().unwrap().starts_with("cpu{"));

    // OR of two groups.
    let sq = SearchQuery::new(
        0,
        100,
        vec![vec![filter("", "cpu")], vec![filter("", "mem")]],
    );
    let out = run_and_collect(&engine, &sq, true).await.unwrap();
    assert_eq!(out.len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_deadline_fails_series_workers() {
    let storage = Arc::new(Storage::new());
    for i in 0..50 {
        let name = metric("m", &[("i", &i.to_string())]);
        storage.add_samples(&name, &[10], &[1], 0).unwrap();
    }
    let engine = SelectEngine::new(storage);

    // The handle is created just inside the deadline; by the time the
    // workers pick the series up the deadline has passed.
    let tight = Deadline::new(Duration::from_millis(200), "tight query");
    let results = engine
        .process_search_query(&match_all(0, 100), true, tight)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let err = results.run_parallel(|_rs, _worker_id| {}).await.unwrap_err();
    assert!(matches!(err, QueryError::Timeout(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_queries_reuse_pools_without_leaking_samples() {
    let storage = Arc::new(Storage::new());
    let big = metric("big", &[]);
    let ts: Vec<i64> = (0..1000).collect();
    storage.add_samples(&big, &ts, &ts, 0).unwrap();
    let small = metric("small", &[]);
    storage.add_samples(&small, &[5], &[7], 0).unwrap();
    let engine = SelectEngine::new(storage);

    let sq_big = SearchQuery::new(0, 2000, vec![vec![filter("", "big")]]);
    let out = run_and_collect(&engine, &sq_big, true).await.unwrap();
    assert_eq!(out[&big.to_string()].len(), 1000);

    let sq_small = SearchQuery::new(0, 2000, vec![vec![filter("", "small")]]);
    let out = run_and_collect(&engine, &sq_small, true).await.unwrap();
    assert_eq!(out[&small.to_string()], vec![(5, 7.0)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_is_a_valid_terminal_call() {
    let storage = Arc::new(Storage::new());
    storage
        .add_samples(&metric("cpu", &[]), &[10], &[1], 0)
        .unwrap();
    let engine = SelectEngine::new(storage);
    let results = engine
        .process_search_query(&match_all(0, 100), true, deadline())
        .unwrap();
    results.cancel();

    // The engine keeps serving queries afterwards.
    let out = run_and_collect(&engine, &match_all(0, 100), true)
        .await
        .unwrap();
    assert_eq!(out.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn scaled_values_convert_to_floats() {
    let storage = Arc::new(Storage::new());
    let name = metric("temp", &[]);
    storage.add_samples(&name, &[10, 20], &[215, 5], -1).unwrap();
    let engine = SelectEngine::new(storage);

    let out = run_and_collect(&engine, &match_all(0, 100), true)
        .await
        .unwrap();
    assert_eq!(out[&name.to_string()], vec![(10, 21.5), (20, 0.5)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn graphite_style_suffix_walk() {
    let storage = Arc::new(Storage::new());
    for path in ["db.disk.used", "db.disk.free", "db.net.rx", "web.cpu"] {
        storage
            .add_samples(&metric(path, &[]), &[10], &[1], 0)
            .unwrap();
    }
    let engine = SelectEngine::new(storage);

    let suffixes = engine
        .get_tag_value_suffixes(TimeRange::new_unchecked(0, 100), "", "", b'.', deadline())
        .unwrap();
    assert_eq!(suffixes, vec!["db.".to_string(), "web.".to_string()]);

    let suffixes = engine
        .get_tag_value_suffixes(TimeRange::new_unchecked(0, 100), "", "db.", b'.', deadline())
        .unwrap();
    assert_eq!(suffixes, vec!["disk.".to_string(), "net.".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn tsdb_status_ranks_by_cardinality() {
    let storage = Arc::new(Storage::new());
    for i in 0..3 {
        storage
            .add_samples(
                &metric("cpu", &[("host", &format!("h{i}"))]),
                &[10],
                &[1],
                0,
            )
            .unwrap();
    }
    storage
        .add_samples(&metric("mem", &[("host", "h0")]), &[10], &[1], 0)
        .unwrap();
    let engine = SelectEngine::new(storage);

    let status = engine
        .get_tsdb_status_for_date(deadline(), 0, 10)
        .unwrap();
    assert_eq!(status.series_count_by_metric_name[0].name, "cpu");
    assert_eq!(status.series_count_by_metric_name[0].count, 3);
    assert_eq!(status.series_count_by_metric_name[1].name, "mem");
}
