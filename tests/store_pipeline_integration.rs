//! Integration tests for the sample store and its durable-sink pipeline.
//!
//! Covers monotonic ordering through the ring, sink degradation and
//! recovery, and the SQLite sink end to end.

mod common;

use common::fixtures::*;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cwatcher::store::sink::FlushPolicy;
use cwatcher::store::{Flusher, SampleStore, SinkWriteOutcome, SqliteSink, TimeSeriesSink};
use cwatcher::types::{MetricKind, MetricsSample, TimeRange};
use cwatcher::StoreError;
use tokio_util::sync::CancellationToken;

/// Sink whose next outcomes are scripted; defaults to Ok when exhausted.
struct ScriptedSink {
    outcomes: Mutex<Vec<SinkWriteOutcome>>,
    written: Mutex<Vec<usize>>,
}

impl ScriptedSink {
    fn new(mut outcomes: Vec<SinkWriteOutcome>) -> Arc<Self> {
        outcomes.reverse();
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
            written: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TimeSeriesSink for ScriptedSink {
    async fn write_batch(&self, samples: &[Arc<MetricsSample>]) -> SinkWriteOutcome {
        self.written.lock().unwrap().push(samples.len());
        self.outcomes
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(SinkWriteOutcome::Ok)
    }
}

fn fast_policy() -> FlushPolicy {
    FlushPolicy {
        batch_size: 8,
        flush_interval: Duration::from_millis(20),
        retry_delays: [
            Duration::from_millis(2),
            Duration::from_millis(2),
            Duration::from_millis(2),
        ],
    }
}

#[tokio::test]
async fn test_query_recent_returns_monotonic_oldest_first() {
    let (store, _rx) = SampleStore::new(64);
    for seq in 1..=20u64 {
        store
            .submit(full_sample("srv-1", seq, seq as i64 * 30_000, 10.0, 1_000))
            .expect("in-order submit should succeed");
    }

    let result = store.query_recent(
        &"srv-1".to_string(),
        MetricKind::Cpu,
        TimeRange {
            from_ms: 0,
            to_ms: i64::MAX,
        },
    );

    let mut last = i64::MIN;
    let mut last_seq = 0;
    for sample in &result.samples {
        assert!(
            sample.timestamp_ms > last,
            "timestamps must strictly increase per server"
        );
        assert!(sample.seq > last_seq, "sequence must increase with time");
        last = sample.timestamp_ms;
        last_seq = sample.seq;
    }
    assert_eq!(result.samples.len(), 20);
}

#[tokio::test]
async fn test_out_of_order_submission_is_dropped_not_stored() {
    let (store, _rx) = SampleStore::new(64);
    store
        .submit(full_sample("srv-1", 1, 60_000, 10.0, 1_000))
        .unwrap();

    let rejected = store.submit(full_sample("srv-1", 2, 30_000, 10.0, 1_000));
    assert!(
        matches!(rejected, Err(StoreError::OutOfOrder { .. })),
        "older timestamp must be rejected"
    );

    let result = store.query_recent(
        &"srv-1".to_string(),
        MetricKind::Cpu,
        TimeRange {
            from_ms: 0,
            to_ms: i64::MAX,
        },
    );
    assert_eq!(result.samples.len(), 1, "rejected sample must not appear");
}

#[tokio::test]
async fn test_sink_degradation_leaves_live_queries_unaffected() {
    // Ten consecutive fatal batches: the flag sets, the ring keeps serving,
    // submits keep succeeding, and recovery clears the flag.
    let (store, rx) = SampleStore::new(64);
    let outcomes = vec![SinkWriteOutcome::Fatal("sink exploded".into()); 10];
    let sink = ScriptedSink::new(outcomes);
    let flusher = Flusher::new(rx, sink.clone(), fast_policy(), store.sink_degraded_flag());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(flusher.run(cancel.clone()));

    let mut seq = 0u64;
    for round in 0..10 {
        for _ in 0..8 {
            seq += 1;
            store
                .submit(full_sample("srv-1", seq, seq as i64 * 1_000, 10.0, 1_000))
                .expect("submit must keep succeeding while sink is down");
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            store.is_sink_degraded(),
            "flag must be set after fatal batch {round}"
        );
    }

    // Live reads still come from the ring.
    let latest = store
        .query_latest(&"srv-1".to_string())
        .expect("latest sample must be served from the ring");
    assert_eq!(latest.seq, seq);

    // The sink recovers: the next successful batch clears the flag.
    for _ in 0..8 {
        seq += 1;
        store
            .submit(full_sample("srv-1", seq, seq as i64 * 1_000, 10.0, 1_000))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !store.is_sink_degraded(),
        "flag must clear on the next successful batch"
    );

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_sqlite_sink_persists_batches() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sink.db");
    let sink = SqliteSink::new(path.to_str().unwrap()).await.unwrap();

    let batch: Vec<Arc<MetricsSample>> = (1..=5)
        .map(|seq| arc_sample("srv-1", seq, seq as i64 * 1_000, 42.0))
        .collect();
    assert_eq!(sink.write_batch(&batch).await, SinkWriteOutcome::Ok);

    // Re-writing the same rows is idempotent, not fatal.
    assert_eq!(sink.write_batch(&batch).await, SinkWriteOutcome::Ok);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metrics_samples")
        .fetch_one(sink.pool())
        .await
        .unwrap();
    assert_eq!(count, 5);
}

#[tokio::test]
async fn test_flusher_final_drain_on_cancel() {
    let (store, rx) = SampleStore::new(64);
    let sink = ScriptedSink::new(vec![]);
    let flusher = Flusher::new(rx, sink.clone(), fast_policy(), store.sink_degraded_flag());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(flusher.run(cancel.clone()));

    // Fewer than a full batch, cancelled before the interval flush.
    for seq in 1..=3u64 {
        store
            .submit(full_sample("srv-1", seq, seq as i64 * 1_000, 10.0, 1_000))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
    cancel.cancel();
    handle.await.unwrap();

    let written: usize = sink.written.lock().unwrap().iter().sum();
    assert_eq!(written, 3, "pending samples must flush on shutdown");
    assert!(!store.sink_degraded_flag().load(Ordering::Relaxed));
}
