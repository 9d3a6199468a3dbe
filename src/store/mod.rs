//! Sample Store: recent samples in memory, durable history in the sink.
//!
//! Rings are per (server, metric) and size-bounded; eviction is oldest-first
//! and independent of sink success — the sink is the system of record for
//! long retention, the rings serve live queries and chart backfill.

pub mod ring;
pub mod sink;

pub use ring::{QueryResult, SampleRing};
pub use sink::{Flusher, SinkWriteOutcome, SqliteSink, TimeSeriesSink};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::types::{MetricKind, MetricsSample, ServerId, TimeRange};

struct ServerRings {
    by_metric: HashMap<MetricKind, SampleRing>,
    latest_complete: Option<Arc<MetricsSample>>,
    newest_ts: Option<i64>,
}

impl ServerRings {
    fn new(capacity: usize) -> Self {
        let by_metric = MetricKind::ALL
            .iter()
            .map(|kind| (*kind, SampleRing::new(capacity)))
            .collect();
        Self {
            by_metric,
            latest_complete: None,
            newest_ts: None,
        }
    }
}

/// In-memory store plus the handle feeding the background flusher.
pub struct SampleStore {
    rings: RwLock<HashMap<ServerId, ServerRings>>,
    capacity: usize,
    flush_tx: mpsc::UnboundedSender<Arc<MetricsSample>>,
    sink_degraded: Arc<AtomicBool>,
}

impl SampleStore {
    /// Returns the store and the receiver half to hand to the [`Flusher`].
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<MetricsSample>>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            rings: RwLock::new(HashMap::new()),
            capacity,
            flush_tx,
            sink_degraded: Arc::new(AtomicBool::new(false)),
        });
        (store, flush_rx)
    }

    pub fn sink_degraded_flag(&self) -> Arc<AtomicBool> {
        self.sink_degraded.clone()
    }

    /// Operator-visible: the durable sink has rejected a batch fatally and
    /// history older than the rings may be incomplete.
    pub fn is_sink_degraded(&self) -> bool {
        self.sink_degraded.load(Ordering::Relaxed)
    }

    /// Append one sample. Timestamps must strictly advance per server;
    /// anything else is rejected as out of order (equal timestamps are
    /// duplicates and rejected too).
    pub fn submit(&self, sample: MetricsSample) -> Result<Arc<MetricsSample>, StoreError> {
        let sample = Arc::new(sample);
        {
            let mut rings = self.rings.write().unwrap();
            let server = rings
                .entry(sample.server_id.clone())
                .or_insert_with(|| ServerRings::new(self.capacity));

            if let Some(newest) = server.newest_ts {
                if sample.timestamp_ms <= newest {
                    return Err(StoreError::OutOfOrder {
                        server_id: sample.server_id.clone(),
                        timestamp_ms: sample.timestamp_ms,
                        newest_ms: newest,
                    });
                }
            }
            server.newest_ts = Some(sample.timestamp_ms);

            for kind in MetricKind::ALL {
                if sample.has_metric(kind) {
                    server
                        .by_metric
                        .get_mut(&kind)
                        .expect("all metric rings exist")
                        .push(sample.clone());
                }
            }
            if sample.is_complete() {
                server.latest_complete = Some(sample.clone());
            }
        }

        // The flusher owns durable persistence; a dropped receiver only
        // means shutdown is underway.
        if self.flush_tx.send(sample.clone()).is_err() {
            debug!(server_id = %sample.server_id, "flusher gone; sample not queued for sink");
        }
        Ok(sample)
    }

    /// Samples of one metric within `range`, oldest first. `partial` is set
    /// when the range reaches past what the ring still holds.
    pub fn query_recent(
        &self,
        server_id: &ServerId,
        metric: MetricKind,
        range: TimeRange,
    ) -> QueryResult {
        let rings = self.rings.read().unwrap();
        match rings.get(server_id).and_then(|s| s.by_metric.get(&metric)) {
            Some(ring) => ring.query(range),
            None => QueryResult {
                samples: Vec::new(),
                partial: true,
            },
        }
    }

    /// The freshest complete sample for a server.
    pub fn query_latest(&self, server_id: &ServerId) -> Result<Arc<MetricsSample>, StoreError> {
        self.rings
            .read()
            .unwrap()
            .get(server_id)
            .and_then(|s| s.latest_complete.clone())
            .ok_or_else(|| StoreError::NoData {
                server_id: server_id.clone(),
            })
    }

    /// Drop all in-memory state for a removed server. Already-queued flush
    /// batches still drain to the sink.
    pub fn remove_server(&self, server_id: &ServerId) {
        if self.rings.write().unwrap().remove(server_id).is_some() {
            warn!(server_id = %server_id, "dropped sample rings");
        }
    }
}
