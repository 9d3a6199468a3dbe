//! Durable time-series sink and the batching flusher.
//!
//! The sink is an external collaborator behind a narrow trait; the crate
//! bundles a SQLite implementation. The flusher moves samples from the
//! store's channel to the sink in batches, retrying retryable failures and
//! raising the operator-visible degraded flag on fatal ones. Live queries
//! are unaffected either way.

use async_trait::async_trait;
use rand::Rng;
use sqlx::sqlite::SqlitePool;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::types::MetricsSample;

/// Outcome of one batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkWriteOutcome {
    Ok,
    Retryable(String),
    Fatal(String),
}

#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write_batch(&self, samples: &[Arc<MetricsSample>]) -> SinkWriteOutcome;
}

/// SQLite-backed sink. One row per sample; metric sub-records are stored as
/// JSON columns since the sink is append-and-archive, not a query engine.
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub async fn new(database_path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(database_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePool::connect(&url).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics_samples (
                server_id    TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                seq          INTEGER NOT NULL,
                status       TEXT NOT NULL,
                cpu          TEXT,
                memory       TEXT,
                disk         TEXT,
                network      TEXT,
                PRIMARY KEY (server_id, timestamp_ms)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!(path = database_path, "time-series sink ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TimeSeriesSink for SqliteSink {
    async fn write_batch(&self, samples: &[Arc<MetricsSample>]) -> SinkWriteOutcome {
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => return SinkWriteOutcome::Retryable(e.to_string()),
        };

        for sample in samples {
            let encode = |v: &Option<serde_json::Value>| -> Option<String> {
                v.as_ref().map(|v| v.to_string())
            };
            let cpu = sample.cpu.as_ref().and_then(|r| serde_json::to_value(r).ok());
            let memory = sample
                .memory
                .as_ref()
                .and_then(|r| serde_json::to_value(r).ok());
            let disk = sample
                .disk
                .as_ref()
                .and_then(|r| serde_json::to_value(r).ok());
            let network = sample
                .network
                .as_ref()
                .and_then(|r| serde_json::to_value(r).ok());

            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO metrics_samples
                    (server_id, timestamp_ms, seq, status, cpu, memory, disk, network)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&sample.server_id)
            .bind(sample.timestamp_ms)
            .bind(sample.seq as i64)
            .bind(sample.status.as_str())
            .bind(encode(&cpu))
            .bind(encode(&memory))
            .bind(encode(&disk))
            .bind(encode(&network))
            .execute(&mut *tx)
            .await;

            if let Err(e) = result {
                return match e {
                    sqlx::Error::Database(ref db) if db.message().contains("malformed") => {
                        SinkWriteOutcome::Fatal(e.to_string())
                    }
                    _ => SinkWriteOutcome::Retryable(e.to_string()),
                };
            }
        }

        match tx.commit().await {
            Ok(()) => SinkWriteOutcome::Ok,
            Err(e) => SinkWriteOutcome::Retryable(e.to_string()),
        }
    }
}

/// Batch parameters and retry schedule for the flusher.
#[derive(Debug, Clone)]
pub struct FlushPolicy {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_delays: [Duration; 3],
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            batch_size: 64,
            flush_interval: Duration::from_secs(5),
            retry_delays: [
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        }
    }
}

/// Moves samples from the store to the sink in the background.
pub struct Flusher {
    rx: mpsc::UnboundedReceiver<Arc<MetricsSample>>,
    sink: Arc<dyn TimeSeriesSink>,
    policy: FlushPolicy,
    degraded: Arc<AtomicBool>,
}

impl Flusher {
    pub fn new(
        rx: mpsc::UnboundedReceiver<Arc<MetricsSample>>,
        sink: Arc<dyn TimeSeriesSink>,
        policy: FlushPolicy,
        degraded: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rx,
            sink,
            policy,
            degraded,
        }
    }

    /// Run until cancelled; a final partial batch is flushed on the way out.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut batch: Vec<Arc<MetricsSample>> = Vec::with_capacity(self.policy.batch_size);
        let mut deadline = tokio::time::interval(self.policy.flush_interval);
        deadline.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain whatever is already queued, then flush once.
                    while let Ok(sample) = self.rx.try_recv() {
                        batch.push(sample);
                    }
                    if !batch.is_empty() {
                        self.write_with_retry(&batch).await;
                    }
                    debug!("flusher stopped");
                    return;
                }
                received = self.rx.recv() => {
                    match received {
                        Some(sample) => {
                            batch.push(sample);
                            if batch.len() >= self.policy.batch_size {
                                self.write_with_retry(&batch).await;
                                batch.clear();
                            }
                        }
                        None => {
                            if !batch.is_empty() {
                                self.write_with_retry(&batch).await;
                            }
                            debug!("store closed; flusher stopped");
                            return;
                        }
                    }
                }
                _ = deadline.tick() => {
                    if !batch.is_empty() {
                        self.write_with_retry(&batch).await;
                        batch.clear();
                    }
                }
            }
        }
    }

    /// Write one batch: up to three attempts with jittered backoff for
    /// retryable failures. A fatal outcome abandons this batch and raises
    /// the degraded flag; later batches still get their chance, and the
    /// first success clears the flag.
    async fn write_with_retry(&self, batch: &[Arc<MetricsSample>]) {
        for (attempt, delay) in self.policy.retry_delays.iter().enumerate() {
            match self.sink.write_batch(batch).await {
                SinkWriteOutcome::Ok => {
                    if self.degraded.swap(false, Ordering::Relaxed) {
                        info!("durable sink recovered; degraded flag cleared");
                    }
                    debug!(count = batch.len(), "batch flushed to sink");
                    return;
                }
                SinkWriteOutcome::Retryable(reason) => {
                    warn!(
                        attempt = attempt + 1,
                        count = batch.len(),
                        reason,
                        "sink write failed; retrying"
                    );
                    let jitter = rand::thread_rng().gen_range(Duration::ZERO..*delay / 2);
                    tokio::time::sleep(*delay + jitter).await;
                }
                SinkWriteOutcome::Fatal(reason) => {
                    error!(count = batch.len(), reason, "sink write failed fatally; batch dropped");
                    self.degraded.store(true, Ordering::Relaxed);
                    return;
                }
            }
        }
        error!(
            count = batch.len(),
            "sink write exhausted retries; batch dropped"
        );
        self.degraded.store(true, Ordering::Relaxed);
    }
}
