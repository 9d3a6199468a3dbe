//! Collector Scheduler: one periodic collection task per enabled server.
//!
//! A cycle launches all registry commands in parallel, assembles a
//! [`MetricsSample`] stamped with the cycle-start wall clock, evaluates
//! status, submits to the store, and publishes to the fabric. Cycles never
//! overlap for a server — a cycle that outruns the period makes the next
//! tick skip. Repeated total failures put the server into exponential
//! backoff; a single success resets it.

mod rates;

pub use rates::RateState;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::parsers;
use crate::commands::{CommandExecutor, CommandKey};
use crate::config::Config;
use crate::errors::CommandError;
use crate::status::{Observation, StatusEvaluator, StatusEvent};
use crate::store::SampleStore;
use crate::types::{
    CpuRecord, MetricsSample, NetworkRecord, Server, ServerId, SystemInfo,
};

const SYSINFO_REFRESH: Duration = Duration::from_secs(24 * 60 * 60);
const BACKOFF_STEPS: [u64; 6] = [2, 4, 8, 16, 32, 60];

/// Where finished samples and status transitions go. The push fabric
/// implements this; tests plug in a recorder.
pub trait SamplePublisher: Send + Sync {
    /// Must not block: enqueue-only.
    fn publish_sample(&self, sample: &Arc<MetricsSample>);
    fn publish_status(&self, event: &StatusEvent);
}

/// No-op publisher for headless operation and tests.
pub struct NullPublisher;

impl SamplePublisher for NullPublisher {
    fn publish_sample(&self, _sample: &Arc<MetricsSample>) {}
    fn publish_status(&self, _event: &StatusEvent) {}
}

struct ServerTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Slow-changing host facts, readable by the REST adapter.
#[derive(Default)]
pub struct SystemInfoCache {
    entries: RwLock<HashMap<ServerId, SystemInfo>>,
}

impl SystemInfoCache {
    pub fn get(&self, server_id: &ServerId) -> Option<SystemInfo> {
        self.entries.read().unwrap().get(server_id).cloned()
    }

    fn put(&self, server_id: ServerId, info: SystemInfo) {
        self.entries.write().unwrap().insert(server_id, info);
    }

    fn remove(&self, server_id: &ServerId) {
        self.entries.write().unwrap().remove(server_id);
    }
}

pub struct CollectorScheduler {
    executor: Arc<CommandExecutor>,
    store: Arc<SampleStore>,
    evaluator: Arc<StatusEvaluator>,
    publisher: Arc<dyn SamplePublisher>,
    sysinfo: Arc<SystemInfoCache>,
    config: Arc<Config>,
    root_token: CancellationToken,
    tasks: Mutex<HashMap<ServerId, ServerTask>>,
}

impl CollectorScheduler {
    pub fn new(
        executor: Arc<CommandExecutor>,
        store: Arc<SampleStore>,
        evaluator: Arc<StatusEvaluator>,
        publisher: Arc<dyn SamplePublisher>,
        config: Arc<Config>,
        root_token: CancellationToken,
    ) -> Self {
        Self {
            executor,
            store,
            evaluator,
            publisher,
            sysinfo: Arc::new(SystemInfoCache::default()),
            config,
            root_token,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn sysinfo_cache(&self) -> Arc<SystemInfoCache> {
        self.sysinfo.clone()
    }

    /// Start (or restart) the collection task for a server.
    pub fn add_server(&self, server: Server) {
        if !server.monitoring_enabled || server.is_deleted() {
            debug!(server_id = %server.id, "server not eligible for collection");
            return;
        }

        let token = self.root_token.child_token();
        let worker = ServerWorker {
            server: server.clone(),
            executor: self.executor.clone(),
            store: self.store.clone(),
            evaluator: self.evaluator.clone(),
            publisher: self.publisher.clone(),
            sysinfo: self.sysinfo.clone(),
            config: self.config.clone(),
        };
        let task_token = token.clone();
        let handle = tokio::spawn(async move { worker.run(task_token).await });

        let mut tasks = self.tasks.lock().unwrap();
        if let Some(old) = tasks.insert(server.id.clone(), ServerTask { token, handle }) {
            old.token.cancel();
            old.handle.abort();
            info!(server_id = %server.id, "replaced existing collection task");
        } else {
            info!(server_id = %server.id, "collection task started");
        }
    }

    /// Cancel the server's task and drop its derived state. Pending I/O is
    /// aborted cooperatively; in-flight leases drain through the pool's own
    /// grace handling.
    pub async fn remove_server(&self, server_id: &ServerId) {
        let task = self.tasks.lock().unwrap().remove(server_id);
        if let Some(task) = task {
            task.token.cancel();
            if tokio::time::timeout(Duration::from_secs(5), task.handle)
                .await
                .is_err()
            {
                warn!(server_id = %server_id, "collection task did not stop within grace");
            }
        }
        self.evaluator.forget(server_id);
        self.sysinfo.remove(server_id);
        info!(server_id = %server_id, "collection task removed");
    }

    /// Ordered shutdown: cancel every task and wait briefly for each.
    pub async fn shutdown(&self) {
        let tasks: Vec<(ServerId, ServerTask)> =
            self.tasks.lock().unwrap().drain().collect();
        for (server_id, task) in tasks {
            task.token.cancel();
            if tokio::time::timeout(Duration::from_secs(5), task.handle)
                .await
                .is_err()
            {
                warn!(server_id = %server_id, "collection task did not stop at shutdown");
            }
        }
        info!("collector scheduler stopped");
    }

    pub fn active_servers(&self) -> Vec<ServerId> {
        self.tasks.lock().unwrap().keys().cloned().collect()
    }
}

/// The per-server collection loop and its cycle-to-cycle state.
struct ServerWorker {
    server: Server,
    executor: Arc<CommandExecutor>,
    store: Arc<SampleStore>,
    evaluator: Arc<StatusEvaluator>,
    publisher: Arc<dyn SamplePublisher>,
    sysinfo: Arc<SystemInfoCache>,
    config: Arc<Config>,
}

impl ServerWorker {
    async fn run(self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.collection_period());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut rates = RateState::default();
        let mut seq: u64 = 0;
        let mut consecutive_failures: u32 = 0;
        let mut backoff_until: Option<tokio::time::Instant> = None;
        let mut sysinfo_due = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(server_id = %self.server.id, "collection task cancelled");
                    return;
                }
                _ = interval.tick() => {}
            }

            if let Some(until) = backoff_until {
                if tokio::time::Instant::now() < until {
                    debug!(server_id = %self.server.id, "tick skipped during backoff");
                    continue;
                }
                backoff_until = None;
            }

            seq += 1;
            let want_sysinfo = tokio::time::Instant::now() >= sysinfo_due;
            let outcome = tokio::select! {
                _ = token.cancelled() => return,
                outcome = tokio::time::timeout(
                    self.config.cycle_budget(),
                    self.cycle(seq, &mut rates, want_sysinfo),
                ) => outcome,
            };

            match outcome {
                Ok(CycleOutcome::Collected { sysinfo_refreshed }) => {
                    consecutive_failures = 0;
                    if sysinfo_refreshed {
                        sysinfo_due = tokio::time::Instant::now() + SYSINFO_REFRESH;
                    }
                }
                Ok(CycleOutcome::Failed { reason }) => {
                    consecutive_failures += 1;
                    let delay = BACKOFF_STEPS
                        [(consecutive_failures as usize - 1).min(BACKOFF_STEPS.len() - 1)];
                    backoff_until =
                        Some(tokio::time::Instant::now() + Duration::from_secs(delay));
                    warn!(
                        server_id = %self.server.id,
                        reason,
                        failures = consecutive_failures,
                        backoff_secs = delay,
                        "collection cycle failed"
                    );
                    if let Some(event) = self
                        .evaluator
                        .observe(&self.server.id, Observation::Failure { reason })
                    {
                        self.publisher.publish_status(&event);
                    }
                }
                Err(_) => {
                    consecutive_failures += 1;
                    warn!(
                        server_id = %self.server.id,
                        budget_secs = self.config.cycle_budget().as_secs(),
                        "collection cycle exceeded its budget; next tick skipped"
                    );
                    if let Some(event) = self.evaluator.observe(
                        &self.server.id,
                        Observation::Failure {
                            reason: "collection_timeout",
                        },
                    ) {
                        self.publisher.publish_status(&event);
                    }
                }
            }
        }
    }

    /// One collection cycle. All commands run in parallel; the sample is
    /// stamped with the wall clock at cycle start so every metric in it
    /// shares one axis point.
    async fn cycle(
        &self,
        seq: u64,
        rates: &mut RateState,
        want_sysinfo: bool,
    ) -> CycleOutcome {
        let timestamp_ms = Utc::now().timestamp_millis();

        let (cpu_raw, load_raw, uptime_raw, memory_raw, disk_raw, network_raw) = tokio::join!(
            self.executor.execute(&self.server, CommandKey::Cpu),
            self.executor.execute(&self.server, CommandKey::Load),
            self.executor.execute(&self.server, CommandKey::Uptime),
            self.executor.execute(&self.server, CommandKey::Memory),
            self.executor.execute(&self.server, CommandKey::Disk),
            self.executor.execute(&self.server, CommandKey::Network),
        );

        let results = [
            &cpu_raw,
            &load_raw,
            &uptime_raw,
            &memory_raw,
            &disk_raw,
            &network_raw,
        ];
        if results.iter().all(|r| r.is_err()) {
            // Nothing collected at all: no sample, just a failure
            // observation with the most specific reason available.
            let reason = results
                .iter()
                .find_map(|r| match r {
                    Err(CommandError::Connectivity(e)) => Some(e.reason_code()),
                    Err(CommandError::Credential(_)) => Some("credential_error"),
                    _ => None,
                })
                .unwrap_or("collection_failed");
            return CycleOutcome::Failed { reason };
        }

        let cpu = self.assemble_cpu(&cpu_raw, &load_raw, &uptime_raw, rates);
        let memory = memory_raw
            .as_ref()
            .ok()
            .map(|raw| parsers::parse_meminfo(&raw.stdout).0);
        let disk = disk_raw
            .as_ref()
            .ok()
            .map(|raw| parsers::parse_df_bytes(&raw.stdout).0);
        let network = self.assemble_network(&network_raw, timestamp_ms, rates);

        let mut sysinfo_refreshed = false;
        if want_sysinfo {
            if let Ok(raw) = self.executor.execute(&self.server, CommandKey::SysInfo).await {
                let (info, warnings) = parsers::parse_sysinfo(&raw.stdout);
                if !warnings.is_empty() {
                    debug!(server_id = %self.server.id, count = warnings.len(), "sysinfo parse warnings");
                }
                self.sysinfo.put(self.server.id.clone(), info);
                sysinfo_refreshed = true;
            }
        }

        let mut sample = MetricsSample {
            server_id: self.server.id.clone(),
            timestamp_ms,
            seq,
            cpu,
            memory,
            disk,
            network,
            status: self.evaluator.current(&self.server.id),
        };

        if let Some(event) = self
            .evaluator
            .observe(&self.server.id, Observation::Sample(&sample))
        {
            self.publisher.publish_status(&event);
        }
        sample.status = self.evaluator.current(&self.server.id);

        match self.store.submit(sample) {
            Ok(stored) => {
                self.publisher.publish_sample(&stored);
            }
            Err(e) => {
                // Out-of-order samples are logged and dropped; the cycle
                // itself still counts as a success.
                warn!(server_id = %self.server.id, "sample rejected: {e}");
            }
        }

        CycleOutcome::Collected { sysinfo_refreshed }
    }

    fn assemble_cpu(
        &self,
        cpu_raw: &Result<crate::commands::RawOutput, CommandError>,
        load_raw: &Result<crate::commands::RawOutput, CommandError>,
        uptime_raw: &Result<crate::commands::RawOutput, CommandError>,
        rates: &mut RateState,
    ) -> Option<CpuRecord> {
        let raw = cpu_raw.as_ref().ok()?;
        let (ticks, mut warnings) = parsers::parse_proc_stat(&raw.stdout);

        let (usage_percent, warmup) = match ticks {
            Some(current) => rates.cpu_usage(current),
            None => (None, false),
        };

        let load = load_raw.as_ref().ok().and_then(|raw| {
            let (load, w) = parsers::parse_loadavg(&raw.stdout);
            warnings.extend(w);
            load
        });
        let uptime = uptime_raw.as_ref().ok().and_then(|raw| {
            let (secs, w) = parsers::parse_proc_uptime(&raw.stdout);
            warnings.extend(w);
            secs
        });

        let cores = self
            .sysinfo
            .get(&self.server.id)
            .and_then(|info| info.cpu_cores);

        Some(CpuRecord {
            usage_percent,
            cores,
            load_1m: load.map(|l| l.0),
            load_5m: load.map(|l| l.1),
            load_15m: load.map(|l| l.2),
            uptime_secs: uptime,
            warmup,
            warnings,
        })
    }

    fn assemble_network(
        &self,
        network_raw: &Result<crate::commands::RawOutput, CommandError>,
        timestamp_ms: i64,
        rates: &mut RateState,
    ) -> Option<NetworkRecord> {
        let raw = network_raw.as_ref().ok()?;
        let (mut record, _warnings) = parsers::parse_proc_net_dev(&raw.stdout);
        rates.apply_network_rates(&mut record, timestamp_ms);
        Some(record)
    }
}

enum CycleOutcome {
    Collected { sysinfo_refreshed: bool },
    Failed { reason: &'static str },
}
