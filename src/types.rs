//! Shared domain types: registered servers, metric records, samples, status.
//!
//! Wire-facing structs serialize absent fields as `null`, never zero — a
//! metric that could not be collected is `missing`, which downstream
//! rendering must be able to distinguish from a measured zero.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vault::EncryptedSecret;

/// Stable identifier of a registered server.
pub type ServerId = String;

/// How the server authenticates the SSH user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Password,
    Key,
}

/// A registered target host.
///
/// The encrypted secret is never serialized outward; `list_servers` and the
/// web adapter work with [`ServerView`].
#[derive(Debug, Clone)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    pub secret: EncryptedSecret,
    pub tags: Vec<String>,
    pub monitoring_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Server {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Outward-facing projection of a [`Server`] with the secret stripped.
#[derive(Debug, Clone, Serialize)]
pub struct ServerView {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    pub tags: Vec<String>,
    pub monitoring_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Server> for ServerView {
    fn from(s: &Server) -> Self {
        Self {
            id: s.id.clone(),
            name: s.name.clone(),
            host: s.host.clone(),
            port: s.port,
            username: s.username.clone(),
            auth_kind: s.auth_kind,
            tags: s.tags.clone(),
            monitoring_enabled: s.monitoring_enabled,
            created_at: s.created_at,
        }
    }
}

/// The four collected metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::Disk,
        MetricKind::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::Disk => "disk",
            MetricKind::Network => "network",
        }
    }
}

/// Non-fatal parser diagnostics, attached to the record they concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    pub field: String,
    pub detail: String,
}

impl ParseWarning {
    pub fn new(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            detail: detail.into(),
        }
    }
}

/// CPU metrics for one sample.
///
/// `usage_percent` is a delta between two consecutive `/proc/stat` reads, so
/// the first sample after (re)connect carries `warmup = true` and no usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuRecord {
    pub usage_percent: Option<f64>,
    pub cores: Option<u32>,
    pub load_1m: Option<f64>,
    pub load_5m: Option<f64>,
    pub load_15m: Option<f64>,
    pub uptime_secs: Option<f64>,
    pub warmup: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub total_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub available_bytes: Option<u64>,
    pub cached_bytes: Option<u64>,
    pub buffers_bytes: Option<u64>,
    pub usage_percent: Option<f64>,
    pub swap_total_bytes: Option<u64>,
    pub swap_used_bytes: Option<u64>,
    pub swap_usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskPartition {
    pub filesystem: String,
    pub mountpoint: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRecord {
    pub partitions: Vec<DiskPartition>,
    pub total_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ParseWarning>,
}

/// Per-interface counters and derived rates.
///
/// `rx_bytes`/`tx_bytes` are the raw cumulative counters from
/// `/proc/net/dev`; `rx_bps`/`tx_bps` are differenced against the previous
/// cycle by the collector and are absent on the warmup sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_bps: Option<f64>,
    pub tx_bps: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub interfaces: Vec<NetworkInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ParseWarning>,
}

/// Slow-changing host facts, refreshed on first connect and daily.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub cpu_threads: Option<u32>,
    pub total_ram_bytes: Option<u64>,
    pub interfaces: Vec<String>,
    pub collected_at: DateTime<Utc>,
}

/// Derived per-server health.
/// Severity-ordered: a subscription's `min_status` filter and the worst-band
/// fold both rely on the derived ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Unknown,
    Online,
    Warning,
    Critical,
    Offline,
}

impl Default for ServerStatus {
    fn default() -> Self {
        ServerStatus::Unknown
    }
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Unknown => "unknown",
            ServerStatus::Online => "online",
            ServerStatus::Warning => "warning",
            ServerStatus::Critical => "critical",
            ServerStatus::Offline => "offline",
        }
    }
}

/// One collection cycle's result. Immutable once produced.
///
/// All metric records within a sample share the cycle-start timestamp so
/// downstream chart axes align; per-command elapsed time is a debug field on
/// the raw output only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub server_id: ServerId,
    /// Wall-clock milliseconds since the Unix epoch, taken at cycle start.
    pub timestamp_ms: i64,
    /// Per-server monotonic sequence number.
    pub seq: u64,
    pub cpu: Option<CpuRecord>,
    pub memory: Option<MemoryRecord>,
    pub disk: Option<DiskRecord>,
    pub network: Option<NetworkRecord>,
    pub status: ServerStatus,
}

impl MetricsSample {
    /// A sample is complete when every enabled metric kind was collected.
    pub fn is_complete(&self) -> bool {
        self.cpu.is_some() && self.memory.is_some() && self.disk.is_some() && self.network.is_some()
    }

    pub fn has_metric(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Cpu => self.cpu.is_some(),
            MetricKind::Memory => self.memory.is_some(),
            MetricKind::Disk => self.disk.is_some(),
            MetricKind::Network => self.network.is_some(),
        }
    }
}

/// Inclusive time range over sample timestamps, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from_ms: i64,
    pub to_ms: i64,
}

impl TimeRange {
    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.from_ms && ts_ms <= self.to_ms
    }
}
