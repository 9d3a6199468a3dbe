//! Sample builders used across the integration tests.

use std::sync::Arc;

use cwatcher::types::{
    CpuRecord, DiskRecord, MemoryRecord, MetricsSample, NetworkRecord, ServerStatus,
};

pub fn cpu_record(usage: f64) -> CpuRecord {
    CpuRecord {
        usage_percent: Some(usage),
        cores: Some(8),
        load_1m: Some(0.4),
        load_5m: Some(0.3),
        load_15m: Some(0.2),
        uptime_secs: Some(86_400.0),
        warmup: false,
        warnings: Vec::new(),
    }
}

pub fn memory_record(used: u64, total: u64) -> MemoryRecord {
    MemoryRecord {
        total_bytes: Some(total),
        used_bytes: Some(used),
        available_bytes: Some(total - used),
        cached_bytes: None,
        buffers_bytes: None,
        usage_percent: Some(used as f64 / total as f64 * 100.0),
        swap_total_bytes: Some(0),
        swap_used_bytes: Some(0),
        swap_usage_percent: Some(0.0),
        warnings: Vec::new(),
    }
}

pub fn disk_record() -> DiskRecord {
    DiskRecord {
        partitions: Vec::new(),
        total_bytes: Some(500_000_000_000),
        used_bytes: Some(250_000_000_000),
        usage_percent: Some(50.0),
        warnings: Vec::new(),
    }
}

pub fn network_record() -> NetworkRecord {
    NetworkRecord {
        interfaces: Vec::new(),
        warnings: Vec::new(),
    }
}

/// A complete sample with the given cpu usage and memory used bytes.
pub fn full_sample(server: &str, seq: u64, ts_ms: i64, cpu: f64, mem_used: u64) -> MetricsSample {
    MetricsSample {
        server_id: server.to_string(),
        timestamp_ms: ts_ms,
        seq,
        cpu: Some(cpu_record(cpu)),
        memory: Some(memory_record(mem_used, 16_000_000_000)),
        disk: Some(disk_record()),
        network: Some(network_record()),
        status: ServerStatus::Online,
    }
}

pub fn arc_sample(server: &str, seq: u64, ts_ms: i64, cpu: f64) -> Arc<MetricsSample> {
    Arc::new(full_sample(server, seq, ts_ms, cpu, 5_368_709_120))
}
