//! Parser for `/proc/meminfo`.
//!
//! Values in meminfo are kibibytes; the record carries bytes. Used memory is
//! total minus available, matching what `free` reports, so cache and
//! buffers do not count as pressure.

use std::collections::HashMap;

use crate::types::{MemoryRecord, ParseWarning};

pub fn parse_meminfo(stdout: &str) -> (MemoryRecord, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let mut fields: HashMap<&str, u64> = HashMap::new();

    for line in stdout.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        // Token layout: `MemTotal:       16384000 kB` — the first numeric
        // token after the colon is the value in kB.
        if let Some(value) = rest.split_whitespace().next() {
            match value.parse::<u64>() {
                Ok(kb) => {
                    fields.insert(key.trim(), kb);
                }
                Err(_) => {
                    warnings.push(ParseWarning::new(
                        format!("memory.{}", key.trim()),
                        format!("non-numeric meminfo value: {value:?}"),
                    ));
                }
            }
        }
    }

    let bytes = |key: &str| fields.get(key).map(|kb| kb * 1024);

    let total = bytes("MemTotal");
    // MemAvailable appeared in 3.14; fall back to MemFree on older kernels.
    let available = bytes("MemAvailable").or_else(|| bytes("MemFree"));
    let used = match (total, available) {
        (Some(t), Some(a)) => Some(t.saturating_sub(a)),
        _ => None,
    };
    let usage_percent = match (used, total) {
        (Some(u), Some(t)) if t > 0 => Some((u as f64 / t as f64) * 100.0),
        _ => None,
    };

    let swap_total = bytes("SwapTotal");
    let swap_free = bytes("SwapFree");
    let swap_used = match (swap_total, swap_free) {
        (Some(t), Some(f)) => Some(t.saturating_sub(f)),
        _ => None,
    };
    let swap_usage_percent = match (swap_used, swap_total) {
        (Some(u), Some(t)) if t > 0 => Some((u as f64 / t as f64) * 100.0),
        (_, Some(0)) => Some(0.0),
        _ => None,
    };

    if total.is_none() {
        warnings.push(ParseWarning::new("memory.total_bytes", "MemTotal missing"));
    }

    let record = MemoryRecord {
        total_bytes: total,
        used_bytes: used,
        available_bytes: available,
        cached_bytes: bytes("Cached"),
        buffers_bytes: bytes("Buffers"),
        usage_percent,
        swap_total_bytes: swap_total,
        swap_used_bytes: swap_used,
        swap_usage_percent,
        warnings: warnings.clone(),
    };

    (record, warnings)
}
