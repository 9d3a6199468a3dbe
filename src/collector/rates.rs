//! Cycle-to-cycle counter state for one server.
//!
//! CPU usage and network byte-rates are deltas over consecutive cycles, so
//! the first cycle after (re)start is a warmup: the CPU record carries
//! `warmup = true` with no usage figure, and interface rates are absent.

use std::collections::HashMap;

use crate::commands::parsers::{rate_between, CpuTicks};
use crate::types::NetworkRecord;

#[derive(Debug, Clone, Copy)]
struct InterfaceCounters {
    rx_bytes: u64,
    tx_bytes: u64,
}

#[derive(Debug, Default)]
pub struct RateState {
    prev_cpu: Option<CpuTicks>,
    prev_interfaces: HashMap<String, InterfaceCounters>,
    prev_network_ts_ms: Option<i64>,
}

impl RateState {
    /// Busy-percent since the previous snapshot. Returns `(usage, warmup)`.
    pub fn cpu_usage(&mut self, current: CpuTicks) -> (Option<f64>, bool) {
        let usage = match self.prev_cpu {
            Some(prev) => current.usage_since(&prev),
            None => None,
        };
        let warmup = self.prev_cpu.is_none();
        self.prev_cpu = Some(current);
        (usage, warmup)
    }

    /// Fill in per-interface rx/tx rates by differencing cumulative counters
    /// against the previous cycle. Counter decreases are treated as u64
    /// wraparound. Interfaces that vanished simply drop their state;
    /// interfaces that appeared start their own warmup.
    pub fn apply_network_rates(&mut self, record: &mut NetworkRecord, timestamp_ms: i64) {
        let elapsed_secs = self
            .prev_network_ts_ms
            .map(|prev| (timestamp_ms - prev) as f64 / 1000.0);

        let mut next = HashMap::with_capacity(record.interfaces.len());
        for iface in &mut record.interfaces {
            if let (Some(elapsed), Some(prev)) =
                (elapsed_secs, self.prev_interfaces.get(&iface.name))
            {
                iface.rx_bps = rate_between(prev.rx_bytes, iface.rx_bytes, elapsed);
                iface.tx_bps = rate_between(prev.tx_bytes, iface.tx_bytes, elapsed);
            }
            next.insert(
                iface.name.clone(),
                InterfaceCounters {
                    rx_bytes: iface.rx_bytes,
                    tx_bytes: iface.tx_bytes,
                },
            );
        }
        self.prev_interfaces = next;
        self.prev_network_ts_ms = Some(timestamp_ms);
    }
}
