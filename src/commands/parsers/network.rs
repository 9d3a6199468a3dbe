//! Parser for `/proc/net/dev` and the counter-rate arithmetic.
//!
//! The kernel exposes cumulative per-interface byte counters; rates come
//! from differencing consecutive cycles. Counters are u64 and wrap — a
//! decrease is treated as wraparound and the modular delta is used, so a
//! wrap never produces a negative or absurd rate.

use crate::types::{NetworkInterface, NetworkRecord, ParseWarning};

pub fn parse_proc_net_dev(stdout: &str) -> (NetworkRecord, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let mut interfaces = Vec::new();

    // First two lines are headers.
    for line in stdout.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            if !line.trim().is_empty() {
                warnings.push(ParseWarning::new(
                    "network.interfaces",
                    format!("unexpected /proc/net/dev line: {line:?}"),
                ));
            }
            continue;
        };
        let name = name.trim();

        // Receive: bytes packets errs drop fifo frame compressed multicast,
        // then transmit: bytes packets errs drop fifo colls carrier compressed.
        let tokens: Vec<&str> = counters.split_whitespace().collect();
        if tokens.len() < 16 {
            warnings.push(ParseWarning::new(
                "network.interfaces",
                format!("short counter row for {name}: {} fields", tokens.len()),
            ));
            continue;
        }

        let field = |idx: usize| -> Option<u64> { tokens[idx].parse::<u64>().ok() };
        let (Some(rx_bytes), Some(tx_bytes)) = (field(0), field(8)) else {
            warnings.push(ParseWarning::new(
                "network.interfaces",
                format!("non-numeric byte counters for {name}"),
            ));
            continue;
        };

        interfaces.push(NetworkInterface {
            name: name.to_string(),
            rx_bytes,
            tx_bytes,
            rx_packets: field(1).unwrap_or(0),
            tx_packets: field(9).unwrap_or(0),
            rx_errors: field(2).unwrap_or(0),
            tx_errors: field(10).unwrap_or(0),
            rx_bps: None,
            tx_bps: None,
        });
    }

    if interfaces.is_empty() {
        warnings.push(ParseWarning::new("network", "no interfaces parsed"));
    }

    let record = NetworkRecord {
        interfaces,
        warnings: warnings.clone(),
    };
    (record, warnings)
}

/// Bytes-per-second between two cumulative counter readings. A decrease is
/// wraparound on the counter's width, so the delta is taken mod 2^64.
pub fn rate_between(prev: u64, curr: u64, elapsed_secs: f64) -> Option<f64> {
    if elapsed_secs <= 0.0 {
        return None;
    }
    let delta = curr.wrapping_sub(prev);
    Some(delta as f64 / elapsed_secs)
}
