//! Parsers for `/proc/stat`, `/proc/loadavg`, and `/proc/uptime`.
//!
//! CPU usage is a delta between two consecutive tick snapshots; this module
//! only extracts the counters. The collector holds the previous snapshot and
//! computes the busy ratio, flagging the first sample as warmup.

use crate::types::ParseWarning;

/// Aggregate CPU tick counters from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTicks {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTicks {
    pub fn total(&self) -> u64 {
        self.user
            .wrapping_add(self.nice)
            .wrapping_add(self.system)
            .wrapping_add(self.idle)
            .wrapping_add(self.iowait)
            .wrapping_add(self.irq)
            .wrapping_add(self.softirq)
            .wrapping_add(self.steal)
    }

    pub fn idle_total(&self) -> u64 {
        self.idle.wrapping_add(self.iowait)
    }

    /// Busy ratio over the interval since `prev`, as a percentage clamped to
    /// 0.0–100.0. `None` when the counters did not advance.
    pub fn usage_since(&self, prev: &CpuTicks) -> Option<f64> {
        let total_delta = self.total().wrapping_sub(prev.total());
        if total_delta == 0 {
            return None;
        }
        let idle_delta = self.idle_total().wrapping_sub(prev.idle_total());
        let busy = total_delta.saturating_sub(idle_delta);
        Some(((busy as f64 / total_delta as f64) * 100.0).clamp(0.0, 100.0))
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
pub fn parse_proc_stat(stdout: &str) -> (Option<CpuTicks>, Vec<ParseWarning>) {
    let mut warnings = Vec::new();

    let Some(first) = stdout.lines().next() else {
        warnings.push(ParseWarning::new("cpu", "empty /proc/stat output"));
        return (None, warnings);
    };

    let tokens: Vec<&str> = first.split_whitespace().collect();
    if tokens.first() != Some(&"cpu") || tokens.len() < 5 {
        warnings.push(ParseWarning::new(
            "cpu",
            format!("unexpected /proc/stat first line: {first:?}"),
        ));
        return (None, warnings);
    }

    let field = |idx: usize| -> u64 {
        tokens
            .get(idx)
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(0)
    };

    // Fields past `idle` appeared in later kernels; absent ones are zero.
    let ticks = CpuTicks {
        user: field(1),
        nice: field(2),
        system: field(3),
        idle: field(4),
        iowait: field(5),
        irq: field(6),
        softirq: field(7),
        steal: field(8),
    };

    if tokens[1].parse::<u64>().is_err() {
        warnings.push(ParseWarning::new(
            "cpu.user",
            format!("non-numeric tick value: {:?}", tokens[1]),
        ));
        return (None, warnings);
    }

    (Some(ticks), warnings)
}

/// Parse `/proc/loadavg`: `0.15 0.10 0.05 1/123 456`.
pub fn parse_loadavg(stdout: &str) -> (Option<(f64, f64, f64)>, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let tokens: Vec<&str> = stdout.split_whitespace().collect();

    if tokens.len() < 3 {
        warnings.push(ParseWarning::new(
            "load",
            format!("expected 3 load fields, got {}", tokens.len()),
        ));
        return (None, warnings);
    }

    match (
        tokens[0].parse::<f64>(),
        tokens[1].parse::<f64>(),
        tokens[2].parse::<f64>(),
    ) {
        (Ok(a), Ok(b), Ok(c)) => (Some((a, b, c)), warnings),
        _ => {
            warnings.push(ParseWarning::new(
                "load",
                format!("non-numeric load values: {:?}", &tokens[..3]),
            ));
            (None, warnings)
        }
    }
}

/// Parse `/proc/uptime`: seconds-up followed by idle seconds.
pub fn parse_proc_uptime(stdout: &str) -> (Option<f64>, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    match stdout.split_whitespace().next().map(str::parse::<f64>) {
        Some(Ok(secs)) if secs >= 0.0 => (Some(secs), warnings),
        _ => {
            warnings.push(ParseWarning::new(
                "uptime",
                format!("unparseable /proc/uptime: {:?}", stdout.trim()),
            ));
            (None, warnings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_STAT: &str = "\
cpu  74608 2520 24433 1117073 6176 0 5546 1000 0 0
cpu0 17825 287 6112 279459 1605 0 2021 250 0 0
intr 5817202 57 10 0 0 0 0 0 0 1 0 0 0 0 0 0 0
ctxt 12087977
btime 1703155000";

    #[test]
    fn parses_aggregate_cpu_line() {
        let (ticks, warnings) = parse_proc_stat(PROC_STAT);
        assert!(warnings.is_empty());
        let ticks = ticks.unwrap();
        assert_eq!(ticks.user, 74608);
        assert_eq!(ticks.idle, 1117073);
        assert_eq!(ticks.iowait, 6176);
        assert_eq!(ticks.steal, 1000);
    }

    #[test]
    fn usage_delta_between_snapshots() {
        let prev = CpuTicks {
            user: 100,
            system: 50,
            idle: 850,
            ..Default::default()
        };
        let curr = CpuTicks {
            user: 160,
            system: 80,
            idle: 910,
            ..Default::default()
        };
        // busy delta = 90, total delta = 150 -> 60%
        let usage = curr.usage_since(&prev).unwrap();
        assert!((usage - 60.0).abs() < 1e-9);
    }

    #[test]
    fn unchanged_counters_yield_no_usage() {
        let ticks = CpuTicks {
            user: 1,
            idle: 1,
            ..Default::default()
        };
        assert_eq!(ticks.usage_since(&ticks), None);
    }

    #[test]
    fn missing_fields_on_old_kernels_default_to_zero() {
        // Pre-2.6 kernels expose only user/nice/system/idle.
        let (ticks, warnings) = parse_proc_stat("cpu  10 20 30 40\n");
        assert!(warnings.is_empty());
        let ticks = ticks.unwrap();
        assert_eq!(ticks.iowait, 0);
        assert_eq!(ticks.steal, 0);
        assert_eq!(ticks.total(), 100);
    }

    #[test]
    fn garbage_input_warns_instead_of_panicking() {
        let (ticks, warnings) = parse_proc_stat("not proc stat at all");
        assert!(ticks.is_none());
        assert_eq!(warnings.len(), 1);

        let (ticks, warnings) = parse_proc_stat("");
        assert!(ticks.is_none());
        assert!(!warnings.is_empty());
    }

    #[test]
    fn parses_loadavg() {
        let (load, warnings) = parse_loadavg("0.52 0.58 0.59 1/467 12345\n");
        assert!(warnings.is_empty());
        assert_eq!(load, Some((0.52, 0.58, 0.59)));
    }

    #[test]
    fn short_loadavg_warns() {
        let (load, warnings) = parse_loadavg("0.52\n");
        assert!(load.is_none());
        assert_eq!(warnings[0].field, "load");
    }

    #[test]
    fn parses_uptime() {
        let (secs, warnings) = parse_proc_uptime("351735.21 6873043.91\n");
        assert!(warnings.is_empty());
        assert_eq!(secs, Some(351735.21));
    }
}
