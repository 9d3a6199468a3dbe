//! Parser for `df -B1` output.
//!
//! Pseudo-filesystems and mounts that do not represent real capacity are
//! filtered out; the aggregate usage percent is computed over what remains.

use crate::types::{DiskPartition, DiskRecord, ParseWarning};

const EXCLUDED_MOUNTPOINTS: [&str; 4] = ["/dev", "/sys", "/proc", "/run"];

pub fn parse_df_bytes(stdout: &str) -> (DiskRecord, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let mut partitions = Vec::new();

    let mut lines = stdout.lines();
    if lines.next().is_none() {
        warnings.push(ParseWarning::new("disk", "empty df output"));
        return (
            DiskRecord {
                partitions,
                total_bytes: None,
                used_bytes: None,
                usage_percent: None,
                warnings: warnings.clone(),
            },
            warnings,
        );
    }

    for line in lines {
        // Token layout: filesystem, 1B-blocks, used, available, use%, mount.
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 6 {
            if !line.trim().is_empty() {
                warnings.push(ParseWarning::new(
                    "disk.partitions",
                    format!("short df line: {line:?}"),
                ));
            }
            continue;
        }

        let filesystem = tokens[0];
        let mountpoint = tokens[5];

        if !filesystem.starts_with("/dev/")
            || filesystem.contains("loop")
            || EXCLUDED_MOUNTPOINTS.contains(&mountpoint)
            || mountpoint.starts_with("/snap")
        {
            continue;
        }

        let parsed = (
            tokens[1].parse::<u64>(),
            tokens[2].parse::<u64>(),
            tokens[3].parse::<u64>(),
        );
        let (Ok(total), Ok(used), Ok(free)) = parsed else {
            warnings.push(ParseWarning::new(
                "disk.partitions",
                format!("non-numeric df sizes on {filesystem}"),
            ));
            continue;
        };

        let usage_percent = if total > 0 {
            (used as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        partitions.push(DiskPartition {
            filesystem: filesystem.to_string(),
            mountpoint: mountpoint.to_string(),
            total_bytes: total,
            used_bytes: used,
            free_bytes: free,
            usage_percent,
        });
    }

    let (total_bytes, used_bytes, usage_percent) = if partitions.is_empty() {
        warnings.push(ParseWarning::new("disk", "no real filesystems in df output"));
        (None, None, None)
    } else {
        let total: u64 = partitions.iter().map(|p| p.total_bytes).sum();
        let used: u64 = partitions.iter().map(|p| p.used_bytes).sum();
        let pct = if total > 0 {
            Some((used as f64 / total as f64) * 100.0)
        } else {
            Some(0.0)
        };
        (Some(total), Some(used), pct)
    };

    let record = DiskRecord {
        partitions,
        total_bytes,
        used_bytes,
        usage_percent,
        warnings: warnings.clone(),
    };
    (record, warnings)
}
