//! Parser for the composite sysinfo command.
//!
//! The command emits one line per probe in a fixed order: kernel name,
//! kernel release, machine, OS, os-release PRETTY_NAME, hostname, nproc,
//! first `model name` line of /proc/cpuinfo, processor count, MemTotal
//! line, and the interface listing from /sys/class/net. Probes that fail on
//! the target leave their fields missing.

use chrono::Utc;

use crate::types::{ParseWarning, SystemInfo};

/// Zero-based line positions of the fixed probes.
const LINE_KERNEL_NAME: usize = 0;
const LINE_KERNEL_RELEASE: usize = 1;
const LINE_MACHINE: usize = 2;
const LINE_OS: usize = 3;
const LINE_PRETTY_NAME: usize = 4;
const LINE_HOSTNAME: usize = 5;
const LINE_NPROC: usize = 6;
const LINE_CPU_MODEL: usize = 7;
const LINE_CPU_THREADS: usize = 8;
const LINE_MEM_TOTAL: usize = 9;
const LINE_INTERFACES: usize = 10;

pub fn parse_sysinfo(stdout: &str) -> (SystemInfo, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let lines: Vec<&str> = stdout.lines().collect();

    let line = |idx: usize| -> Option<&str> {
        lines.get(idx).map(|l| l.trim()).filter(|l| !l.is_empty())
    };

    if lines.len() < LINE_HOSTNAME + 1 {
        warnings.push(ParseWarning::new(
            "sysinfo",
            format!("expected at least {} probe lines, got {}", LINE_HOSTNAME + 1, lines.len()),
        ));
    }

    let kernel = match (line(LINE_KERNEL_NAME), line(LINE_KERNEL_RELEASE)) {
        (Some(n), Some(r)) => Some(format!("{n} {r}")),
        (Some(n), None) => Some(n.to_string()),
        _ => None,
    };

    // `PRETTY_NAME="Debian GNU/Linux 12 (bookworm)"`; the probe echoes an
    // empty line when /etc/os-release is absent.
    let os_version = line(LINE_PRETTY_NAME).and_then(|l| {
        l.strip_prefix("PRETTY_NAME=")
            .map(|v| v.trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    });

    let os_name = line(LINE_OS)
        .map(str::to_string)
        .or_else(|| line(LINE_MACHINE).map(str::to_string));

    let cores = line(LINE_NPROC).and_then(|l| l.parse::<u32>().ok());
    if line(LINE_NPROC).is_some() && cores.is_none() {
        warnings.push(ParseWarning::new(
            "sysinfo.cpu_cores",
            "nproc output not numeric",
        ));
    }

    // `model name\t: Intel(R) Xeon(R) ...`
    let cpu_model = line(LINE_CPU_MODEL).and_then(|l| {
        l.split_once(':')
            .map(|(_, model)| model.trim().to_string())
            .filter(|m| !m.is_empty())
    });

    let threads = line(LINE_CPU_THREADS).and_then(|l| l.parse::<u32>().ok());

    // `MemTotal:       16315424 kB`
    let total_ram_bytes = line(LINE_MEM_TOTAL).and_then(|l| {
        let rest = l.split_once(':')?.1;
        let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
        Some(kb * 1024)
    });
    if line(LINE_MEM_TOTAL).is_some() && total_ram_bytes.is_none() {
        warnings.push(ParseWarning::new(
            "sysinfo.total_ram_bytes",
            "MemTotal line not parseable",
        ));
    }

    let interfaces: Vec<String> = lines
        .iter()
        .skip(LINE_INTERFACES)
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    let info = SystemInfo {
        hostname: line(LINE_HOSTNAME).map(str::to_string),
        os_name,
        os_version,
        kernel,
        cpu_model,
        cpu_cores: cores,
        cpu_threads: threads,
        total_ram_bytes,
        interfaces,
        collected_at: Utc::now(),
    };
    (info, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSINFO: &str = "\
Linux
6.1.0-18-amd64
x86_64
GNU/Linux
PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"
web-frontend-02
8
model name\t: Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz
16
MemTotal:       16315424 kB
lo
eth0
eth1";

    #[test]
    fn parses_the_full_block() {
        let (info, warnings) = parse_sysinfo(SYSINFO);
        assert!(warnings.is_empty());
        assert_eq!(info.hostname.as_deref(), Some("web-frontend-02"));
        assert_eq!(info.kernel.as_deref(), Some("Linux 6.1.0-18-amd64"));
        assert_eq!(info.os_name.as_deref(), Some("GNU/Linux"));
        assert_eq!(
            info.os_version.as_deref(),
            Some("Debian GNU/Linux 12 (bookworm)")
        );
        assert_eq!(
            info.cpu_model.as_deref(),
            Some("Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz")
        );
        assert_eq!(info.cpu_cores, Some(8));
        assert_eq!(info.cpu_threads, Some(16));
        assert_eq!(info.total_ram_bytes, Some(16315424 * 1024));
        assert_eq!(info.interfaces, vec!["lo", "eth0", "eth1"]);
    }

    #[test]
    fn truncated_output_leaves_fields_missing() {
        let (info, warnings) = parse_sysinfo("Linux\n6.1.0\n");
        assert_eq!(info.kernel.as_deref(), Some("Linux 6.1.0"));
        assert_eq!(info.hostname, None);
        assert_eq!(info.cpu_cores, None);
        assert_eq!(info.total_ram_bytes, None);
        assert!(info.interfaces.is_empty());
        assert!(!warnings.is_empty());
    }

    #[test]
    fn missing_os_release_probe_leaves_version_missing() {
        let input = "Linux\n6.1.0\nx86_64\nGNU/Linux\n\nhost-1\n4\n";
        let (info, _) = parse_sysinfo(input);
        assert_eq!(info.os_version, None);
        assert_eq!(info.hostname.as_deref(), Some("host-1"));
        assert_eq!(info.cpu_cores, Some(4));
    }

    #[test]
    fn empty_output_is_all_missing() {
        let (info, warnings) = parse_sysinfo("");
        assert_eq!(info.hostname, None);
        assert_eq!(info.kernel, None);
        assert!(!warnings.is_empty());
    }
}
