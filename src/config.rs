//! Process configuration: a closed key set loaded from TOML once at startup.
//!
//! The configuration is immutable after load; there is no hot-reload. The
//! master key may be supplied through the `CWATCHER_MASTER_KEY` environment
//! variable, which takes precedence over the file so the key can stay out of
//! version control.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::types::MetricKind;

pub const MASTER_KEY_ENV: &str = "CWATCHER_MASTER_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "defaults::collection_period_s")]
    pub collection_period_s: u64,

    /// Per-command timeout overrides keyed by command key (`cpu`, `memory`,
    /// `disk`, `network`, `sysinfo`, `uptime`, `load`).
    #[serde(default)]
    pub command_timeout_s: HashMap<String, u64>,

    #[serde(default = "defaults::ssh_connect_timeout_s")]
    pub ssh_connect_timeout_s: u64,

    #[serde(default = "defaults::ssh_max_per_server")]
    pub ssh_max_per_server: usize,

    #[serde(default = "defaults::ssh_idle_ttl_s")]
    pub ssh_idle_ttl_s: u64,

    #[serde(default = "defaults::sample_ring_capacity")]
    pub sample_ring_capacity: usize,

    #[serde(default = "defaults::sink_batch_size")]
    pub sink_batch_size: usize,

    #[serde(default = "defaults::sink_batch_flush_ms")]
    pub sink_batch_flush_ms: u64,

    #[serde(default = "defaults::heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,

    #[serde(default = "defaults::heartbeat_timeout_misses")]
    pub heartbeat_timeout_misses: u32,

    #[serde(default = "defaults::ws_send_queue")]
    pub ws_send_queue: usize,

    #[serde(default = "defaults::ws_max_connections")]
    pub ws_max_connections: usize,

    #[serde(default = "defaults::ws_max_per_ip")]
    pub ws_max_per_ip: usize,

    #[serde(default = "defaults::ws_max_message_bytes")]
    pub ws_max_message_bytes: usize,

    #[serde(default)]
    pub threshold_defaults: ThresholdDefaults,

    /// Overridden by `CWATCHER_MASTER_KEY` when set.
    #[serde(default)]
    pub master_key: Option<String>,

    #[serde(default = "defaults::known_hosts_path")]
    pub known_hosts_path: String,

    /// Trust-on-first-use is an explicit operator opt-in; the default is a
    /// strict known-hosts check.
    #[serde(default)]
    pub allow_tofu: bool,

    #[serde(default = "defaults::listen_addr")]
    pub listen_addr: String,

    #[serde(default = "defaults::database_path")]
    pub database_path: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MetricThresholdDefaults {
    pub warning: f64,
    pub critical: f64,
    #[serde(default = "defaults::debounce_samples")]
    pub debounce_samples: u32,
}

/// Default threshold bands, matching the collector's historical defaults:
/// cpu 80/90, memory 85/95, disk 85/95.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdDefaults {
    pub cpu: MetricThresholdDefaults,
    pub memory: MetricThresholdDefaults,
    pub disk: MetricThresholdDefaults,
    /// Consecutive failed cycles before a server is declared offline.
    pub offline_debounce_samples: u32,
}

impl Default for ThresholdDefaults {
    fn default() -> Self {
        Self {
            cpu: MetricThresholdDefaults {
                warning: 80.0,
                critical: 90.0,
                debounce_samples: 3,
            },
            memory: MetricThresholdDefaults {
                warning: 85.0,
                critical: 95.0,
                debounce_samples: 3,
            },
            disk: MetricThresholdDefaults {
                warning: 85.0,
                critical: 95.0,
                debounce_samples: 3,
            },
            offline_debounce_samples: 2,
        }
    }
}

impl ThresholdDefaults {
    pub fn for_metric(&self, kind: MetricKind) -> Option<MetricThresholdDefaults> {
        match kind {
            MetricKind::Cpu => Some(self.cpu),
            MetricKind::Memory => Some(self.memory),
            MetricKind::Disk => Some(self.disk),
            MetricKind::Network => None,
        }
    }
}

mod defaults {
    pub fn collection_period_s() -> u64 {
        30
    }
    pub fn ssh_connect_timeout_s() -> u64 {
        10
    }
    pub fn ssh_max_per_server() -> usize {
        3
    }
    pub fn ssh_idle_ttl_s() -> u64 {
        300
    }
    pub fn sample_ring_capacity() -> usize {
        240
    }
    pub fn sink_batch_size() -> usize {
        64
    }
    pub fn sink_batch_flush_ms() -> u64 {
        5_000
    }
    pub fn heartbeat_interval_s() -> u64 {
        30
    }
    pub fn heartbeat_timeout_misses() -> u32 {
        2
    }
    pub fn ws_send_queue() -> usize {
        64
    }
    pub fn ws_max_connections() -> usize {
        1_000
    }
    pub fn ws_max_per_ip() -> usize {
        10
    }
    pub fn ws_max_message_bytes() -> usize {
        16 * 1024
    }
    pub fn debounce_samples() -> u32 {
        3
    }
    pub fn known_hosts_path() -> String {
        "known_hosts".to_string()
    }
    pub fn listen_addr() -> String {
        "0.0.0.0:8080".to_string()
    }
    pub fn database_path() -> String {
        "data/cwatcher.db".to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        // An empty TOML document yields all defaults.
        toml::from_str("").expect("defaults are valid")
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        if let Ok(key) = std::env::var(MASTER_KEY_ENV) {
            if !key.is_empty() {
                config.master_key = Some(key);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(10..=300).contains(&self.collection_period_s) {
            bail!(
                "collection_period_s must be within 10..=300, got {}",
                self.collection_period_s
            );
        }
        if !(1..=8).contains(&self.ssh_max_per_server) {
            bail!(
                "ssh_max_per_server must be within 1..=8, got {}",
                self.ssh_max_per_server
            );
        }
        if self.sample_ring_capacity == 0 {
            bail!("sample_ring_capacity must be positive");
        }
        if self.sink_batch_size == 0 {
            bail!("sink_batch_size must be positive");
        }
        if self.ws_send_queue == 0 {
            bail!("ws_send_queue must be positive");
        }
        if self.heartbeat_interval_s == 0 {
            bail!("heartbeat_interval_s must be positive");
        }
        for (key, secs) in &self.command_timeout_s {
            if !matches!(
                key.as_str(),
                "cpu" | "memory" | "disk" | "network" | "sysinfo" | "uptime" | "load"
            ) {
                bail!("command_timeout_s has unknown command key `{key}`");
            }
            if *secs == 0 || *secs > 120 {
                bail!("command_timeout_s.{key} must be within 1..=120, got {secs}");
            }
        }
        for (name, t) in [
            ("cpu", self.threshold_defaults.cpu),
            ("memory", self.threshold_defaults.memory),
            ("disk", self.threshold_defaults.disk),
        ] {
            if t.warning >= t.critical {
                bail!("threshold_defaults.{name}: warning must be below critical");
            }
            if t.debounce_samples == 0 {
                bail!("threshold_defaults.{name}: debounce_samples must be positive");
            }
        }
        Ok(())
    }

    pub fn collection_period(&self) -> Duration {
        Duration::from_secs(self.collection_period_s)
    }

    /// Budget a cycle gets before outstanding commands are abandoned.
    pub fn cycle_budget(&self) -> Duration {
        Duration::from_secs(self.collection_period_s.saturating_sub(1).max(1))
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_s)
    }

    pub fn ssh_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.ssh_idle_ttl_s)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn sink_batch_flush(&self) -> Duration {
        Duration::from_millis(self.sink_batch_flush_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.collection_period_s, 30);
        assert_eq!(config.ssh_max_per_server, 3);
        assert_eq!(config.sample_ring_capacity, 240);
        assert!(!config.allow_tofu);
    }

    #[tokio::test]
    async fn load_applies_overrides_and_validates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
collection_period_s = 60
ssh_max_per_server = 5
allow_tofu = true

[command_timeout_s]
disk = 20

[threshold_defaults.cpu]
warning = 70.0
critical = 85.0
debounce_samples = 5
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.collection_period_s, 60);
        assert_eq!(config.ssh_max_per_server, 5);
        assert!(config.allow_tofu);
        assert_eq!(config.command_timeout_s.get("disk"), Some(&20));
        assert_eq!(config.threshold_defaults.cpu.warning, 70.0);
        assert_eq!(config.threshold_defaults.cpu.debounce_samples, 5);
        // Untouched sections keep their defaults.
        assert_eq!(config.threshold_defaults.memory.critical, 95.0);
    }

    #[test]
    fn out_of_range_period_is_rejected() {
        let config: Config = toml::from_str("collection_period_s = 5").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_command_key_is_rejected() {
        let config: Config = toml::from_str("[command_timeout_s]\nreboot = 5").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let config: Config =
            toml::from_str("[threshold_defaults.cpu]\nwarning = 95.0\ncritical = 80.0").unwrap();
        assert!(config.validate().is_err());
    }
}
