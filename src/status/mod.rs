//! Threshold evaluation and the debounced status machine.
//!
//! Each sample lands in a band per metric (normal, warning, critical); the
//! server's candidate status is the worst band across enabled metrics, and a
//! failed collection cycle is an offline candidate. Transitions are sticky:
//! the candidate must hold for `debounce_samples` consecutive observations
//! (offline has its own, shorter debounce) before the status flips and an
//! event is emitted. Events fire only on transition.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::config::ThresholdDefaults;
use crate::types::{MetricKind, MetricsSample, ServerId, ServerStatus};

/// Numeric bands for one metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricBands {
    pub warning: f64,
    pub critical: f64,
    pub debounce_samples: u32,
}

/// Effective thresholds for one server: global defaults unless overridden.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    pub cpu: MetricBands,
    pub memory: MetricBands,
    pub disk: MetricBands,
    pub offline_debounce_samples: u32,
}

impl ThresholdPolicy {
    pub fn from_defaults(defaults: &ThresholdDefaults) -> Self {
        let bands = |m: crate::config::MetricThresholdDefaults| MetricBands {
            warning: m.warning,
            critical: m.critical,
            debounce_samples: m.debounce_samples,
        };
        Self {
            cpu: bands(defaults.cpu),
            memory: bands(defaults.memory),
            disk: bands(defaults.disk),
            offline_debounce_samples: defaults.offline_debounce_samples,
        }
    }

    fn bands_for(&self, kind: MetricKind) -> Option<&MetricBands> {
        match kind {
            MetricKind::Cpu => Some(&self.cpu),
            MetricKind::Memory => Some(&self.memory),
            MetricKind::Disk => Some(&self.disk),
            MetricKind::Network => None,
        }
    }
}

/// Emitted on every status transition, consumed by the push fabric.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub server_id: ServerId,
    pub prior: ServerStatus,
    pub new: ServerStatus,
    /// The metric whose band drove the transition; absent for offline.
    pub metric: Option<MetricKind>,
    pub observed_value: Option<f64>,
    pub crossed_threshold: Option<f64>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// What the evaluator saw this cycle.
pub enum Observation<'a> {
    Sample(&'a MetricsSample),
    /// Collection failed entirely; `reason` is a stable code such as
    /// `auth_failed`, `connect_failed`, `host_key_mismatch`, or
    /// `collection_failed`.
    Failure { reason: &'a str },
}

/// The band a sample landed in, plus what put it there.
#[derive(Debug, Clone, Copy)]
struct BandVerdict {
    status: ServerStatus,
    metric: Option<MetricKind>,
    observed: Option<f64>,
    threshold: Option<f64>,
    debounce: u32,
}

#[derive(Debug, Default)]
struct MachineState {
    current: ServerStatus,
    candidate: Option<ServerStatus>,
    candidate_count: u32,
}

/// Per-fleet evaluator. One machine per server; policies are the global
/// defaults with optional per-server overrides.
pub struct StatusEvaluator {
    default_policy: ThresholdPolicy,
    overrides: Mutex<HashMap<ServerId, ThresholdPolicy>>,
    machines: Mutex<HashMap<ServerId, MachineState>>,
}

impl StatusEvaluator {
    pub fn new(defaults: &ThresholdDefaults) -> Self {
        Self {
            default_policy: ThresholdPolicy::from_defaults(defaults),
            overrides: Mutex::new(HashMap::new()),
            machines: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_override(&self, server_id: ServerId, policy: ThresholdPolicy) {
        self.overrides.lock().unwrap().insert(server_id, policy);
    }

    pub fn clear_override(&self, server_id: &ServerId) {
        self.overrides.lock().unwrap().remove(server_id);
    }

    /// Drop all state for a removed server.
    pub fn forget(&self, server_id: &ServerId) {
        self.machines.lock().unwrap().remove(server_id);
        self.overrides.lock().unwrap().remove(server_id);
    }

    /// Current (debounced) status for a server.
    pub fn current(&self, server_id: &ServerId) -> ServerStatus {
        self.machines
            .lock()
            .unwrap()
            .get(server_id)
            .map(|m| m.current)
            .unwrap_or(ServerStatus::Unknown)
    }

    /// Feed one observation; returns an event only on transition.
    pub fn observe(
        &self,
        server_id: &ServerId,
        observation: Observation<'_>,
    ) -> Option<StatusEvent> {
        let policy = {
            let overrides = self.overrides.lock().unwrap();
            overrides
                .get(server_id)
                .cloned()
                .unwrap_or_else(|| self.default_policy.clone())
        };

        let (verdict, reason) = match observation {
            Observation::Sample(sample) => (self.judge(sample, &policy), None),
            Observation::Failure { reason } => (
                BandVerdict {
                    status: ServerStatus::Offline,
                    metric: None,
                    observed: None,
                    threshold: None,
                    debounce: policy.offline_debounce_samples,
                },
                Some(reason.to_string()),
            ),
        };

        let mut machines = self.machines.lock().unwrap();
        let state = machines.entry(server_id.clone()).or_default();

        if verdict.status == state.current {
            state.candidate = None;
            state.candidate_count = 0;
            return None;
        }

        if state.candidate == Some(verdict.status) {
            state.candidate_count += 1;
        } else {
            state.candidate = Some(verdict.status);
            state.candidate_count = 1;
        }

        // The first observation ever moves off Unknown immediately; after
        // that, the candidate must sustain its debounce.
        let required = if state.current == ServerStatus::Unknown {
            1
        } else {
            verdict.debounce.max(1)
        };

        if state.candidate_count < required {
            debug!(
                server_id = %server_id,
                candidate = verdict.status.as_str(),
                count = state.candidate_count,
                required,
                "status candidate accumulating"
            );
            return None;
        }

        let prior = state.current;
        state.current = verdict.status;
        state.candidate = None;
        state.candidate_count = 0;

        let event = StatusEvent {
            server_id: server_id.clone(),
            prior,
            new: verdict.status,
            metric: verdict.metric,
            observed_value: verdict.observed,
            crossed_threshold: verdict.threshold,
            reason: reason.unwrap_or_else(|| {
                verdict
                    .metric
                    .map(|m| format!("{}_threshold", m.as_str()))
                    .unwrap_or_else(|| "recovered".to_string())
            }),
            timestamp: Utc::now(),
        };
        info!(
            server_id = %server_id,
            prior = prior.as_str(),
            new = verdict.status.as_str(),
            reason = %event.reason,
            "server status transition"
        );
        Some(event)
    }

    /// Worst band across the sample's enabled metrics.
    fn judge(&self, sample: &MetricsSample, policy: &ThresholdPolicy) -> BandVerdict {
        let mut worst = BandVerdict {
            status: ServerStatus::Online,
            metric: None,
            observed: None,
            threshold: None,
            debounce: policy.cpu.debounce_samples,
        };

        let observations = [
            (
                MetricKind::Cpu,
                sample.cpu.as_ref().and_then(|c| c.usage_percent),
            ),
            (
                MetricKind::Memory,
                sample.memory.as_ref().and_then(|m| m.usage_percent),
            ),
            (
                MetricKind::Disk,
                sample.disk.as_ref().and_then(|d| d.usage_percent),
            ),
        ];

        for (kind, value) in observations {
            let (Some(bands), Some(value)) = (policy.bands_for(kind), value) else {
                continue;
            };
            let (status, threshold) = if value >= bands.critical {
                (ServerStatus::Critical, bands.critical)
            } else if value >= bands.warning {
                (ServerStatus::Warning, bands.warning)
            } else {
                continue;
            };
            if status > worst.status {
                worst = BandVerdict {
                    status,
                    metric: Some(kind),
                    observed: Some(value),
                    threshold: Some(threshold),
                    debounce: bands.debounce_samples,
                };
            }
        }

        worst
    }
}
