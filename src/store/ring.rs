//! The bounded recent-samples ring for one (server, metric) pair.
//!
//! Single writer (the owning server's scheduler task), many readers.
//! Entries are appended in timestamp order — the store enforces monotonic
//! submission — so range queries are contiguous slices.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::types::{MetricsSample, TimeRange};

#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Oldest first.
    pub samples: Vec<Arc<MetricsSample>>,
    /// The requested range reaches past what the ring still holds; the
    /// caller must consult the durable sink for the remainder.
    pub partial: bool,
}

pub struct SampleRing {
    entries: VecDeque<Arc<MetricsSample>>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append one sample, evicting oldest-first at capacity.
    pub fn push(&mut self, sample: Arc<MetricsSample>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn query(&self, range: TimeRange) -> QueryResult {
        let samples: Vec<Arc<MetricsSample>> = self
            .entries
            .iter()
            .filter(|s| range.contains(s.timestamp_ms))
            .cloned()
            .collect();

        let partial = match self.entries.front() {
            Some(oldest) => range.from_ms < oldest.timestamp_ms,
            None => true,
        };

        QueryResult { samples, partial }
    }
}
