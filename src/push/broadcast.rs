//! Fan-out: encode once, enqueue everywhere.
//!
//! No I/O happens on the broadcast path — lookups and queue pushes only, so
//! the scheduler's publish step stays O(subscribers) in memory and close to
//! O(1) in time. Writer loops do the socket writes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::push::connection::{Connection, EnqueueOutcome};
use crate::push::messages::{self, metric_bit, Envelope};
use crate::push::subscription::{ConnectionId, SubscriptionIndex};
use crate::status::StatusEvent;
use crate::types::{MetricKind, MetricsSample};

/// Registry of live connections plus the admission caps.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    max_connections: usize,
    max_per_ip: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, max_per_ip: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
            max_per_ip,
        }
    }

    /// Admission check before the handshake is accepted.
    pub fn admit_check(&self, remote: IpAddr) -> Result<(), &'static str> {
        let connections = self.connections.read().unwrap();
        if connections.len() >= self.max_connections {
            return Err("max_connections");
        }
        let from_ip = connections
            .values()
            .filter(|c| c.remote_addr == remote)
            .count();
        if from_ip >= self.max_per_ip {
            return Err("max_per_ip");
        }
        Ok(())
    }

    /// Register after upgrade; caps are re-checked since admission and
    /// upgrade are not atomic.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), &'static str> {
        let mut connections = self.connections.write().unwrap();
        if connections.len() >= self.max_connections {
            return Err("max_connections");
        }
        let from_ip = connections
            .values()
            .filter(|c| c.remote_addr == connection.remote_addr)
            .count();
        if from_ip >= self.max_per_ip {
            return Err("max_per_ip");
        }
        connections.insert(connection.id, connection);
        Ok(())
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().unwrap().remove(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().unwrap().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().unwrap().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.connections.read().unwrap().len()
    }
}

fn sample_mask(sample: &MetricsSample) -> u8 {
    MetricKind::ALL
        .iter()
        .filter(|kind| sample.has_metric(**kind))
        .fold(0, |acc, kind| acc | metric_bit(*kind))
}

pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    index: SubscriptionIndex,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, index: SubscriptionIndex) -> Self {
        Self { registry, index }
    }

    /// Deliver a sample to every matching subscriber. The frame is encoded
    /// once per distinct metric filter among the targets (one encode total
    /// for the common unfiltered case).
    pub fn broadcast_sample(&self, sample: &Arc<MetricsSample>) {
        let targets = self.index.sample_targets(&sample.server_id, sample.status);
        if targets.is_empty() {
            return;
        }

        let present = sample_mask(sample);
        let mut encoded: HashMap<u8, Arc<str>> = HashMap::new();

        for target in targets {
            // Subscribers whose filter shares nothing with this sample's
            // metrics have nothing to hear.
            if target.metric_mask & present == 0 {
                continue;
            }
            let frame = encoded
                .entry(target.metric_mask)
                .or_insert_with(|| {
                    Arc::from(messages::metrics_frame(sample, target.metric_mask).encode())
                })
                .clone();
            self.deliver(target.connection, frame);
        }
    }

    /// Deliver a status transition to every subscriber of the server.
    pub fn broadcast_status(&self, event: &StatusEvent) {
        let targets = self.index.status_targets(&event.server_id);
        if targets.is_empty() {
            return;
        }
        let frame: Arc<str> = Arc::from(
            Envelope::with_id(
                messages::frame_type::STATUS_CHANGE,
                serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
            )
            .encode(),
        );
        info!(
            server_id = %event.server_id,
            new = event.new.as_str(),
            subscribers = targets.len(),
            "broadcasting status change"
        );
        for connection in targets {
            self.deliver(connection, frame.clone());
        }
    }

    /// Deliver one frame to every live connection (shutdown notice).
    pub fn broadcast_all(&self, frame: Arc<str>) {
        for connection in self.registry.all() {
            match connection.enqueue(frame.clone()) {
                EnqueueOutcome::SlowConsumer => self.index.drop_connection(connection.id),
                _ => {}
            }
        }
    }

    fn deliver(&self, connection_id: ConnectionId, frame: Arc<str>) {
        let Some(connection) = self.registry.get(&connection_id) else {
            // Index lag behind a disconnect: prune.
            self.index.drop_connection(connection_id);
            return;
        };
        match connection.enqueue(frame) {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::Dropped => {
                debug!(connection_id = %connection_id, "frame dropped: send queue full");
            }
            EnqueueOutcome::SlowConsumer => {
                warn!(connection_id = %connection_id, "slow consumer evicted from index");
                self.index.drop_connection(connection_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::connection::ConnectionLimits;
    use crate::push::messages::{ServerSelector, SubscribeRequest};
    use crate::types::{CpuRecord, ServerStatus};
    use std::net::Ipv4Addr;
    use tokio_util::sync::CancellationToken;

    fn sample(server: &str, seq: u64) -> Arc<MetricsSample> {
        Arc::new(MetricsSample {
            server_id: server.to_string(),
            timestamp_ms: seq as i64 * 1_000,
            seq,
            cpu: Some(CpuRecord {
                usage_percent: Some(42.5),
                cores: Some(4),
                load_1m: None,
                load_5m: None,
                load_15m: None,
                uptime_secs: None,
                warmup: false,
                warnings: Vec::new(),
            }),
            memory: None,
            disk: None,
            network: None,
            status: ServerStatus::Online,
        })
    }

    fn subscribe_to(servers: &[&str]) -> SubscribeRequest {
        SubscribeRequest {
            servers: ServerSelector::Ids(servers.iter().map(|s| s.to_string()).collect()),
            metrics: None,
            min_status: None,
        }
    }

    async fn setup() -> (Arc<ConnectionRegistry>, SubscriptionIndex, Broadcaster) {
        let registry = Arc::new(ConnectionRegistry::new(100, 10));
        let index = SubscriptionIndex::new(CancellationToken::new());
        let broadcaster = Broadcaster::new(registry.clone(), index.clone());
        (registry, index, broadcaster)
    }

    fn new_connection(
        registry: &ConnectionRegistry,
        queue: usize,
    ) -> (Arc<Connection>, tokio::sync::mpsc::Receiver<Arc<str>>) {
        let limits = ConnectionLimits {
            send_queue: queue,
            ..Default::default()
        };
        let (conn, rx) = Connection::new(IpAddr::V4(Ipv4Addr::LOCALHOST), false, limits);
        registry.register(conn.clone()).unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn only_matching_subscribers_receive_the_frame() {
        let (registry, index, broadcaster) = setup().await;
        let (conn_a, mut rx_a) = new_connection(&registry, 8);
        let (conn_b, mut rx_b) = new_connection(&registry, 8);

        index.subscribe(conn_a.id, subscribe_to(&["srv-1"])).await;
        index.subscribe(conn_b.id, subscribe_to(&["srv-2"])).await;

        broadcaster.broadcast_sample(&sample("srv-1", 1));

        let frame = rx_a.try_recv().unwrap();
        assert!(frame.contains("\"server_id\":\"srv-1\""));
        assert!(rx_b.try_recv().is_err(), "srv-2 subscriber must not hear srv-1");
    }

    #[tokio::test]
    async fn frames_are_shared_across_same_filter_subscribers() {
        let (registry, index, broadcaster) = setup().await;
        let (conn_a, mut rx_a) = new_connection(&registry, 8);
        let (conn_b, mut rx_b) = new_connection(&registry, 8);

        index.subscribe(conn_a.id, subscribe_to(&["srv-1"])).await;
        index.subscribe(conn_b.id, subscribe_to(&["srv-1"])).await;

        broadcaster.broadcast_sample(&sample("srv-1", 1));

        let frame_a = rx_a.try_recv().unwrap();
        let frame_b = rx_b.try_recv().unwrap();
        // Same Arc: encoded exactly once.
        assert!(Arc::ptr_eq(&frame_a, &frame_b));
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_without_affecting_others() {
        let (registry, index, broadcaster) = setup().await;

        // Tiny queue and ceiling: overflow quickly.
        let limits = ConnectionLimits {
            send_queue: 2,
            drop_ceiling: 3,
            ..Default::default()
        };
        let (slow, _slow_rx) =
            Connection::new(IpAddr::V4(Ipv4Addr::LOCALHOST), false, limits);
        registry.register(slow.clone()).unwrap();
        let (healthy, mut healthy_rx) = new_connection(&registry, 64);

        index.subscribe(slow.id, subscribe_to(&["srv-1"])).await;
        index.subscribe(healthy.id, subscribe_to(&["srv-1"])).await;

        // 2 fill the slow queue, 3 drop, the 4th drop (broadcast 6) closes.
        for seq in 1..=10 {
            broadcaster.broadcast_sample(&sample("srv-1", seq));
        }
        assert!(slow.is_closing());
        assert_eq!(slow.close_reason(), Some("slow_consumer"));

        // The healthy connection saw every broadcast.
        let mut received = 0;
        while healthy_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 10);

        // Index eviction lands through the writer lane.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let targets = index.sample_targets(&"srv-1".to_string(), ServerStatus::Online);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].connection, healthy.id);
    }

    #[tokio::test]
    async fn metric_filtered_subscriber_gets_projected_frame() {
        let (registry, index, broadcaster) = setup().await;
        let (conn, mut rx) = new_connection(&registry, 8);

        index
            .subscribe(
                conn.id,
                SubscribeRequest {
                    servers: ServerSelector::Ids(["srv-1".to_string()].into_iter().collect()),
                    metrics: Some([MetricKind::Cpu, MetricKind::Memory].into_iter().collect()),
                    min_status: None,
                },
            )
            .await;

        broadcaster.broadcast_sample(&sample("srv-1", 1));
        let frame = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["data"]["cpu"]["usage_percent"], 42.5);
        assert!(value["data"]["disk"].is_null());
        assert!(value["data"]["network"].is_null());
    }

    #[tokio::test]
    async fn disk_only_subscriber_skips_cpu_only_sample() {
        let (registry, index, broadcaster) = setup().await;
        let (conn, mut rx) = new_connection(&registry, 8);

        index
            .subscribe(
                conn.id,
                SubscribeRequest {
                    servers: ServerSelector::Ids(["srv-1".to_string()].into_iter().collect()),
                    metrics: Some([MetricKind::Disk].into_iter().collect()),
                    min_status: None,
                },
            )
            .await;

        broadcaster.broadcast_sample(&sample("srv-1", 1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn admission_caps_global_and_per_ip() {
        let registry = ConnectionRegistry::new(2, 1);
        let ip_a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let ip_b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        let (c1, _r1) = Connection::new(ip_a, false, ConnectionLimits::default());
        registry.register(c1).unwrap();
        assert_eq!(registry.admit_check(ip_a), Err("max_per_ip"));
        assert_eq!(registry.admit_check(ip_b), Ok(()));

        let (c2, _r2) = Connection::new(ip_b, false, ConnectionLimits::default());
        registry.register(c2).unwrap();
        assert_eq!(registry.admit_check(ip_b), Err("max_connections"));
    }
}
