//! Push Fabric: WebSocket connections, subscriptions, and live fan-out.

pub mod broadcast;
pub mod connection;
pub mod messages;
pub mod subscription;

pub use broadcast::{Broadcaster, ConnectionRegistry};
pub use connection::{Connection, ConnectionLimits, EnqueueOutcome};
pub use messages::{ClientMessage, Envelope};
pub use subscription::{ConnectionId, Subscription, SubscriptionIndex};

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::SamplePublisher;
use crate::config::Config;
use crate::status::StatusEvent;
use crate::store::SampleStore;
use crate::types::MetricsSample;

use self::messages::{parse_client_message, ClientParseError};

/// Everything the fan-out layer owns: connection registry, subscription
/// index, broadcaster, and the central heartbeat ticker.
pub struct PushFabric {
    limits: ConnectionLimits,
    registry: Arc<ConnectionRegistry>,
    index: SubscriptionIndex,
    broadcaster: Broadcaster,
    store: Arc<SampleStore>,
    cancel: CancellationToken,
    heartbeat_interval_s: u64,
}

impl PushFabric {
    pub fn new(config: &Config, store: Arc<SampleStore>, cancel: CancellationToken) -> Arc<Self> {
        let limits = ConnectionLimits {
            send_queue: config.ws_send_queue,
            max_message_bytes: config.ws_max_message_bytes,
            drop_ceiling: 50,
            drop_window: Duration::from_secs(60),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout_misses: config.heartbeat_timeout_misses,
        };
        let registry = Arc::new(ConnectionRegistry::new(
            config.ws_max_connections,
            config.ws_max_per_ip,
        ));
        let index = SubscriptionIndex::new(cancel.child_token());
        let broadcaster = Broadcaster::new(registry.clone(), index.clone());

        let fabric = Arc::new(Self {
            limits,
            registry,
            index,
            broadcaster,
            store,
            cancel: cancel.clone(),
            heartbeat_interval_s: config.heartbeat_interval_s,
        });

        fabric.clone().spawn_heartbeat(cancel);
        fabric
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn index(&self) -> &SubscriptionIndex {
        &self.index
    }

    /// Pre-upgrade admission check; rejected handshakes get a 429.
    pub fn admit(&self, remote: IpAddr) -> Result<(), &'static str> {
        self.registry.admit_check(remote)
    }

    /// Purge all interest in a deleted server.
    pub fn forget_server(&self, server_id: &crate::types::ServerId) {
        self.index.drop_server(server_id);
    }

    /// Drive one upgraded socket to completion: register the connection,
    /// run its writer task, and consume client messages until close.
    pub async fn handle_socket(
        self: Arc<Self>,
        socket: WebSocket,
        remote: IpAddr,
        supports_compression: bool,
    ) {
        let (sink, mut stream) = socket.split();
        let (connection, rx) = Connection::new(remote, supports_compression, self.limits.clone());

        if let Err(reason) = self.registry.register(connection.clone()) {
            warn!(remote = %remote, reason, "connection rejected at registration");
            return;
        }
        info!(connection_id = %connection.id, remote = %remote, "connection established");

        let writer = tokio::spawn(connection.clone().run_writer(rx, sink));

        // HELLO carries the id and heartbeat cadence the client must honor.
        let hello: Arc<str> = Arc::from(
            messages::hello_frame(&connection.id.to_string(), self.heartbeat_interval_s).encode(),
        );
        connection.enqueue(hello);

        let close_token = connection.close_token();
        loop {
            let received = tokio::select! {
                _ = close_token.cancelled() => break,
                _ = self.cancel.cancelled() => {
                    connection.begin_close("shutdown");
                    break;
                }
                received = stream.next() => received,
            };

            let message = match received {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    debug!(connection_id = %connection.id, "socket read failed: {e}");
                    connection.begin_close("read_failed");
                    break;
                }
                None => {
                    connection.begin_close("client_close");
                    break;
                }
            };

            match message {
                Message::Text(text) => {
                    if text.len() > connection.max_message_bytes() {
                        warn!(
                            connection_id = %connection.id,
                            size = text.len(),
                            "oversize client message"
                        );
                        connection.begin_close("oversize");
                        break;
                    }
                    connection.note_client_frame();
                    if !self.dispatch_client_message(&connection, text.as_str()).await {
                        break;
                    }
                }
                Message::Binary(payload) => {
                    if payload.len() > connection.max_message_bytes() {
                        connection.begin_close("oversize");
                        break;
                    }
                    // The client set is text-only.
                    connection.note_client_frame();
                    connection.enqueue(Arc::from(
                        messages::error_frame("protocol_error", "binary frames are not accepted")
                            .encode(),
                    ));
                }
                Message::Ping(_) | Message::Pong(_) => {
                    connection.note_client_frame();
                }
                Message::Close(_) => {
                    connection.begin_close("client_close");
                    break;
                }
            }
        }

        // Teardown: the writer stops through the close token; the index and
        // registry forget the connection.
        connection.begin_close("server_close");
        self.index.drop_connection(connection.id);
        self.registry.remove(&connection.id);
        if tokio::time::timeout(Duration::from_secs(3), writer).await.is_err() {
            warn!(connection_id = %connection.id, "writer did not stop in time");
        }
        info!(
            connection_id = %connection.id,
            reason = connection.close_reason().unwrap_or("unknown"),
            sent = connection.frames_sent.load(std::sync::atomic::Ordering::Relaxed),
            received = connection.frames_received.load(std::sync::atomic::Ordering::Relaxed),
            dropped = connection.dropped_total.load(std::sync::atomic::Ordering::Relaxed),
            "connection closed"
        );
    }

    /// Handle one parsed client message. Returns false when the connection
    /// must close.
    async fn dispatch_client_message(&self, connection: &Arc<Connection>, text: &str) -> bool {
        match parse_client_message(text) {
            Ok(ClientMessage::Subscribe(request)) => {
                let summary = serde_json::json!({
                    "servers": match &request.servers {
                        messages::ServerSelector::All => serde_json::json!("all"),
                        messages::ServerSelector::Ids(ids) => serde_json::json!(
                            ids.iter().cloned().collect::<Vec<_>>()
                        ),
                    },
                    "metrics": request.metrics.as_ref().map(|m| {
                        m.iter().map(|k| k.as_str()).collect::<Vec<_>>()
                    }),
                    "min_status": request.min_status.map(|s| s.as_str()),
                });
                self.index.subscribe(connection.id, request).await;
                connection.enqueue(Arc::from(messages::subscribe_ack_frame(summary).encode()));
                true
            }
            Ok(ClientMessage::Unsubscribe { servers }) => {
                self.index.unsubscribe(connection.id, servers).await;
                true
            }
            Ok(ClientMessage::Ping) | Ok(ClientMessage::Pong) => {
                // Liveness was already recorded; nothing else to do.
                true
            }
            Ok(ClientMessage::RequestHistory(request)) => {
                let result = self
                    .store
                    .query_recent(&request.server, request.metric, request.range);
                let samples: Vec<serde_json::Value> = result
                    .samples
                    .iter()
                    .map(|s| messages::metrics_data(s, messages::metric_bit(request.metric)))
                    .collect();
                let frame = Envelope::new(
                    messages::frame_type::HISTORY,
                    serde_json::json!({
                        "server_id": request.server,
                        "metric": request.metric.as_str(),
                        "partial": result.partial,
                        "samples": samples,
                    }),
                );
                connection.enqueue(Arc::from(frame.encode()));
                true
            }
            Err(ClientParseError::UnknownType(t)) => {
                connection.enqueue(Arc::from(
                    messages::error_frame("unknown_type", &format!("unknown message type {t:?}"))
                        .encode(),
                ));
                true
            }
            Err(ClientParseError::Protocol(e)) => {
                connection.enqueue(Arc::from(
                    messages::error_frame("protocol_error", &e.to_string()).encode(),
                ));
                connection.begin_close("protocol_error");
                false
            }
        }
    }

    fn spawn_heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.limits.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let ping: Arc<str> = Arc::from(messages::ping_frame().encode());
                for connection in self.registry.all() {
                    if connection.heartbeat_expired() {
                        if connection.begin_close("heartbeat_timeout") {
                            info!(
                                connection_id = %connection.id,
                                "no client frame across two heartbeats; closing"
                            );
                        }
                        continue;
                    }
                    connection.enqueue(ping.clone());
                    connection.note_ping_sent();
                }
            }
            debug!("heartbeat ticker stopped");
        });
    }

    /// Ordered shutdown: every connection gets a final SHUTDOWN frame, then
    /// the close tokens fire.
    pub async fn shutdown(&self) {
        let frame: Arc<str> = Arc::from(messages::shutdown_frame().encode());
        self.broadcaster.broadcast_all(frame);
        // Give writer loops a moment to flush the notice.
        tokio::time::sleep(Duration::from_millis(200)).await;
        for connection in self.registry.all() {
            connection.begin_close("shutdown");
        }
        info!(connections = self.registry.count(), "push fabric stopped");
    }

    pub fn stats(&self) -> serde_json::Value {
        let connections = self.registry.all();
        let dropped: u64 = connections
            .iter()
            .map(|c| c.dropped_total.load(std::sync::atomic::Ordering::Relaxed))
            .sum();
        serde_json::json!({
            "active_connections": connections.len(),
            "subscriptions": self.index.subscriber_count(),
            "dropped_frames": dropped,
            "connections": connections.iter().map(|c| c.info()).collect::<Vec<_>>(),
        })
    }
}

impl SamplePublisher for PushFabric {
    fn publish_sample(&self, sample: &Arc<MetricsSample>) {
        self.broadcaster.broadcast_sample(sample);
    }

    fn publish_status(&self, event: &StatusEvent) {
        self.broadcaster.broadcast_status(event);
    }
}
