//! Subscription index: who hears about which servers.
//!
//! Forward map `server -> connections` plus a distinguished wildcard set for
//! `all`-subscribers, and a reverse map `connection -> subscription`. All
//! mutations flow through a single writer lane (an mpsc consumed by one
//! task), so the two maps can never diverge; broadcast-path readers go
//! through a read lock and never mutate.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::push::messages::{mask_of, ServerSelector, SubscribeRequest};
use crate::types::{MetricKind, ServerId, ServerStatus};

pub type ConnectionId = Uuid;

/// One connection's declared interest.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub servers: ServerSelector,
    pub metrics: Option<HashSet<MetricKind>>,
    pub min_status: Option<ServerStatus>,
}

impl Subscription {
    pub fn metric_mask(&self) -> u8 {
        mask_of(self.metrics.as_ref())
    }

    pub fn wants_status(&self, status: ServerStatus) -> bool {
        match self.min_status {
            None => true,
            Some(min) => status >= min,
        }
    }
}

#[derive(Default)]
struct IndexState {
    forward: HashMap<ServerId, HashSet<ConnectionId>>,
    wildcard: HashSet<ConnectionId>,
    reverse: HashMap<ConnectionId, Subscription>,
}

impl IndexState {
    fn detach(&mut self, connection: &ConnectionId) {
        if let Some(sub) = self.reverse.remove(connection) {
            match sub.servers {
                ServerSelector::All => {
                    self.wildcard.remove(connection);
                }
                ServerSelector::Ids(ids) => {
                    for id in ids {
                        if let Some(set) = self.forward.get_mut(&id) {
                            set.remove(connection);
                            if set.is_empty() {
                                self.forward.remove(&id);
                            }
                        }
                    }
                }
            }
        }
    }

    fn attach(&mut self, connection: ConnectionId, sub: Subscription) {
        match &sub.servers {
            ServerSelector::All => {
                self.wildcard.insert(connection);
            }
            ServerSelector::Ids(ids) => {
                for id in ids {
                    self.forward.entry(id.clone()).or_default().insert(connection);
                }
            }
        }
        self.reverse.insert(connection, sub);
    }
}

enum IndexOp {
    /// SUBSCRIBE replaces (never merges) the connection's subscription.
    Replace {
        connection: ConnectionId,
        subscription: Subscription,
        applied: oneshot::Sender<()>,
    },
    /// UNSUBSCRIBE removes listed servers; an empty list clears entirely.
    Remove {
        connection: ConnectionId,
        servers: Vec<ServerId>,
        applied: oneshot::Sender<()>,
    },
    DropConnection {
        connection: ConnectionId,
    },
    DropServer {
        server: ServerId,
    },
}

/// A broadcast target with its effective filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub connection: ConnectionId,
    pub metric_mask: u8,
}

/// Handle shared by reader loops (mutations) and the broadcaster (lookups).
#[derive(Clone)]
pub struct SubscriptionIndex {
    state: Arc<RwLock<IndexState>>,
    ops: mpsc::UnboundedSender<IndexOp>,
}

impl SubscriptionIndex {
    /// Create the index and spawn its writer task.
    pub fn new(cancel: CancellationToken) -> Self {
        let state = Arc::new(RwLock::new(IndexState::default()));
        let (ops_tx, mut ops_rx) = mpsc::unbounded_channel::<IndexOp>();

        let writer_state = state.clone();
        tokio::spawn(async move {
            loop {
                let op = tokio::select! {
                    _ = cancel.cancelled() => break,
                    op = ops_rx.recv() => match op {
                        Some(op) => op,
                        None => break,
                    },
                };
                let mut state = writer_state.write().unwrap();
                match op {
                    IndexOp::Replace {
                        connection,
                        subscription,
                        applied,
                    } => {
                        state.detach(&connection);
                        state.attach(connection, subscription);
                        drop(state);
                        let _ = applied.send(());
                    }
                    IndexOp::Remove {
                        connection,
                        servers,
                        applied,
                    } => {
                        if servers.is_empty() {
                            state.detach(&connection);
                        } else if let Some(sub) = state.reverse.get(&connection).cloned() {
                            if let ServerSelector::Ids(mut ids) = sub.servers {
                                for server in &servers {
                                    ids.remove(server);
                                    if let Some(set) = state.forward.get_mut(server) {
                                        set.remove(&connection);
                                        if set.is_empty() {
                                            state.forward.remove(server);
                                        }
                                    }
                                }
                                if ids.is_empty() {
                                    state.reverse.remove(&connection);
                                } else if let Some(s) = state.reverse.get_mut(&connection) {
                                    s.servers = ServerSelector::Ids(ids);
                                }
                            }
                            // An `all` subscription is unaffected by listed
                            // removals; only an empty set clears it.
                        }
                        drop(state);
                        let _ = applied.send(());
                    }
                    IndexOp::DropConnection { connection } => {
                        state.detach(&connection);
                    }
                    IndexOp::DropServer { server } => {
                        let members: Vec<ConnectionId> = state
                            .forward
                            .remove(&server)
                            .map(|set| set.into_iter().collect())
                            .unwrap_or_default();
                        for connection in members {
                            let mut now_empty = false;
                            if let Some(sub) = state.reverse.get_mut(&connection) {
                                if let ServerSelector::Ids(ids) = &mut sub.servers {
                                    ids.remove(&server);
                                    now_empty = ids.is_empty();
                                }
                            }
                            if now_empty {
                                state.reverse.remove(&connection);
                            }
                        }
                    }
                }
            }
            debug!("subscription index writer stopped");
        });

        Self { state, ops: ops_tx }
    }

    /// Replace the connection's subscription; resolves once applied.
    pub async fn subscribe(&self, connection: ConnectionId, request: SubscribeRequest) {
        let (applied_tx, applied_rx) = oneshot::channel();
        let op = IndexOp::Replace {
            connection,
            subscription: Subscription {
                servers: request.servers,
                metrics: request.metrics,
                min_status: request.min_status,
            },
            applied: applied_tx,
        };
        if self.ops.send(op).is_ok() {
            let _ = applied_rx.await;
        }
    }

    /// Remove listed servers from the subscription; empty list clears it.
    pub async fn unsubscribe(&self, connection: ConnectionId, servers: Vec<ServerId>) {
        let (applied_tx, applied_rx) = oneshot::channel();
        let op = IndexOp::Remove {
            connection,
            servers,
            applied: applied_tx,
        };
        if self.ops.send(op).is_ok() {
            let _ = applied_rx.await;
        }
    }

    /// Fire-and-forget cleanup when a connection dies.
    pub fn drop_connection(&self, connection: ConnectionId) {
        let _ = self.ops.send(IndexOp::DropConnection { connection });
    }

    /// Purge all interest in a deleted server.
    pub fn drop_server(&self, server: &ServerId) {
        let _ = self.ops.send(IndexOp::DropServer {
            server: server.clone(),
        });
    }

    /// Targets for a sample broadcast: union of the server's subscribers and
    /// the wildcard set, filtered by status level, each with its metric mask.
    pub fn sample_targets(&self, server: &ServerId, status: ServerStatus) -> Vec<Target> {
        let state = self.state.read().unwrap();
        let direct = state.forward.get(server);
        let candidates = direct
            .into_iter()
            .flatten()
            .chain(state.wildcard.iter());

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for connection in candidates {
            if !seen.insert(*connection) {
                continue;
            }
            let Some(sub) = state.reverse.get(connection) else {
                continue;
            };
            if !sub.wants_status(status) {
                continue;
            }
            targets.push(Target {
                connection: *connection,
                metric_mask: sub.metric_mask(),
            });
        }
        targets
    }

    /// Targets for a status-change broadcast: every subscriber of the
    /// server, regardless of metric filter or status floor — a status
    /// transition is exactly what a floor-filtered client is waiting for.
    pub fn status_targets(&self, server: &ServerId) -> Vec<ConnectionId> {
        let state = self.state.read().unwrap();
        let mut seen = HashSet::new();
        state
            .forward
            .get(server)
            .into_iter()
            .flatten()
            .chain(state.wildcard.iter())
            .filter(|c| seen.insert(**c))
            .copied()
            .collect()
    }

    pub fn subscription_of(&self, connection: &ConnectionId) -> Option<Subscription> {
        self.state.read().unwrap().reverse.get(connection).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.read().unwrap().reverse.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(servers: ServerSelector, metrics: Option<Vec<MetricKind>>) -> SubscribeRequest {
        SubscribeRequest {
            servers,
            metrics: metrics.map(|m| m.into_iter().collect()),
            min_status: None,
        }
    }

    fn ids(list: &[&str]) -> ServerSelector {
        ServerSelector::Ids(list.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn subscribe_routes_only_matching_servers() {
        let index = SubscriptionIndex::new(CancellationToken::new());
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();

        index.subscribe(conn_a, request(ids(&["srv-1"]), None)).await;
        index.subscribe(conn_b, request(ids(&["srv-2"]), None)).await;

        let targets = index.sample_targets(&"srv-1".to_string(), ServerStatus::Online);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].connection, conn_a);
    }

    #[tokio::test]
    async fn wildcard_subscribers_hear_every_server() {
        let index = SubscriptionIndex::new(CancellationToken::new());
        let conn = Uuid::new_v4();
        index.subscribe(conn, request(ServerSelector::All, None)).await;

        for server in ["srv-1", "srv-2", "srv-3"] {
            let targets = index.sample_targets(&server.to_string(), ServerStatus::Online);
            assert_eq!(targets.len(), 1, "missing for {server}");
        }
    }

    #[tokio::test]
    async fn resubscribe_replaces_not_merges() {
        let index = SubscriptionIndex::new(CancellationToken::new());
        let conn = Uuid::new_v4();

        index.subscribe(conn, request(ids(&["srv-1"]), None)).await;
        index.subscribe(conn, request(ids(&["srv-2"]), None)).await;

        assert!(index
            .sample_targets(&"srv-1".to_string(), ServerStatus::Online)
            .is_empty());
        assert_eq!(
            index
                .sample_targets(&"srv-2".to_string(), ServerStatus::Online)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn unsubscribe_list_and_clear() {
        let index = SubscriptionIndex::new(CancellationToken::new());
        let conn = Uuid::new_v4();

        index
            .subscribe(conn, request(ids(&["srv-1", "srv-2"]), None))
            .await;
        index.unsubscribe(conn, vec!["srv-1".to_string()]).await;

        assert!(index
            .sample_targets(&"srv-1".to_string(), ServerStatus::Online)
            .is_empty());
        assert_eq!(
            index
                .sample_targets(&"srv-2".to_string(), ServerStatus::Online)
                .len(),
            1
        );

        // Empty set clears the whole subscription.
        index.unsubscribe(conn, Vec::new()).await;
        assert!(index
            .sample_targets(&"srv-2".to_string(), ServerStatus::Online)
            .is_empty());
        assert_eq!(index.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn min_status_filters_samples_but_not_status_events() {
        let index = SubscriptionIndex::new(CancellationToken::new());
        let conn = Uuid::new_v4();
        index
            .subscribe(
                conn,
                SubscribeRequest {
                    servers: ids(&["srv-1"]),
                    metrics: None,
                    min_status: Some(ServerStatus::Warning),
                },
            )
            .await;

        assert!(index
            .sample_targets(&"srv-1".to_string(), ServerStatus::Online)
            .is_empty());
        assert_eq!(
            index
                .sample_targets(&"srv-1".to_string(), ServerStatus::Warning)
                .len(),
            1
        );
        assert_eq!(index.status_targets(&"srv-1".to_string()).len(), 1);
    }

    #[tokio::test]
    async fn wildcard_and_direct_subscriber_is_targeted_once() {
        let index = SubscriptionIndex::new(CancellationToken::new());
        let conn = Uuid::new_v4();
        // `all` replaces the direct subscription, so subscribe a second
        // connection directly and make sure the union dedupes the wildcard.
        index.subscribe(conn, request(ServerSelector::All, None)).await;
        let targets = index.sample_targets(&"srv-1".to_string(), ServerStatus::Online);
        assert_eq!(targets.len(), 1);
    }

    #[tokio::test]
    async fn dropping_a_server_purges_interest() {
        let index = SubscriptionIndex::new(CancellationToken::new());
        let conn = Uuid::new_v4();
        index.subscribe(conn, request(ids(&["srv-1"]), None)).await;

        index.drop_server(&"srv-1".to_string());
        // The writer lane is async; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(index
            .sample_targets(&"srv-1".to_string(), ServerStatus::Online)
            .is_empty());
        assert_eq!(index.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn metric_mask_reflects_filter() {
        let index = SubscriptionIndex::new(CancellationToken::new());
        let conn = Uuid::new_v4();
        index
            .subscribe(
                conn,
                request(ids(&["srv-1"]), Some(vec![MetricKind::Cpu, MetricKind::Memory])),
            )
            .await;
        let targets = index.sample_targets(&"srv-1".to_string(), ServerStatus::Online);
        assert_eq!(targets[0].metric_mask, 0b0011);
    }
}
