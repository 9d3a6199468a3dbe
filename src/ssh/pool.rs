//! Bounded per-server SSH session pool.
//!
//! Each server gets at most `max_per_server` concurrent sessions, guarded by
//! a per-server semaphore; idle sessions are recycled through a queue and
//! lazily reaped past the idle TTL. Authentication and connect failures put
//! the server into exponential backoff (2 s doubling, 60 s cap), and
//! repeated transient failures escalate so the scheduler can mark the
//! server offline.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{CommandError, ConnectivityError};
use crate::ssh::session::{KnownHostsPolicy, SshSession};
use crate::types::{Server, ServerId};
use crate::vault::{CredentialVault, Plaintext};

const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Idle sessions younger than this are reused without a no-op probe.
const ACTIVITY_WINDOW: Duration = Duration::from_secs(30);
/// Transient failures inside this window escalate the server to offline.
const ESCALATION_WINDOW: Duration = Duration::from_secs(60);
const ESCALATION_THRESHOLD: usize = 3;
/// In-flight leases get this long to finish when a server is closed.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Why a server is currently backing off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffReason {
    AuthFailed,
    ConnectFailed,
    HostKeyMismatch,
}

impl BackoffReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffReason::AuthFailed => "auth_failed",
            BackoffReason::ConnectFailed => "connect_failed",
            BackoffReason::HostKeyMismatch => "host_key_mismatch",
        }
    }
}

#[derive(Debug, Default)]
struct BackoffState {
    consecutive_failures: u32,
    not_before: Option<Instant>,
    reason: Option<BackoffReason>,
}

impl BackoffState {
    fn record_failure(&mut self, reason: BackoffReason) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let exp = self.consecutive_failures.saturating_sub(1).min(5);
        let delay = (BACKOFF_BASE * 2u32.pow(exp)).min(BACKOFF_CAP);
        // Host-key mismatches are never auto-retried; park them indefinitely
        // by renewing the deadline on every check.
        self.not_before = Some(Instant::now() + delay);
        self.reason = Some(reason);
        delay
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.not_before = None;
        self.reason = None;
    }

    fn active(&self) -> Option<BackoffReason> {
        match (self.reason, self.not_before) {
            (Some(BackoffReason::HostKeyMismatch), _) => Some(BackoffReason::HostKeyMismatch),
            (Some(reason), Some(deadline)) if Instant::now() < deadline => Some(reason),
            _ => None,
        }
    }
}

struct ServerPool {
    idle: VecDeque<SshSession>,
    semaphore: Arc<Semaphore>,
    backoff: BackoffState,
    transient_failures: VecDeque<Instant>,
    closing: bool,
}

impl ServerPool {
    fn new(max_sessions: usize) -> Self {
        Self {
            idle: VecDeque::new(),
            semaphore: Arc::new(Semaphore::new(max_sessions)),
            backoff: BackoffState::default(),
            transient_failures: VecDeque::new(),
            closing: false,
        }
    }

    fn record_transient_failure(&mut self) -> bool {
        let now = Instant::now();
        self.transient_failures.push_back(now);
        while let Some(front) = self.transient_failures.front() {
            if now.duration_since(*front) > ESCALATION_WINDOW {
                self.transient_failures.pop_front();
            } else {
                break;
            }
        }
        self.transient_failures.len() >= ESCALATION_THRESHOLD
    }
}

/// Snapshot of one server's pool, for operator visibility.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub server_id: ServerId,
    pub idle_sessions: usize,
    pub available_permits: usize,
    pub max_sessions: usize,
    pub backing_off: bool,
    pub backoff_reason: Option<String>,
}

/// A checked-out session, valid for a single command. Dropping the lease
/// without releasing closes the session conservatively; the executor always
/// releases or invalidates explicitly.
pub struct Lease {
    session: Option<SshSession>,
    server_id: ServerId,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn session(&mut self) -> &mut SshSession {
        self.session
            .as_mut()
            .expect("lease already released or invalidated")
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }
}

pub struct SshPool {
    servers: RwLock<HashMap<ServerId, Arc<Mutex<ServerPool>>>>,
    vault: Arc<CredentialVault>,
    policy: KnownHostsPolicy,
    max_per_server: usize,
    connect_timeout: Duration,
    idle_ttl: Duration,
}

impl SshPool {
    pub fn new(
        vault: Arc<CredentialVault>,
        policy: KnownHostsPolicy,
        max_per_server: usize,
        connect_timeout: Duration,
        idle_ttl: Duration,
    ) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            vault,
            policy,
            max_per_server,
            connect_timeout,
            idle_ttl,
        }
    }

    async fn server_pool(&self, server_id: &ServerId) -> Arc<Mutex<ServerPool>> {
        {
            let servers = self.servers.read().await;
            if let Some(pool) = servers.get(server_id) {
                return pool.clone();
            }
        }
        let mut servers = self.servers.write().await;
        servers
            .entry(server_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ServerPool::new(self.max_per_server))))
            .clone()
    }

    /// Check out a session ready for a single command. Blocks up to
    /// `timeout` for a permit; opens a fresh session when the idle queue is
    /// empty or every idle session failed its health check.
    pub async fn acquire(&self, server: &Server, timeout: Duration) -> Result<Lease, CommandError> {
        let pool = self.server_pool(&server.id).await;

        {
            let state = pool.lock().await;
            if state.closing {
                return Err(CommandError::Connectivity(ConnectivityError::SessionLost {
                    host: server.host.clone(),
                    reason: "server is being closed".to_string(),
                }));
            }
            if let Some(reason) = state.backoff.active() {
                return Err(CommandError::Connectivity(self.backoff_error(server, reason)));
            }
        }

        let semaphore = pool.lock().await.semaphore.clone();
        let permit = tokio::time::timeout(timeout, semaphore.acquire_owned())
            .await
            .map_err(|_| CommandError::PoolExhausted {
                server_id: server.id.clone(),
                timeout_secs: timeout.as_secs(),
            })?
            .map_err(|_| CommandError::PoolExhausted {
                server_id: server.id.clone(),
                timeout_secs: timeout.as_secs(),
            })?;

        // Reuse an idle session if one passes its health check. I/O happens
        // outside the per-server lock.
        loop {
            let candidate = pool.lock().await.idle.pop_front();
            let Some(mut session) = candidate else { break };

            if session.is_healthy(ACTIVITY_WINDOW).await {
                debug!(server_id = %server.id, "reusing idle SSH session");
                return Ok(Lease {
                    session: Some(session),
                    server_id: server.id.clone(),
                    _permit: permit,
                });
            }
            debug!(server_id = %server.id, "discarding unhealthy idle session");
            session.close().await;
        }

        // No reusable session: open one. Plaintext credentials live only on
        // this call stack.
        let secret = self.resolve_secret(server)?;
        match SshSession::open(server, secret, &self.policy, self.connect_timeout).await {
            Ok(session) => {
                pool.lock().await.backoff.reset();
                info!(server_id = %server.id, host = %server.host, "opened new SSH session");
                Ok(Lease {
                    session: Some(session),
                    server_id: server.id.clone(),
                    _permit: permit,
                })
            }
            Err(e) => {
                let reason = match &e {
                    ConnectivityError::AuthFailed { .. } => BackoffReason::AuthFailed,
                    ConnectivityError::HostKeyMismatch { .. } => BackoffReason::HostKeyMismatch,
                    _ => BackoffReason::ConnectFailed,
                };
                let delay = pool.lock().await.backoff.record_failure(reason);
                warn!(
                    server_id = %server.id,
                    reason = reason.as_str(),
                    backoff_secs = delay.as_secs(),
                    "session open failed: {e}"
                );
                Err(CommandError::Connectivity(e))
            }
        }
    }

    /// Return a session to the idle set. A server that was closed while the
    /// lease was in flight just closes the session instead.
    pub async fn release(&self, mut lease: Lease) {
        let Some(session) = lease.session.take() else {
            return;
        };
        let pool = self.servers.read().await.get(&lease.server_id).cloned();
        match pool {
            Some(pool) => {
                let mut state = pool.lock().await;
                if state.closing {
                    drop(state);
                    session.close().await;
                } else {
                    state.idle.push_back(session);
                }
            }
            None => session.close().await,
        }
    }

    /// Mark the leased session unusable. A future acquire opens a fresh one.
    /// Returns true when transient failures crossed the escalation threshold.
    pub async fn invalidate(&self, mut lease: Lease, reason: &str) -> bool {
        let server_id = lease.server_id.clone();
        if let Some(session) = lease.session.take() {
            session.close().await;
        }
        let Some(pool) = self.servers.read().await.get(&server_id).cloned() else {
            return false;
        };
        let escalated = pool.lock().await.record_transient_failure();
        if escalated {
            warn!(
                server_id = %server_id,
                reason,
                "repeated session failures within the escalation window"
            );
        } else {
            debug!(server_id = %server_id, reason, "session invalidated");
        }
        escalated
    }

    /// Drain and close every session for one server. In-flight leases may
    /// finish within the grace deadline; afterwards their permits are
    /// irrelevant because the pool entry is gone.
    pub async fn close_server(&self, server_id: &ServerId) {
        let Some(pool) = self.servers.write().await.remove(server_id) else {
            return;
        };

        let semaphore = {
            let mut state = pool.lock().await;
            state.closing = true;
            while let Some(session) = state.idle.pop_front() {
                session.close().await;
            }
            state.semaphore.clone()
        };

        // Wait for in-flight leases by draining all permits, bounded by the
        // grace deadline.
        let drained = tokio::time::timeout(
            CLOSE_GRACE,
            semaphore.acquire_many(self.max_per_server as u32),
        )
        .await;
        match drained {
            Ok(_) => info!(server_id = %server_id, "all sessions closed"),
            Err(_) => warn!(
                server_id = %server_id,
                grace_secs = CLOSE_GRACE.as_secs(),
                "grace deadline elapsed with leases still in flight; sessions will close on drop"
            ),
        }
    }

    /// Global teardown. Idempotent.
    pub async fn close(&self) {
        let ids: Vec<ServerId> = self.servers.read().await.keys().cloned().collect();
        for id in ids {
            self.close_server(&id).await;
        }
    }

    /// Lazily close idle sessions past the TTL. Called from a periodic task.
    pub async fn reap_idle(&self) {
        let pools: Vec<(ServerId, Arc<Mutex<ServerPool>>)> = self
            .servers
            .read()
            .await
            .iter()
            .map(|(id, pool)| (id.clone(), pool.clone()))
            .collect();

        for (server_id, pool) in pools {
            let mut expired = Vec::new();
            {
                let mut state = pool.lock().await;
                let mut keep = VecDeque::new();
                while let Some(session) = state.idle.pop_front() {
                    if session.idle_for() > self.idle_ttl {
                        expired.push(session);
                    } else {
                        keep.push_back(session);
                    }
                }
                state.idle = keep;
            }
            if !expired.is_empty() {
                debug!(server_id = %server_id, count = expired.len(), "reaping idle sessions");
                for session in expired {
                    session.close().await;
                }
            }
        }
    }

    pub async fn status(&self) -> Vec<PoolStatus> {
        let pools: Vec<(ServerId, Arc<Mutex<ServerPool>>)> = self
            .servers
            .read()
            .await
            .iter()
            .map(|(id, pool)| (id.clone(), pool.clone()))
            .collect();

        let mut out = Vec::with_capacity(pools.len());
        for (server_id, pool) in pools {
            let state = pool.lock().await;
            out.push(PoolStatus {
                server_id,
                idle_sessions: state.idle.len(),
                available_permits: state.semaphore.available_permits(),
                max_sessions: self.max_per_server,
                backing_off: state.backoff.active().is_some(),
                backoff_reason: state.backoff.active().map(|r| r.as_str().to_string()),
            });
        }
        out
    }

    fn resolve_secret(&self, server: &Server) -> Result<Plaintext, CommandError> {
        self.vault
            .decrypt(&server.secret)
            .map_err(CommandError::Credential)
    }

    fn backoff_error(&self, server: &Server, reason: BackoffReason) -> ConnectivityError {
        match reason {
            BackoffReason::AuthFailed => ConnectivityError::AuthFailed {
                host: server.host.clone(),
                username: server.username.clone(),
            },
            BackoffReason::HostKeyMismatch => ConnectivityError::HostKeyMismatch {
                host: server.host.clone(),
            },
            BackoffReason::ConnectFailed => ConnectivityError::ConnectFailed {
                host: server.host.clone(),
                port: server.port,
                reason: "server is backing off after repeated connect failures".to_string(),
            },
        }
    }
}
