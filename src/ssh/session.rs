//! One authenticated SSH session to one server.
//!
//! Host-key verification is strict by default: connections are checked
//! against the operator-managed known-hosts file, and an absent or empty
//! file refuses the connection. Trust-on-first-use must be opted into
//! explicitly via `allow_tofu`.

use async_ssh2_tokio::client::{AuthMethod, Client, ServerCheckMethod};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::ConnectivityError;
use crate::types::{AuthKind, Server};
use crate::vault::Plaintext;

/// Raw output of one executed command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
}

/// Operator host-key policy shared by every session open.
#[derive(Debug, Clone)]
pub struct KnownHostsPolicy {
    path: PathBuf,
    allow_tofu: bool,
}

impl KnownHostsPolicy {
    pub fn new(path: impl Into<PathBuf>, allow_tofu: bool) -> Self {
        let policy = Self {
            path: path.into(),
            allow_tofu,
        };
        if policy.allow_tofu {
            warn!("host-key verification is DISABLED (allow_tofu): sessions trust any server key");
        }
        policy
    }

    /// Resolve the check method for a connection attempt. A strict policy
    /// with no usable known-hosts store refuses to connect at all.
    pub fn check_method(&self, host: &str) -> Result<ServerCheckMethod, ConnectivityError> {
        if self.allow_tofu {
            return Ok(ServerCheckMethod::NoCheck);
        }
        if !store_is_usable(&self.path) {
            warn!(
                host,
                path = %self.path.display(),
                "known-hosts store is absent or empty; refusing connection"
            );
            return Err(ConnectivityError::HostKeyMismatch {
                host: host.to_string(),
            });
        }
        Ok(ServerCheckMethod::KnownHostsFile(
            self.path.to_string_lossy().into_owned(),
        ))
    }
}

fn store_is_usable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// An open, authenticated session. Owned exclusively by the pool; commands
/// are serialized per session by the lease discipline.
pub struct SshSession {
    client: Client,
    host: String,
    opened_at: Instant,
    last_used: Instant,
}

impl SshSession {
    /// Resolve, connect, verify the host key, and authenticate.
    pub async fn open(
        server: &Server,
        secret: Plaintext,
        policy: &KnownHostsPolicy,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectivityError> {
        let check = policy.check_method(&server.host)?;
        let addr = resolve(&server.host, server.port).await?;

        let auth = match server.auth_kind {
            AuthKind::Password => {
                let password = secret.as_str().map_err(|_| ConnectivityError::AuthFailed {
                    host: server.host.clone(),
                    username: server.username.clone(),
                })?;
                AuthMethod::with_password(password)
            }
            AuthKind::Key => {
                let key = secret.as_str().map_err(|_| ConnectivityError::AuthFailed {
                    host: server.host.clone(),
                    username: server.username.clone(),
                })?;
                AuthMethod::with_key(key, None)
            }
        };

        debug!(host = %server.host, port = server.port, username = %server.username, "opening SSH session");

        let connected = tokio::time::timeout(
            connect_timeout,
            Client::connect(addr, &server.username, auth, check),
        )
        .await;

        let client = match connected {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => return Err(classify(&server.host, server.port, &server.username, e)),
            Err(_) => {
                return Err(ConnectivityError::ConnectFailed {
                    host: server.host.clone(),
                    port: server.port,
                    reason: format!("connect timed out after {}s", connect_timeout.as_secs()),
                })
            }
        };

        debug!(host = %server.host, "SSH session established");
        let now = Instant::now();
        Ok(Self {
            client,
            host: server.host.clone(),
            opened_at: now,
            last_used: now,
        })
    }

    /// Run one command to completion and collect stdout, stderr, and the
    /// exit status. The caller applies the per-command timeout.
    pub async fn execute(&mut self, command: &str) -> Result<ExecOutput, ConnectivityError> {
        let result =
            self.client
                .execute(command)
                .await
                .map_err(|e| ConnectivityError::SessionLost {
                    host: self.host.clone(),
                    reason: e.to_string(),
                })?;

        self.last_used = Instant::now();
        Ok(ExecOutput {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_status: result.exit_status,
        })
    }

    /// Cheap liveness check before reusing an idle session: recent activity
    /// counts as healthy, otherwise a no-op command is attempted.
    pub async fn is_healthy(&mut self, activity_window: Duration) -> bool {
        if self.last_used.elapsed() < activity_window {
            return true;
        }
        match tokio::time::timeout(Duration::from_secs(5), self.execute("echo ok")).await {
            Ok(Ok(out)) => out.exit_status == 0,
            _ => false,
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn close(self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(host = %self.host, "disconnect error: {e}");
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectivityError> {
    let mut addrs =
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ConnectivityError::ConnectFailed {
                host: host.to_string(),
                port,
                reason: format!("address resolution failed: {e}"),
            })?;
    addrs.next().ok_or_else(|| ConnectivityError::ConnectFailed {
        host: host.to_string(),
        port,
        reason: "address resolution returned no addresses".to_string(),
    })
}

// The ssh crate's error variants shift between releases; classify on the
// rendered message, with host-key failures checked first since they must
// never be retried.
fn classify(
    host: &str,
    port: u16,
    username: &str,
    err: async_ssh2_tokio::Error,
) -> ConnectivityError {
    let message = err.to_string();
    let lower = message.to_lowercase();

    if lower.contains("server check") || lower.contains("unknown key") || lower.contains("host key")
    {
        return ConnectivityError::HostKeyMismatch {
            host: host.to_string(),
        };
    }
    if lower.contains("auth") || lower.contains("password") || lower.contains("key") {
        return ConnectivityError::AuthFailed {
            host: host.to_string(),
            username: username.to_string(),
        };
    }
    if lower.contains("refused")
        || lower.contains("unreachable")
        || lower.contains("timed out")
        || lower.contains("reset")
        || lower.contains("resolution")
        || lower.contains("broken pipe")
    {
        return ConnectivityError::ConnectFailed {
            host: host.to_string(),
            port,
            reason: message,
        };
    }
    ConnectivityError::HandshakeFailed {
        host: host.to_string(),
        reason: message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn strict_policy_refuses_missing_store() {
        let policy = KnownHostsPolicy::new("/nonexistent/known_hosts", false);
        assert!(matches!(
            policy.check_method("db-1"),
            Err(ConnectivityError::HostKeyMismatch { .. })
        ));
    }

    #[test]
    fn strict_policy_refuses_empty_store() {
        let file = NamedTempFile::new().unwrap();
        let policy = KnownHostsPolicy::new(file.path(), false);
        assert!(matches!(
            policy.check_method("db-1"),
            Err(ConnectivityError::HostKeyMismatch { .. })
        ));
    }

    #[test]
    fn strict_policy_uses_populated_store() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "db-1 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFakeKey").unwrap();
        let policy = KnownHostsPolicy::new(file.path(), false);
        assert!(matches!(
            policy.check_method("db-1"),
            Ok(ServerCheckMethod::KnownHostsFile(_))
        ));
    }

    #[test]
    fn tofu_opt_in_skips_the_check() {
        let policy = KnownHostsPolicy::new("/nonexistent/known_hosts", true);
        assert!(matches!(
            policy.check_method("db-1"),
            Ok(ServerCheckMethod::NoCheck)
        ));
    }
}
