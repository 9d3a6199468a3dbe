//! Command execution: a closed registry of collection commands and the
//! executor that runs them through the SSH pool.
//!
//! Callers can only name registry keys — arbitrary shell strings never reach
//! a target host. Each entry carries its command line, a per-command
//! timeout, and the parser that understands its output.

pub mod parsers;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::CommandError;
use crate::ssh::SshPool;
use crate::types::Server;

const STDERR_EXCERPT_LIMIT: usize = 1024;
/// Upper bound on concurrent command executions across all servers.
pub const GLOBAL_EXECUTOR_CAP: usize = 64;

/// The closed set of collection commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKey {
    Cpu,
    Load,
    Uptime,
    Memory,
    Disk,
    Network,
    SysInfo,
}

impl CommandKey {
    pub const ALL: [CommandKey; 7] = [
        CommandKey::Cpu,
        CommandKey::Load,
        CommandKey::Uptime,
        CommandKey::Memory,
        CommandKey::Disk,
        CommandKey::Network,
        CommandKey::SysInfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKey::Cpu => "cpu",
            CommandKey::Load => "load",
            CommandKey::Uptime => "uptime",
            CommandKey::Memory => "memory",
            CommandKey::Disk => "disk",
            CommandKey::Network => "network",
            CommandKey::SysInfo => "sysinfo",
        }
    }

    /// The command line sent over SSH. Only `/proc`-derived output and
    /// standard utilities; parsers depend on the documented token layout,
    /// not on any particular binary.
    pub fn command(&self) -> &'static str {
        match self {
            CommandKey::Cpu => "cat /proc/stat",
            CommandKey::Load => "cat /proc/loadavg",
            CommandKey::Uptime => "cat /proc/uptime",
            CommandKey::Memory => "cat /proc/meminfo",
            CommandKey::Disk => "df -B1 -x tmpfs -x devtmpfs -x squashfs -x overlay",
            CommandKey::Network => "cat /proc/net/dev",
            CommandKey::SysInfo => {
                "uname -s; uname -r; uname -m; uname -o; grep -m1 ^PRETTY_NAME= /etc/os-release || echo; hostname; nproc; grep -m1 'model name' /proc/cpuinfo; grep -c ^processor /proc/cpuinfo; grep MemTotal /proc/meminfo; ls /sys/class/net"
            }
        }
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            CommandKey::Disk | CommandKey::SysInfo => Duration::from_secs(10),
            _ => Duration::from_secs(5),
        }
    }
}

/// Raw result of one command execution. `elapsed` is a debug field only; it
/// never reaches the wire format.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: u32,
    pub elapsed: Duration,
}

/// Runs registry commands through the pool with per-command timeouts and a
/// global concurrency cap.
pub struct CommandExecutor {
    pool: Arc<SshPool>,
    global_cap: Arc<Semaphore>,
    config: Arc<Config>,
}

impl CommandExecutor {
    pub fn new(pool: Arc<SshPool>, config: Arc<Config>, server_count_hint: usize) -> Self {
        let cap = (4 * server_count_hint.max(1)).min(GLOBAL_EXECUTOR_CAP);
        Self {
            pool,
            global_cap: Arc::new(Semaphore::new(cap)),
            config,
        }
    }

    fn timeout_for(&self, key: CommandKey) -> Duration {
        self.config
            .command_timeout_s
            .get(key.as_str())
            .map(|s| Duration::from_secs(*s))
            .unwrap_or_else(|| key.default_timeout())
    }

    /// Execute one registry command on one server.
    ///
    /// A timeout closes the failing session (not the pool); a non-zero exit
    /// yields `CommandFailed` with a truncated stderr excerpt.
    pub async fn execute(
        &self,
        server: &Server,
        key: CommandKey,
    ) -> Result<RawOutput, CommandError> {
        let _global = self
            .global_cap
            .acquire()
            .await
            .expect("executor semaphore is never closed");

        let timeout = self.timeout_for(key);
        let mut lease = self.pool.acquire(server, timeout).await?;
        let started = tokio::time::Instant::now();

        let result =
            tokio::time::timeout(timeout, lease.session().execute(key.command())).await;
        let elapsed = started.elapsed();

        match result {
            Ok(Ok(output)) => {
                self.pool.release(lease).await;
                debug!(
                    server_id = %server.id,
                    key = key.as_str(),
                    exit = output.exit_status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "command completed"
                );
                if output.exit_status != 0 {
                    return Err(CommandError::CommandFailed {
                        key: key.as_str().to_string(),
                        exit: output.exit_status,
                        stderr: truncate_stderr(&output.stderr),
                    });
                }
                Ok(RawOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit: output.exit_status,
                    elapsed,
                })
            }
            Ok(Err(e)) => {
                self.pool.invalidate(lease, "io_error").await;
                Err(CommandError::Connectivity(e))
            }
            Err(_) => {
                warn!(
                    server_id = %server.id,
                    key = key.as_str(),
                    timeout_secs = timeout.as_secs(),
                    "command timed out; closing session"
                );
                self.pool.invalidate(lease, "command_timeout").await;
                Err(CommandError::CommandTimeout {
                    key: key.as_str().to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }
}

fn truncate_stderr(stderr: &str) -> String {
    if stderr.len() <= STDERR_EXCERPT_LIMIT {
        return stderr.to_string();
    }
    let mut cut = STDERR_EXCERPT_LIMIT;
    while !stderr.is_char_boundary(cut) {
        cut -= 1;
    }
    stderr[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_closed_and_keys_are_stable() {
        let keys: Vec<&str> = CommandKey::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["cpu", "load", "uptime", "memory", "disk", "network", "sysinfo"]
        );
    }

    #[test]
    fn timeouts_fall_within_the_documented_band() {
        for key in CommandKey::ALL {
            let t = key.default_timeout().as_secs();
            assert!((5..=10).contains(&t), "{} has timeout {t}", key.as_str());
        }
    }

    #[test]
    fn command_lines_are_pinned() {
        // The sysinfo parser reads strictly positional lines, so its command
        // text cannot drift without rewriting the parser.
        assert_eq!(CommandKey::Cpu.command(), "cat /proc/stat");
        assert_eq!(CommandKey::Load.command(), "cat /proc/loadavg");
        assert_eq!(CommandKey::Uptime.command(), "cat /proc/uptime");
        assert_eq!(CommandKey::Memory.command(), "cat /proc/meminfo");
        assert_eq!(
            CommandKey::Disk.command(),
            "df -B1 -x tmpfs -x devtmpfs -x squashfs -x overlay"
        );
        assert_eq!(CommandKey::Network.command(), "cat /proc/net/dev");
        assert_eq!(
            CommandKey::SysInfo.command(),
            "uname -s; uname -r; uname -m; uname -o; \
             grep -m1 ^PRETTY_NAME= /etc/os-release || echo; \
             hostname; nproc; \
             grep -m1 'model name' /proc/cpuinfo; \
             grep -c ^processor /proc/cpuinfo; \
             grep MemTotal /proc/meminfo; \
             ls /sys/class/net"
        );
    }

    #[test]
    fn stderr_excerpt_is_bounded_and_utf8_safe() {
        let long = "é".repeat(2000);
        let excerpt = truncate_stderr(&long);
        assert!(excerpt.len() <= STDERR_EXCERPT_LIMIT);
        assert!(excerpt.chars().all(|c| c == 'é'));

        let short = "permission denied";
        assert_eq!(truncate_stderr(short), short);
    }
}
