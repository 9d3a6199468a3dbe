//! Error taxonomy for the collection-and-distribution core.
//!
//! Errors are tagged values, not strings: component boundaries surface these
//! kinds unchanged and the web adapter translates them to HTTP status codes
//! or WebSocket `ERROR` frames at the very edge.

use thiserror::Error;

/// Credential vault failures. Fatal for the affected operation; the owning
/// server is marked offline with reason `credential_error`.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no master key is configured")]
    MasterKeyMissing,

    #[error("ciphertext failed authentication")]
    BadCiphertext,

    #[error("unknown credential algorithm tag: {tag}")]
    UnknownAlgorithm { tag: String },
}

/// Connectivity failures on the session-open path. These drive pool
/// invalidation and scheduler backoff.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("TCP connect to {host}:{port} failed: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("SSH handshake with {host} failed: {reason}")]
    HandshakeFailed { host: String, reason: String },

    #[error("authentication rejected for {username}@{host}")]
    AuthFailed { host: String, username: String },

    /// Never auto-recovered; requires operator intervention.
    #[error("host key for {host} does not match the known-hosts entry")]
    HostKeyMismatch { host: String },

    #[error("session to {host} was lost: {reason}")]
    SessionLost { host: String, reason: String },
}

impl ConnectivityError {
    /// Stable reason code carried on status events.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConnectivityError::ConnectFailed { .. } => "connect_failed",
            ConnectivityError::HandshakeFailed { .. } => "connect_failed",
            ConnectivityError::AuthFailed { .. } => "auth_failed",
            ConnectivityError::HostKeyMismatch { .. } => "host_key_mismatch",
            ConnectivityError::SessionLost { .. } => "session_lost",
        }
    }

    /// Host-key mismatches are terminal until an operator fixes the
    /// known-hosts entry; everything else may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectivityError::HostKeyMismatch { .. })
    }
}

/// Command execution failures. A failing command within a cycle produces
/// `missing` metrics; the cycle still yields a sample with what it has.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command `{key}` timed out after {timeout_secs}s")]
    CommandTimeout { key: String, timeout_secs: u64 },

    #[error("command `{key}` exited with {exit}: {stderr}")]
    CommandFailed {
        key: String,
        exit: u32,
        /// Truncated to 1 KiB at construction.
        stderr: String,
    },

    #[error("no session available for server {server_id} within {timeout_secs}s")]
    PoolExhausted { server_id: String, timeout_secs: u64 },

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Sample store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Logged and dropped: the submitted timestamp does not advance the ring.
    #[error("sample for {server_id} at {timestamp_ms}ms does not advance newest {newest_ms}ms")]
    OutOfOrder {
        server_id: String,
        timestamp_ms: i64,
        newest_ms: i64,
    },

    #[error("durable sink rejected batch (retryable): {reason}")]
    SinkRetryable { reason: String },

    /// Raises the sink-degraded flag and stops retries for the batch.
    #[error("durable sink rejected batch (fatal): {reason}")]
    SinkFatal { reason: String },

    #[error("no sample recorded yet for server {server_id}")]
    NoData { server_id: String },
}

/// Push fabric failures. All of these close only the offending connection.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("send queue full, frame dropped")]
    QueueOverflow,

    #[error("no client frame across two heartbeat intervals")]
    HeartbeatTimeout,

    #[error("connection exceeded the dropped-frame ceiling")]
    SlowConsumer,

    #[error("inbound message of {size} bytes exceeds the {limit} byte limit")]
    Oversize { size: usize, limit: usize },

    #[error("malformed client message: {reason}")]
    ProtocolError { reason: String },
}

impl PushError {
    /// Close-reason string sent to the peer and logged.
    pub fn close_reason(&self) -> &'static str {
        match self {
            PushError::QueueOverflow => "queue_overflow",
            PushError::HeartbeatTimeout => "heartbeat_timeout",
            PushError::SlowConsumer => "slow_consumer",
            PushError::Oversize { .. } => "oversize",
            PushError::ProtocolError { .. } => "protocol_error",
        }
    }
}
