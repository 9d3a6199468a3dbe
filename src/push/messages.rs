//! WebSocket wire format: the JSON envelope and the closed client message
//! set.
//!
//! Every frame is `{ "type": ..., "ts": <ms>, "id": <uuid?>, "data": ... }`.
//! Compressed frames travel as binary messages: one codec tag byte
//! (0x01 = gzip) followed by the deflated JSON envelope.
//!
//! Client messages outside the closed set yield an `unknown_type` error
//! frame without closing the connection; malformed JSON is a protocol
//! error.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use crate::errors::PushError;
use crate::types::{MetricKind, MetricsSample, ServerId, ServerStatus, TimeRange};

/// Codec tag prefixed to binary (compressed) frames.
pub const CODEC_GZIP: u8 = 0x01;

/// Server-to-client frame types.
pub mod frame_type {
    pub const HELLO: &str = "HELLO";
    pub const PING: &str = "PING";
    pub const SUBSCRIBE_ACK: &str = "SUBSCRIBE_ACK";
    pub const METRICS: &str = "METRICS";
    pub const STATUS_CHANGE: &str = "STATUS_CHANGE";
    pub const HISTORY: &str = "HISTORY";
    pub const ERROR: &str = "ERROR";
    pub const SHUTDOWN: &str = "SHUTDOWN";
    pub const BATCH: &str = "BATCH";
}

/// Outbound envelope. `id` is optional and omitted when absent.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub data: Value,
}

impl Envelope {
    pub fn new(frame_type: &'static str, data: Value) -> Self {
        Self {
            frame_type,
            ts: Utc::now().timestamp_millis(),
            id: None,
            data,
        }
    }

    pub fn with_id(frame_type: &'static str, data: Value) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            ..Self::new(frame_type, data)
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization is infallible")
    }
}

pub fn hello_frame(connection_id: &str, heartbeat_interval_s: u64) -> Envelope {
    Envelope::new(
        frame_type::HELLO,
        serde_json::json!({
            "connection_id": connection_id,
            "heartbeat_interval_s": heartbeat_interval_s,
            "server_time_ms": Utc::now().timestamp_millis(),
        }),
    )
}

pub fn ping_frame() -> Envelope {
    Envelope::new(frame_type::PING, serde_json::json!({}))
}

pub fn error_frame(code: &str, message: &str) -> Envelope {
    Envelope::new(
        frame_type::ERROR,
        serde_json::json!({ "code": code, "message": message }),
    )
}

pub fn shutdown_frame() -> Envelope {
    Envelope::new(
        frame_type::SHUTDOWN,
        serde_json::json!({ "message": "server shutting down" }),
    )
}

pub fn subscribe_ack_frame(sub_summary: Value) -> Envelope {
    Envelope::new(frame_type::SUBSCRIBE_ACK, sub_summary)
}

/// Project a sample to its wire shape, restricted to `mask` (a bitset over
/// [`MetricKind::ALL`]). Absent or filtered-out metrics encode as `null`.
pub fn metrics_data(sample: &MetricsSample, mask: u8) -> Value {
    let include = |kind: MetricKind| mask & metric_bit(kind) != 0;
    serde_json::json!({
        "server_id": sample.server_id,
        "timestamp": sample.timestamp_ms,
        "seq": sample.seq,
        "status": sample.status.as_str(),
        "cpu": if include(MetricKind::Cpu) { to_value(&sample.cpu) } else { Value::Null },
        "memory": if include(MetricKind::Memory) { to_value(&sample.memory) } else { Value::Null },
        "disk": if include(MetricKind::Disk) { to_value(&sample.disk) } else { Value::Null },
        "network": if include(MetricKind::Network) { to_value(&sample.network) } else { Value::Null },
    })
}

/// Encode a sample into a METRICS frame.
pub fn metrics_frame(sample: &MetricsSample, mask: u8) -> Envelope {
    Envelope::new(frame_type::METRICS, metrics_data(sample, mask))
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

pub fn metric_bit(kind: MetricKind) -> u8 {
    match kind {
        MetricKind::Cpu => 1 << 0,
        MetricKind::Memory => 1 << 1,
        MetricKind::Disk => 1 << 2,
        MetricKind::Network => 1 << 3,
    }
}

pub const FULL_MASK: u8 = 0b1111;

pub fn mask_of(metrics: Option<&HashSet<MetricKind>>) -> u8 {
    match metrics {
        None => FULL_MASK,
        Some(set) => set.iter().fold(0, |acc, kind| acc | metric_bit(*kind)),
    }
}

/// Which servers a subscription covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSelector {
    All,
    Ids(HashSet<ServerId>),
}

/// Parsed SUBSCRIBE payload.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub servers: ServerSelector,
    pub metrics: Option<HashSet<MetricKind>>,
    pub min_status: Option<ServerStatus>,
}

/// Parsed REQUEST_HISTORY payload.
#[derive(Debug, Clone)]
pub struct HistoryRequest {
    pub server: ServerId,
    pub metric: MetricKind,
    pub range: TimeRange,
}

/// The closed set of client messages.
#[derive(Debug)]
pub enum ClientMessage {
    Subscribe(SubscribeRequest),
    Unsubscribe { servers: Vec<ServerId> },
    Ping,
    Pong,
    RequestHistory(HistoryRequest),
}

#[derive(Debug, Deserialize)]
struct RawClientMessage {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawServers {
    Keyword(String),
    Ids(Vec<ServerId>),
}

#[derive(Debug, Deserialize)]
struct RawSubscribe {
    servers: RawServers,
    #[serde(default)]
    metrics: Option<Vec<MetricKind>>,
    #[serde(default)]
    min_status: Option<ServerStatus>,
}

#[derive(Debug, Deserialize)]
struct RawUnsubscribe {
    #[serde(default)]
    servers: Vec<ServerId>,
}

#[derive(Debug, Deserialize)]
struct RawHistory {
    server: ServerId,
    metric: MetricKind,
    range: RawRange,
}

#[derive(Debug, Deserialize)]
struct RawRange {
    from_ms: i64,
    to_ms: i64,
}

/// Parse one inbound text message. `Err(ProtocolError)` for malformed JSON
/// or bad payloads; unknown types are reported separately so the caller can
/// answer with an error frame instead of closing.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ClientParseError> {
    let raw: RawClientMessage = serde_json::from_str(text).map_err(|e| {
        ClientParseError::Protocol(PushError::ProtocolError {
            reason: format!("invalid JSON: {e}"),
        })
    })?;

    match raw.message_type.as_str() {
        "SUBSCRIBE" => {
            let payload: RawSubscribe = parse_data(raw.data)?;
            let servers = match payload.servers {
                RawServers::Keyword(word) if word == "all" => ServerSelector::All,
                RawServers::Keyword(word) => {
                    return Err(ClientParseError::Protocol(PushError::ProtocolError {
                        reason: format!("servers must be a list or \"all\", got {word:?}"),
                    }))
                }
                RawServers::Ids(ids) => ServerSelector::Ids(ids.into_iter().collect()),
            };
            Ok(ClientMessage::Subscribe(SubscribeRequest {
                servers,
                metrics: payload.metrics.map(|m| m.into_iter().collect()),
                min_status: payload.min_status,
            }))
        }
        "UNSUBSCRIBE" => {
            let payload: RawUnsubscribe = parse_data(raw.data)?;
            Ok(ClientMessage::Unsubscribe {
                servers: payload.servers,
            })
        }
        "PING" => Ok(ClientMessage::Ping),
        "PONG" => Ok(ClientMessage::Pong),
        "REQUEST_HISTORY" => {
            let payload: RawHistory = parse_data(raw.data)?;
            Ok(ClientMessage::RequestHistory(HistoryRequest {
                server: payload.server,
                metric: payload.metric,
                range: TimeRange {
                    from_ms: payload.range.from_ms,
                    to_ms: payload.range.to_ms,
                },
            }))
        }
        other => Err(ClientParseError::UnknownType(other.to_string())),
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, ClientParseError> {
    serde_json::from_value(data).map_err(|e| {
        ClientParseError::Protocol(PushError::ProtocolError {
            reason: format!("invalid payload: {e}"),
        })
    })
}

#[derive(Debug)]
pub enum ClientParseError {
    /// Answered with an ERROR frame; the connection stays open.
    UnknownType(String),
    /// Malformed message; the connection is closed.
    Protocol(PushError),
}
