//! One WebSocket peer: send queue, writer loop, drop accounting, heartbeat
//! bookkeeping.
//!
//! Broadcasters enqueue pre-encoded frames without blocking; the writer loop
//! is the only place socket writes happen, so per-connection delivery order
//! is the queue order. A full queue drops that frame for that connection
//! only; crossing the drop ceiling inside the window closes the connection
//! as a slow consumer.

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::SplitSink;
use futures::SinkExt;
use std::collections::VecDeque;
use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::push::messages::{frame_type, CODEC_GZIP};
use crate::push::subscription::ConnectionId;

/// Frames larger than this are compressed for compression-capable peers.
const COMPRESSION_THRESHOLD: usize = 1024;
/// Hard cap on one socket write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Most frames coalesced into one BATCH.
const MAX_BATCH: usize = 32;

#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    pub send_queue: usize,
    pub max_message_bytes: usize,
    pub drop_ceiling: usize,
    pub drop_window: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout_misses: u32,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            send_queue: 64,
            max_message_bytes: 16 * 1024,
            drop_ceiling: 50,
            drop_window: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout_misses: 2,
        }
    }
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue full; this frame was dropped for this connection.
    Dropped,
    /// This drop crossed the ceiling; the connection is now closing.
    SlowConsumer,
}

pub struct Connection {
    pub id: ConnectionId,
    pub remote_addr: IpAddr,
    pub created_at: DateTime<Utc>,
    tx: mpsc::Sender<Arc<str>>,
    close_token: CancellationToken,
    close_reason: Mutex<Option<&'static str>>,
    supports_compression: bool,
    limits: ConnectionLimits,
    last_client_frame: Mutex<Instant>,
    last_ping_sent: Mutex<Option<Instant>>,
    drop_times: Mutex<VecDeque<Instant>>,
    pub dropped_total: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_sent: AtomicI64,
}

impl Connection {
    /// Returns the connection plus the receiver half for its writer loop.
    pub fn new(
        remote_addr: IpAddr,
        supports_compression: bool,
        limits: ConnectionLimits,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(limits.send_queue);
        let connection = Arc::new(Self {
            id: uuid::Uuid::new_v4(),
            remote_addr,
            created_at: Utc::now(),
            tx,
            close_token: CancellationToken::new(),
            close_reason: Mutex::new(None),
            supports_compression,
            limits,
            last_client_frame: Mutex::new(Instant::now()),
            last_ping_sent: Mutex::new(None),
            drop_times: Mutex::new(VecDeque::new()),
            dropped_total: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicI64::new(0),
        });
        (connection, rx)
    }

    pub fn is_closing(&self) -> bool {
        self.close_token.is_cancelled()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.close_token.clone()
    }

    pub fn close_reason(&self) -> Option<&'static str> {
        *self.close_reason.lock().unwrap()
    }

    pub fn max_message_bytes(&self) -> usize {
        self.limits.max_message_bytes
    }

    /// Initiate close with a reason; only the first caller wins. Returns
    /// whether this call initiated the close.
    pub fn begin_close(&self, reason: &'static str) -> bool {
        let mut slot = self.close_reason.lock().unwrap();
        if slot.is_some() || self.close_token.is_cancelled() {
            return false;
        }
        *slot = Some(reason);
        drop(slot);
        self.close_token.cancel();
        true
    }

    /// Non-blocking enqueue of a pre-encoded frame.
    pub fn enqueue(&self, frame: Arc<str>) -> EnqueueOutcome {
        if self.is_closing() {
            return EnqueueOutcome::Dropped;
        }
        match self.tx.try_send(frame) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Dropped,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                let over_ceiling = {
                    let mut drops = self.drop_times.lock().unwrap();
                    let now = Instant::now();
                    drops.push_back(now);
                    while let Some(front) = drops.front() {
                        if now.duration_since(*front) > self.limits.drop_window {
                            drops.pop_front();
                        } else {
                            break;
                        }
                    }
                    drops.len() > self.limits.drop_ceiling
                };
                if over_ceiling && self.begin_close("slow_consumer") {
                    warn!(
                        connection_id = %self.id,
                        remote = %self.remote_addr,
                        "drop ceiling exceeded; closing slow consumer"
                    );
                    return EnqueueOutcome::SlowConsumer;
                }
                EnqueueOutcome::Dropped
            }
        }
    }

    /// Record any inbound client frame for heartbeat liveness.
    pub fn note_client_frame(&self) {
        *self.last_client_frame.lock().unwrap() = Instant::now();
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_ping_sent(&self) {
        *self.last_ping_sent.lock().unwrap() = Some(Instant::now());
    }

    /// Two consecutive heartbeat intervals without any client frame is dead.
    pub fn heartbeat_expired(&self) -> bool {
        let silence = self.last_client_frame.lock().unwrap().elapsed();
        silence
            > self.limits.heartbeat_interval * self.limits.heartbeat_timeout_misses
    }

    /// Operator-visible snapshot of this connection.
    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "connection_id": self.id.to_string(),
            "remote_addr": self.remote_addr.to_string(),
            "created_at": self.created_at.to_rfc3339(),
            "frames_sent": self.frames_sent.load(Ordering::Relaxed),
            "frames_received": self.frames_received.load(Ordering::Relaxed),
            "bytes_sent": self.bytes_sent.load(Ordering::Relaxed),
            "dropped_frames": self.dropped_total.load(Ordering::Relaxed),
            "last_client_frame_age_ms": self.last_client_frame.lock().unwrap().elapsed().as_millis() as u64,
            "last_ping_age_ms": self.last_ping_sent.lock().unwrap().map(|t| t.elapsed().as_millis() as u64),
        })
    }

    /// The writer loop: the single consumer of the send queue and the only
    /// writer to the socket. Bursts of queued frames are coalesced into one
    /// BATCH frame, preserving order.
    pub async fn run_writer(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Arc<str>>,
        mut sink: SplitSink<WebSocket, Message>,
    ) {
        loop {
            let first = tokio::select! {
                _ = self.close_token.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let mut burst = vec![first];
            while burst.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(frame) => burst.push(frame),
                    Err(_) => break,
                }
            }

            let payload = if burst.len() == 1 {
                burst.pop().expect("burst has one frame").to_string()
            } else {
                batch_payload(&burst)
            };

            let message = self.outbound_message(payload);
            let sent = tokio::time::timeout(WRITE_TIMEOUT, sink.send(message)).await;
            match sent {
                Ok(Ok(())) => {
                    self.frames_sent
                        .fetch_add(burst.len() as u64, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    debug!(connection_id = %self.id, "socket write failed: {e}");
                    self.begin_close("write_failed");
                    break;
                }
                Err(_) => {
                    warn!(connection_id = %self.id, "socket write timed out");
                    self.begin_close("write_timeout");
                    break;
                }
            }
        }

        // Best-effort close frame naming the reason.
        let reason = self.close_reason().unwrap_or("server_close");
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            sink.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: axum::extract::ws::close_code::NORMAL,
                reason: reason.to_string().into(),
            }))),
        )
        .await;
        debug!(connection_id = %self.id, reason, "writer loop finished");
    }

    fn outbound_message(&self, payload: String) -> Message {
        self.bytes_sent
            .fetch_add(payload.len() as i64, Ordering::Relaxed);
        if self.supports_compression && payload.len() > COMPRESSION_THRESHOLD {
            if let Some(compressed) = gzip_frame(payload.as_bytes()) {
                return Message::Binary(compressed.into());
            }
        }
        Message::Text(payload.into())
    }
}

/// Splice already-encoded frames into one BATCH envelope. The inputs are
/// complete JSON objects, so string assembly stays valid JSON.
fn batch_payload(frames: &[Arc<str>]) -> String {
    let inner: Vec<&str> = frames.iter().map(|f| f.as_ref()).collect();
    format!(
        r#"{{"type":"{}","ts":{},"data":{{"frames":[{}]}}}}"#,
        frame_type::BATCH,
        Utc::now().timestamp_millis(),
        inner.join(",")
    )
}

fn gzip_frame(payload: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(payload.len() / 2 + 16);
    out.push(CODEC_GZIP);
    let mut encoder = GzEncoder::new(&mut out, Compression::fast());
    encoder.write_all(payload).ok()?;
    encoder.finish().ok()?;
    Some(out)
}
