//! Integration tests for the fan-out layer: subscription routing, slow
//! consumers, ordering, and status-change delivery.

mod common;

use common::fixtures::*;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cwatcher::push::broadcast::{Broadcaster, ConnectionRegistry};
use cwatcher::push::messages::{parse_client_message, ClientMessage, ServerSelector};
use cwatcher::push::{Connection, ConnectionLimits, SubscriptionIndex};
use cwatcher::status::StatusEvent;
use cwatcher::types::{MetricKind, ServerStatus};
use tokio_util::sync::CancellationToken;

fn register_connection(
    registry: &ConnectionRegistry,
    queue: usize,
) -> (
    Arc<Connection>,
    tokio::sync::mpsc::Receiver<Arc<str>>,
) {
    let limits = ConnectionLimits {
        send_queue: queue,
        ..Default::default()
    };
    let (conn, rx) = Connection::new(IpAddr::V4(Ipv4Addr::LOCALHOST), false, limits);
    registry.register(conn.clone()).expect("registration fits caps");
    (conn, rx)
}

async fn subscribe_via_wire(
    index: &SubscriptionIndex,
    conn: &Arc<Connection>,
    message: &str,
) {
    let parsed = parse_client_message(message).expect("valid client message");
    let ClientMessage::Subscribe(request) = parsed else {
        panic!("expected SUBSCRIBE");
    };
    index.subscribe(conn.id, request).await;
}

#[tokio::test]
async fn test_subscribe_then_sample_reaches_only_matching_connections() {
    // A cpu+memory subscriber of srv-1 gets exactly one METRICS frame with
    // disk/network null; a subscriber of a different server hears nothing.
    let registry = Arc::new(ConnectionRegistry::new(100, 10));
    let index = SubscriptionIndex::new(CancellationToken::new());
    let broadcaster = Broadcaster::new(registry.clone(), index.clone());

    let (conn_one, mut rx_one) = register_connection(&registry, 64);
    let (conn_two, mut rx_two) = register_connection(&registry, 64);

    subscribe_via_wire(
        &index,
        &conn_one,
        r#"{"type":"SUBSCRIBE","data":{"servers":["srv-1"],"metrics":["cpu","memory"]}}"#,
    )
    .await;
    subscribe_via_wire(
        &index,
        &conn_two,
        r#"{"type":"SUBSCRIBE","data":{"servers":["srv-2"]}}"#,
    )
    .await;

    let sample = Arc::new(full_sample(
        "srv-1",
        1,
        Utc::now().timestamp_millis(),
        42.5,
        5_368_709_120,
    ));
    broadcaster.broadcast_sample(&sample);

    let frame = rx_one.try_recv().expect("subscriber must receive the frame");
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["type"], "METRICS");
    assert_eq!(value["data"]["server_id"], "srv-1");
    assert_eq!(value["data"]["cpu"]["usage_percent"], 42.5);
    assert_eq!(value["data"]["memory"]["used_bytes"], 5_368_709_120u64);
    assert!(value["data"]["disk"].is_null(), "disk must be absent");
    assert!(value["data"]["network"].is_null(), "network must be absent");

    assert!(
        rx_one.try_recv().is_err(),
        "exactly one frame per broadcast"
    );
    assert!(
        rx_two.try_recv().is_err(),
        "srv-2 subscriber must not hear srv-1 samples"
    );
}

#[tokio::test]
async fn test_slow_consumer_closes_without_affecting_others() {
    // Queue 64, drop ceiling 50. 120 broadcasts against a blocked writer:
    // 64 fill the queue, drops accumulate, the 51st drop (broadcast 115)
    // closes the connection, and a healthy peer sees every frame.
    let registry = Arc::new(ConnectionRegistry::new(100, 10));
    let index = SubscriptionIndex::new(CancellationToken::new());
    let broadcaster = Broadcaster::new(registry.clone(), index.clone());

    let (slow, _slow_rx) = register_connection(&registry, 64);
    let (healthy, mut healthy_rx) = register_connection(&registry, 200);

    subscribe_via_wire(
        &index,
        &slow,
        r#"{"type":"SUBSCRIBE","data":{"servers":["srv-1"]}}"#,
    )
    .await;
    subscribe_via_wire(
        &index,
        &healthy,
        r#"{"type":"SUBSCRIBE","data":{"servers":["srv-1"]}}"#,
    )
    .await;

    for seq in 1..=120u64 {
        let sample = Arc::new(full_sample("srv-1", seq, seq as i64 * 1_000, 10.0, 1_000));
        broadcaster.broadcast_sample(&sample);
    }

    assert!(slow.is_closing(), "slow consumer must be closed");
    assert_eq!(slow.close_reason(), Some("slow_consumer"));
    // 64 queued; of the remaining 56 attempts, the 51st drop closed the
    // connection, after which enqueues are inert.
    assert!(
        slow.dropped_total.load(std::sync::atomic::Ordering::Relaxed) >= 51,
        "dropped counter must have crossed the ceiling"
    );

    let mut healthy_count = 0;
    while healthy_rx.try_recv().is_ok() {
        healthy_count += 1;
    }
    assert_eq!(healthy_count, 120, "healthy consumer must see every frame");

    // Eviction from the index lands via the single writer lane.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let targets = index.sample_targets(&"srv-1".to_string(), ServerStatus::Online);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].connection, healthy.id);
}

#[tokio::test]
async fn test_per_connection_order_is_enqueue_order() {
    let registry = Arc::new(ConnectionRegistry::new(100, 10));
    let index = SubscriptionIndex::new(CancellationToken::new());
    let broadcaster = Broadcaster::new(registry.clone(), index.clone());

    let (conn, mut rx) = register_connection(&registry, 128);
    subscribe_via_wire(
        &index,
        &conn,
        r#"{"type":"SUBSCRIBE","data":{"servers":"all"}}"#,
    )
    .await;

    for seq in 1..=100u64 {
        let sample = Arc::new(full_sample("srv-1", seq, seq as i64 * 1_000, 10.0, 1_000));
        broadcaster.broadcast_sample(&sample);
    }

    let mut last_seq = 0u64;
    while let Ok(frame) = rx.try_recv() {
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let seq = value["data"]["seq"].as_u64().unwrap();
        assert!(seq > last_seq, "frames must arrive in enqueue order");
        last_seq = seq;
    }
    assert_eq!(last_seq, 100);
}

#[tokio::test]
async fn test_status_change_reaches_status_filtered_subscribers() {
    // A subscriber with a status floor still hears status transitions —
    // the floor filters steady-state samples, not the change itself.
    let registry = Arc::new(ConnectionRegistry::new(100, 10));
    let index = SubscriptionIndex::new(CancellationToken::new());
    let broadcaster = Broadcaster::new(registry.clone(), index.clone());

    let (conn, mut rx) = register_connection(&registry, 64);
    subscribe_via_wire(
        &index,
        &conn,
        r#"{"type":"SUBSCRIBE","data":{"servers":["srv-1"],"min_status":"warning"}}"#,
    )
    .await;

    // An online sample is below the floor.
    let sample = Arc::new(full_sample("srv-1", 1, 1_000, 10.0, 1_000));
    broadcaster.broadcast_sample(&sample);
    assert!(rx.try_recv().is_err(), "floor must filter online samples");

    let event = StatusEvent {
        server_id: "srv-1".to_string(),
        prior: ServerStatus::Online,
        new: ServerStatus::Offline,
        metric: None,
        observed_value: None,
        crossed_threshold: None,
        reason: "host_key_mismatch".to_string(),
        timestamp: Utc::now(),
    };
    broadcaster.broadcast_status(&event);

    let frame = rx.try_recv().expect("status change must be delivered");
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["type"], "STATUS_CHANGE");
    assert_eq!(value["data"]["new"], "offline");
    assert_eq!(value["data"]["reason"], "host_key_mismatch");
}

#[tokio::test]
async fn test_resubscribe_replaces_previous_interest() {
    let registry = Arc::new(ConnectionRegistry::new(100, 10));
    let index = SubscriptionIndex::new(CancellationToken::new());
    let broadcaster = Broadcaster::new(registry.clone(), index.clone());

    let (conn, mut rx) = register_connection(&registry, 64);
    subscribe_via_wire(
        &index,
        &conn,
        r#"{"type":"SUBSCRIBE","data":{"servers":["srv-1"]}}"#,
    )
    .await;
    subscribe_via_wire(
        &index,
        &conn,
        r#"{"type":"SUBSCRIBE","data":{"servers":["srv-2"]}}"#,
    )
    .await;

    broadcaster.broadcast_sample(&Arc::new(full_sample("srv-1", 1, 1_000, 10.0, 1_000)));
    assert!(
        rx.try_recv().is_err(),
        "replaced subscription must not deliver srv-1"
    );

    broadcaster.broadcast_sample(&Arc::new(full_sample("srv-2", 1, 1_000, 10.0, 1_000)));
    assert!(rx.try_recv().is_ok(), "new subscription must deliver srv-2");
}

#[tokio::test]
async fn test_wildcard_subscription_parses_and_routes() {
    let parsed = parse_client_message(r#"{"type":"SUBSCRIBE","data":{"servers":"all"}}"#)
        .expect("wildcard subscribe parses");
    let ClientMessage::Subscribe(request) = parsed else {
        panic!("expected SUBSCRIBE");
    };
    assert_eq!(request.servers, ServerSelector::All);
    assert!(request.metrics.is_none());

    let registry = Arc::new(ConnectionRegistry::new(100, 10));
    let index = SubscriptionIndex::new(CancellationToken::new());
    let broadcaster = Broadcaster::new(registry.clone(), index.clone());
    let (conn, mut rx) = register_connection(&registry, 64);
    index.subscribe(conn.id, request).await;

    for server in ["srv-a", "srv-b", "srv-c"] {
        broadcaster.broadcast_sample(&Arc::new(full_sample(server, 1, 1_000, 10.0, 1_000)));
    }
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    assert_eq!(count, 3, "wildcard subscriber hears every server");
}

#[tokio::test]
async fn test_metric_filter_mask_projection() {
    let set: std::collections::HashSet<MetricKind> =
        [MetricKind::Network].into_iter().collect();
    let mask = cwatcher::push::messages::mask_of(Some(&set));
    assert_eq!(mask, 0b1000);
}
