// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::pool::{ConnectionEntry, ConnectionPool};

async fn dashboard(
    pool: &ConnectionPool,
    fanout: &Fanout,
    id: &str,
) -> (Arc<ConnectionEntry>, tokio::sync::mpsc::Receiver<String>) {
    let (entry, rx) =
        pool.add(id.to_owned(), "127.0.0.1:1".into(), "test".into(), CancellationToken::new()).await;
    fanout.register(&entry).await;
    (entry, rx)
}

#[test]
fn class_set_parsing() {
    let set = ClassSet::from_names(["terminal", "status"]);
    assert!(set.terminal && set.status);
    assert!(!set.trace && !set.command && !set.queue);

    // Empty means everything; unknown names are ignored.
    assert_eq!(ClassSet::from_names([]), ClassSet::all());
    let unknown_only = ClassSet::from_names(["bogus"]);
    assert!(!unknown_only.contains(EventClass::Terminal));
}

#[tokio::test]
async fn publish_reaches_matching_subscriber_in_order() {
    let pool = ConnectionPool::new();
    let fanout = Fanout::new(256);
    let (_entry, mut rx) = dashboard(&pool, &fanout, "d1").await;

    fanout.subscribe("d1", "a1", ClassSet::from_names(["terminal"])).await;

    for seq in 1..=5 {
        fanout.publish("a1", EventClass::Terminal, &format!("frame-{seq}")).await;
    }

    for seq in 1..=5 {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, format!("frame-{seq}"), "delivery preserves dispatch order");
    }
}

#[tokio::test]
async fn publish_filters_by_agent_and_class() {
    let pool = ConnectionPool::new();
    let fanout = Fanout::new(256);
    let (_entry, mut rx) = dashboard(&pool, &fanout, "d1").await;

    fanout.subscribe("d1", "a1", ClassSet::from_names(["terminal"])).await;

    // Wrong agent and wrong class are both invisible.
    fanout.publish("a2", EventClass::Terminal, "other-agent").await;
    fanout.publish("a1", EventClass::Trace, "other-class").await;
    fanout.publish("a1", EventClass::Terminal, "wanted").await;

    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(frame, "wanted");
}

#[tokio::test]
async fn wildcard_subscription_matches_every_agent() {
    let pool = ConnectionPool::new();
    let fanout = Fanout::new(256);
    let (_entry, mut rx) = dashboard(&pool, &fanout, "d1").await;

    fanout.subscribe("d1", "*", ClassSet::all()).await;

    fanout.publish("a1", EventClass::Status, "s1").await;
    fanout.publish("a2", EventClass::Queue, "s2").await;

    assert_eq!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(), "s1");
    assert_eq!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(), "s2");
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let pool = ConnectionPool::new();
    let fanout = Fanout::new(256);
    let (_entry, mut rx) = dashboard(&pool, &fanout, "d1").await;

    fanout.subscribe("d1", "a1", ClassSet::all()).await;
    fanout.unsubscribe("d1", "a1").await;
    assert_eq!(fanout.subscriber_count("a1", EventClass::Terminal).await, 0);

    fanout.publish("a1", EventClass::Terminal, "late").await;
    assert!(
        tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
        "nothing delivered after unsubscribe"
    );
}

#[tokio::test]
async fn removing_dashboard_drops_all_subscriptions() {
    let pool = ConnectionPool::new();
    let fanout = Fanout::new(256);
    let (_entry, _rx) = dashboard(&pool, &fanout, "d1").await;

    fanout.subscribe("d1", "a1", ClassSet::all()).await;
    fanout.subscribe("d1", "a2", ClassSet::all()).await;

    fanout.remove("d1").await;
    assert_eq!(fanout.subscriber_count("a1", EventClass::Status).await, 0);
    assert_eq!(fanout.subscriber_count("a2", EventClass::Status).await, 0);
}

#[tokio::test]
async fn overflow_drops_oldest_frames() {
    let pool = ConnectionPool::new();
    let fanout = Fanout::new(2);
    let (entry, _rx) = dashboard(&pool, &fanout, "d1").await;
    fanout.subscribe("d1", "a1", ClassSet::all()).await;

    // Stop the drain task so the buffer actually fills.
    entry.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    for seq in 1..=5 {
        fanout.publish("a1", EventClass::Terminal, &format!("frame-{seq}")).await;
    }
    assert_eq!(fanout.dropped_frames().await, 3, "capacity 2 keeps the newest two");
}

#[tokio::test]
async fn publish_except_skips_the_named_dashboard() {
    let pool = ConnectionPool::new();
    let fanout = Fanout::new(256);
    let (_e1, mut rx1) = dashboard(&pool, &fanout, "d1").await;
    let (_e2, mut rx2) = dashboard(&pool, &fanout, "d2").await;
    fanout.subscribe("d1", "a1", ClassSet::all()).await;
    fanout.subscribe("d2", "a1", ClassSet::all()).await;

    // d1 already got a directed copy; the fan-out copy goes to d2 only.
    fanout.publish_except("a1", EventClass::Command, "frame", Some("d1")).await;

    assert_eq!(tokio::time::timeout(Duration::from_secs(1), rx2.recv()).await.unwrap().unwrap(), "frame");
    assert!(tokio::time::timeout(Duration::from_millis(50), rx1.recv()).await.is_err());
}

#[tokio::test]
async fn merged_subscriptions_accumulate_classes() {
    let pool = ConnectionPool::new();
    let fanout = Fanout::new(256);
    let (_entry, mut rx) = dashboard(&pool, &fanout, "d1").await;

    fanout.subscribe("d1", "a1", ClassSet::from_names(["terminal"])).await;
    fanout.subscribe("d1", "a1", ClassSet::from_names(["queue"])).await;

    fanout.publish("a1", EventClass::Queue, "q").await;
    fanout.publish("a1", EventClass::Terminal, "t").await;

    assert_eq!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(), "q");
    assert_eq!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(), "t");
}
