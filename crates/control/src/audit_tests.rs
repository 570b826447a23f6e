// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::protocol::epoch_ms;

fn event(kind: AuditKind, user: Option<&str>, agent: Option<&str>, created_at: u64) -> AuditEvent {
    AuditEvent {
        kind,
        user_id: user.map(str::to_owned),
        agent_id: agent.map(str::to_owned),
        command_id: None,
        details: serde_json::json!({}),
        created_at,
    }
}

fn query() -> AuditQuery {
    AuditQuery { limit: 100, ..AuditQuery::default() }
}

#[test]
fn store_returns_newest_first() {
    let store = MemoryAuditStore::new();
    let now = epoch_ms();
    store.append(event(AuditKind::AuthLogin, Some("u1"), None, now - 3000));
    store.append(event(AuditKind::AgentConnected, None, Some("a1"), now - 2000));
    store.append(event(AuditKind::CommandExecuted, Some("u1"), Some("a1"), now - 1000));

    let results = store.query(&query());
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].kind, AuditKind::CommandExecuted);
    assert_eq!(results[2].kind, AuditKind::AuthLogin);
}

#[test]
fn store_filters_by_kind_user_agent_and_range() {
    let store = MemoryAuditStore::new();
    let now = epoch_ms();
    store.append(event(AuditKind::AuthLogin, Some("u1"), None, now - 5000));
    store.append(event(AuditKind::AuthLogin, Some("u2"), None, now - 4000));
    store.append(event(AuditKind::CommandFailed, Some("u1"), Some("a1"), now - 3000));
    store.append(event(AuditKind::CommandFailed, Some("u1"), Some("a2"), now - 2000));

    let by_kind =
        store.query(&AuditQuery { kind: Some(AuditKind::AuthLogin), ..query() });
    assert_eq!(by_kind.len(), 2);

    let by_user = store.query(&AuditQuery { user_id: Some("u2".into()), ..query() });
    assert_eq!(by_user.len(), 1);

    let by_agent = store.query(&AuditQuery { agent_id: Some("a1".into()), ..query() });
    assert_eq!(by_agent.len(), 1);

    let by_range = store.query(&AuditQuery {
        from: Some(now - 3500),
        to: Some(now - 2500),
        ..query()
    });
    assert_eq!(by_range.len(), 1);
    assert_eq!(by_range[0].agent_id.as_deref(), Some("a1"));
}

#[test]
fn store_paginates() {
    let store = MemoryAuditStore::new();
    let now = epoch_ms();
    for i in 0..10 {
        store.append(event(AuditKind::AuthLogin, Some("u1"), None, now - 1000 + i));
    }

    let page1 = store.query(&AuditQuery { limit: 4, offset: 0, ..AuditQuery::default() });
    let page2 = store.query(&AuditQuery { limit: 4, offset: 4, ..AuditQuery::default() });
    let page3 = store.query(&AuditQuery { limit: 4, offset: 8, ..AuditQuery::default() });
    assert_eq!(page1.len(), 4);
    assert_eq!(page2.len(), 4);
    assert_eq!(page3.len(), 2);
    assert!(page1[0].created_at > page2[0].created_at);
}

#[test]
fn retention_hides_old_events() {
    let store = MemoryAuditStore::new();
    let now = epoch_ms();
    // 31 days old — past retention.
    store.append(event(AuditKind::AuthLogin, Some("u1"), None, now - 31 * 24 * 3600 * 1000));
    store.append(event(AuditKind::AuthLogin, Some("u1"), None, now));

    let results = store.query(&query());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].created_at, now);
}

#[test]
fn query_validation_bounds_limit() {
    assert!(AuditQuery::validated(None, None, None, None, None, Some(0), None).is_err());
    assert!(AuditQuery::validated(None, None, None, None, None, Some(1001), None).is_err());

    let ok = AuditQuery::validated(None, None, None, None, None, Some(1000), Some(5)).unwrap();
    assert_eq!(ok.limit, 1000);
    assert_eq!(ok.offset, 5);

    let defaulted = AuditQuery::validated(None, None, None, None, None, None, None).unwrap();
    assert_eq!(defaulted.limit, 100);
}

#[test]
fn kind_parse_roundtrip() {
    for kind in [
        AuditKind::AuthLogin,
        AuditKind::AuthTokenRefresh,
        AuditKind::AgentConnected,
        AuditKind::AgentDisconnected,
        AuditKind::CommandExecuted,
        AuditKind::CommandCompleted,
        AuditKind::CommandFailed,
        AuditKind::CommandCancelled,
        AuditKind::SecurityAlert,
        AuditKind::EmergencyStopTriggered,
    ] {
        assert_eq!(AuditKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(AuditKind::parse("NOT_A_TAG"), None);
}

#[tokio::test]
async fn sink_appends_through_writer_task() {
    let store = Arc::new(MemoryAuditStore::new());
    let sink = AuditSink::new(
        Arc::clone(&store) as Arc<dyn AuditStore>,
        64,
        CancellationToken::new(),
    );

    sink.append(
        AuditKind::EmergencyStopTriggered,
        Some("u1"),
        None,
        None,
        serde_json::json!({"agentsStopped": 2, "commandsCancelled": 4}),
    );

    // Give the writer task a moment to drain.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        let results = store.query(&query());
        if !results.is_empty() {
            assert_eq!(results[0].kind, AuditKind::EmergencyStopTriggered);
            assert_eq!(results[0].details["commandsCancelled"], 4);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "writer never flushed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.dropped_events(), 0);
}

#[tokio::test]
async fn sink_counts_overflow_as_dropped() {
    let store = Arc::new(MemoryAuditStore::new());
    // Stop the writer immediately so the buffer fills.
    let shutdown = CancellationToken::new();
    let sink = AuditSink::new(Arc::clone(&store) as Arc<dyn AuditStore>, 2, shutdown.clone());
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    for _ in 0..5 {
        sink.append(AuditKind::AuthLogin, None, None, None, serde_json::json!({}));
    }
    assert!(sink.dropped_events() >= 3, "overflow beyond the buffer is counted");
}
