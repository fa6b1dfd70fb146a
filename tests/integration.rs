// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the cloud hub.
//!
//! Nodes are in-process loopback connections admitted through the same path
//! as network peers, so no sockets or certificates are needed here. See
//! `tls_admission.rs` for the real listener.
//!
//! # Test Organization
//! - `replay_*` - reconnect redelivery
//! - `registration_*` - supersession of connections
//! - `resync_*` - tracker repairs against desired state
//! - `queue_*` - bounded capacity, destroy
//! - `restart_*` - sync records surviving a hub restart

mod common;

use common::{connect, init_tracing, hub_with, node, recv_and_ack, wait_until, wait_until_async, FakeObjectStore, RecordingUpstream};
use cloudhub::message::{Message, Operation, GROUP_TWIN};
use cloudhub::transport::{LoopbackConnection, PeerCredential};
use cloudhub::{EnqueueOutcome, HubConfig, HubError, HubState, SyncStoreConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn test_config() -> HubConfig {
    init_tracing();
    let mut config = HubConfig::for_testing();
    config.sync.enabled = false;
    config
}

// =============================================================================
// Reconnect Replay
// =============================================================================

#[tokio::test]
async fn replay_unacked_messages_in_order_after_reconnect() {
    let mut hub = hub_with(test_config(), Arc::new(FakeObjectStore::new()), Arc::new(RecordingUpstream::default()));
    hub.start().await.unwrap();
    let edge = node("edge-1");

    for i in 1..=5u64 {
        let msg = Message::update(edge.clone(), format!("devices/d{}", i), 1, json!({ "i": i }));
        assert_eq!(hub.enqueue(msg).await.unwrap(), EnqueueOutcome::Queued);
    }

    // First session: receive everything, acknowledge nothing.
    let first = connect(&hub, "edge-1").await;
    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(first.recv_timeout(Duration::from_secs(2)).await.unwrap().resource);
    }
    first.close();
    let registry = Arc::clone(hub.registry());
    assert!(wait_until(Duration::from_secs(2), || !registry.is_connected(&edge)).await);

    // Second session: the same five, same order, nothing extra.
    let second = connect(&hub, "edge-1").await;
    let mut replayed = Vec::new();
    for _ in 0..5 {
        let msg = recv_and_ack(&second).await.unwrap();
        replayed.push(msg.resource);
    }
    assert_eq!(seen, replayed);
    assert!(second.recv_timeout(Duration::from_millis(200)).await.is_none());

    let queue = hub.registry().existing_queue(&edge).unwrap();
    assert!(wait_until_async(Duration::from_secs(2), || {
        let queue = Arc::clone(&queue);
        async move { queue.is_empty().await }
    })
    .await);

    hub.shutdown().await;
}

#[tokio::test]
async fn replay_skips_acknowledged_messages() {
    let mut hub = hub_with(test_config(), Arc::new(FakeObjectStore::new()), Arc::new(RecordingUpstream::default()));
    hub.start().await.unwrap();
    let edge = node("edge-1");

    for i in 1..=3u64 {
        hub.enqueue(Message::update(edge.clone(), format!("r{}", i), 1, json!(i))).await.unwrap();
    }

    let first = connect(&hub, "edge-1").await;
    let acked = recv_and_ack(&first).await.unwrap();
    assert_eq!(acked.resource.as_str(), "r1");
    first.recv_timeout(Duration::from_secs(1)).await.unwrap();
    first.recv_timeout(Duration::from_secs(1)).await.unwrap();

    let queue = hub.registry().existing_queue(&edge).unwrap();
    assert!(wait_until_async(Duration::from_secs(2), || {
        let queue = Arc::clone(&queue);
        async move { queue.len().await == 2 }
    })
    .await);
    first.close();

    let second = connect(&hub, "edge-1").await;
    let a = second.recv_timeout(Duration::from_secs(2)).await.unwrap();
    let b = second.recv_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!((a.resource.as_str(), b.resource.as_str()), ("r2", "r3"));

    hub.shutdown().await;
}

// =============================================================================
// Registration Supersession
// =============================================================================

#[tokio::test]
async fn registration_race_leaves_one_connection() {
    // A lost stop signal would hold supersession for the whole stop timeout
    let mut config = test_config();
    config.queue.dispatcher_stop_timeout = "5s".into();
    let mut hub = hub_with(config, Arc::new(FakeObjectStore::new()), Arc::new(RecordingUpstream::default()));
    hub.start().await.unwrap();
    let edge = node("edge-1");

    let (conn_a, peer_a) = LoopbackConnection::pair(PeerCredential::Trusted(edge.clone()));
    let (conn_b, peer_b) = LoopbackConnection::pair(PeerCredential::Trusted(edge.clone()));
    let (ra, rb) = tokio::join!(hub.attach(conn_a), hub.attach(conn_b));
    ra.unwrap();
    rb.unwrap();

    let registry = Arc::clone(hub.registry());
    assert!(
        wait_until(Duration::from_millis(500), || {
            peer_a.is_closed() != peer_b.is_closed() && registry.connected_count() == 1
        })
        .await
    );

    let (live, dead) = if peer_a.is_closed() { (&peer_b, &peer_a) } else { (&peer_a, &peer_b) };
    assert_eq!(registry.lookup(&edge).unwrap().id(), live.connection_id());
    assert!(dead.is_closed());

    // Only the live connection is dispatched to.
    hub.enqueue(Message::update(edge.clone(), "r", 1, json!(1))).await.unwrap();
    assert_eq!(live.recv_timeout(Duration::from_secs(2)).await.unwrap().version, 1);
    assert!(dead.recv_timeout(Duration::from_millis(100)).await.is_none());

    hub.shutdown().await;
}

#[tokio::test]
async fn registration_late_disconnect_of_old_connection_is_ignored() {
    let mut hub = hub_with(test_config(), Arc::new(FakeObjectStore::new()), Arc::new(RecordingUpstream::default()));
    hub.start().await.unwrap();
    let edge = node("edge-1");

    let old = connect(&hub, "edge-1").await;
    let new = connect(&hub, "edge-1").await;
    assert!(old.is_closed());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(hub.registry().is_connected(&edge));
    assert_eq!(hub.registry().lookup(&edge).unwrap().id(), new.connection_id());

    hub.shutdown().await;
}

// =============================================================================
// Tracker Resync
// =============================================================================

#[tokio::test]
async fn resync_brings_node_from_acked_4_to_desired_7() {
    let store = Arc::new(FakeObjectStore::new());
    let mut hub = hub_with(test_config(), Arc::clone(&store), Arc::new(RecordingUpstream::default()));
    hub.start().await.unwrap();
    let edge = node("edge-1");

    store.put(&edge, "devices/r", 7).await;
    let queue = hub.registry().queue_for(&edge);
    queue.acknowledge(&"devices/r".into(), 4).await;
    assert!(queue.is_empty().await);

    let stats = hub.resync_now().await;
    assert_eq!(stats.resyncs_enqueued, 1);
    assert_eq!(stats.errors, 0);

    let queued = queue.snapshot().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].version, 7);
    assert_eq!(queued[0].operation, Operation::Update);

    // Already queued: a second pass adds nothing.
    assert_eq!(hub.resync_now().await.resyncs_enqueued, 0);

    let peer = connect(&hub, "edge-1").await;
    let msg = recv_and_ack(&peer).await.unwrap();
    assert_eq!(msg.version, 7);
    assert!(wait_until_async(Duration::from_secs(2), || {
        let queue = Arc::clone(&queue);
        async move { queue.record(&"devices/r".into()).await.is_some_and(|r| r.last_acked == 7) }
    })
    .await);
    assert_eq!(hub.resync_now().await.resyncs_enqueued, 0);

    hub.shutdown().await;
}

#[tokio::test]
async fn resync_enqueues_delete_for_removed_resource() {
    let store = Arc::new(FakeObjectStore::new());
    let mut hub = hub_with(test_config(), Arc::clone(&store), Arc::new(RecordingUpstream::default()));
    hub.start().await.unwrap();
    let edge = node("edge-1");

    let queue = hub.registry().queue_for(&edge);
    queue.acknowledge(&"devices/gone".into(), 3).await;
    store.remove(&edge, "devices/gone", 4).await;

    let stats = hub.resync_now().await;
    assert_eq!(stats.deletes_enqueued, 1);

    let peer = connect(&hub, "edge-1").await;
    let msg = recv_and_ack(&peer).await.unwrap();
    assert_eq!(msg.operation, Operation::Delete);
    assert_eq!(msg.version, 4);

    assert!(wait_until_async(Duration::from_secs(2), || {
        let queue = Arc::clone(&queue);
        async move { queue.record(&"devices/gone".into()).await.is_none() }
    })
    .await);

    hub.shutdown().await;
}

#[tokio::test]
async fn resync_runs_on_reconnect() {
    let store = Arc::new(FakeObjectStore::new());
    let mut config = test_config();
    config.sync.enabled = true;
    let mut hub = hub_with(config, Arc::clone(&store), Arc::new(RecordingUpstream::default()));
    hub.start().await.unwrap();
    let edge = node("edge-1");

    store.put(&edge, "devices/a", 2).await;
    let peer = connect(&hub, "edge-1").await;
    let msg = peer.recv_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(msg.resource.as_str(), "devices/a");
    assert_eq!(msg.version, 2);
    assert_eq!(msg.operation, Operation::Insert);

    hub.shutdown().await;
}

// =============================================================================
// Queues
// =============================================================================

#[tokio::test]
async fn queue_full_fails_after_timeout() {
    let mut config = test_config();
    config.queue.capacity = 2;
    config.queue.enqueue_timeout = "50ms".into();
    let mut hub = hub_with(config, Arc::new(FakeObjectStore::new()), Arc::new(RecordingUpstream::default()));
    hub.start().await.unwrap();
    let edge = node("edge-1");

    hub.enqueue(Message::update(edge.clone(), "a", 1, json!(1))).await.unwrap();
    hub.enqueue(Message::update(edge.clone(), "b", 1, json!(1))).await.unwrap();
    let err = hub.enqueue(Message::update(edge.clone(), "c", 1, json!(1))).await.unwrap_err();
    assert!(matches!(err, HubError::QueueFull { capacity: 2, .. }));

    // Superseding an existing entry needs no space.
    assert_eq!(
        hub.enqueue(Message::update(edge.clone(), "a", 2, json!(2))).await.unwrap(),
        EnqueueOutcome::Superseded
    );

    let queued: Vec<_> = hub.registry().existing_queue(&edge).unwrap().snapshot().await;
    let summary: Vec<_> = queued.iter().map(|m| (m.resource.as_str().to_string(), m.version)).collect();
    assert_eq!(summary, vec![("a".to_string(), 2), ("b".to_string(), 1)]);

    hub.shutdown().await;
}

#[tokio::test]
async fn queue_survives_disconnect_and_dies_on_destroy() {
    let mut hub = hub_with(test_config(), Arc::new(FakeObjectStore::new()), Arc::new(RecordingUpstream::default()));
    hub.start().await.unwrap();
    let edge = node("edge-1");

    let peer = connect(&hub, "edge-1").await;
    peer.close();
    let registry = Arc::clone(hub.registry());
    assert!(wait_until(Duration::from_secs(2), || !registry.is_connected(&edge)).await);
    assert!(registry.existing_queue(&edge).is_some());

    let peer = connect(&hub, "edge-1").await;
    assert!(hub.destroy_node(&edge).await.unwrap());
    assert!(peer.is_closed());
    assert!(registry.existing_queue(&edge).is_none());
    assert!(!hub.destroy_node(&edge).await.unwrap());

    hub.shutdown().await;
}

// =============================================================================
// Upstream Routing
// =============================================================================

#[tokio::test]
async fn upstream_messages_are_forwarded() {
    let upstream = Arc::new(RecordingUpstream::default());
    let mut hub = hub_with(test_config(), Arc::new(FakeObjectStore::new()), Arc::clone(&upstream));
    hub.start().await.unwrap();
    let edge = node("edge-1");

    let peer = connect(&hub, "edge-1").await;
    let report = Message::new(edge.clone(), GROUP_TWIN, "twins/t1", Operation::Update, 3, json!({"temp": 21}));
    peer.send(report.clone()).await.unwrap();
    peer.send(Message::keepalive(edge.clone())).await.unwrap();

    assert!(wait_until_async(Duration::from_secs(2), || {
        let upstream = Arc::clone(&upstream);
        async move { upstream.forwarded().await.len() == 1 }
    })
    .await);
    assert_eq!(upstream.forwarded().await[0].id, report.id);

    hub.shutdown().await;
}

#[tokio::test]
async fn token_admission_registers_node() {
    let mut hub = hub_with(test_config(), Arc::new(FakeObjectStore::new()), Arc::new(RecordingUpstream::default()));
    hub.start().await.unwrap();
    let edge = node("edge-7");

    let token = hub.credentials().current_token().await.unwrap();
    let (conn, peer) = LoopbackConnection::pair(PeerCredential::Anonymous);
    peer.send(Message::admit(edge.clone(), token.token)).await.unwrap();
    assert_eq!(hub.attach(conn).await.unwrap(), edge);

    let registry = Arc::clone(hub.registry());
    assert!(wait_until(Duration::from_secs(2), || registry.is_connected(&edge)).await);

    let (conn, peer) = LoopbackConnection::pair(PeerCredential::Anonymous);
    peer.send(Message::admit(node("edge-8"), "not-a-token")).await.unwrap();
    assert!(matches!(hub.attach(conn).await, Err(HubError::Admission { .. })));
    assert!(peer.is_closed());

    hub.shutdown().await;
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn startup_fails_when_caches_never_sync() {
    let mut hub = hub_with(
        test_config(),
        Arc::new(FakeObjectStore::never_synced()),
        Arc::new(RecordingUpstream::default()),
    );
    assert!(matches!(hub.start().await, Err(HubError::CacheSync(_))));
    assert_eq!(hub.state(), HubState::Failed);
}

// =============================================================================
// Restart Persistence
// =============================================================================

#[tokio::test]
async fn restart_resends_only_what_was_not_acked() {
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.store = SyncStoreConfig {
        sqlite_path: dir.path().join("sync.db").to_string_lossy().to_string(),
        wal_mode: true,
    };
    let store = Arc::new(FakeObjectStore::new());
    let edge = node("edge-1");
    store.put(&edge, "devices/a", 4).await;
    store.put(&edge, "devices/b", 2).await;

    // First run: node acknowledges both.
    {
        let mut hub = hub_with(config.clone(), Arc::clone(&store), Arc::new(RecordingUpstream::default()));
        hub.start().await.unwrap();
        hub.resync_now().await;
        let peer = connect(&hub, "edge-1").await;
        recv_and_ack(&peer).await.unwrap();
        recv_and_ack(&peer).await.unwrap();

        let queue = hub.registry().existing_queue(&edge).unwrap();
        assert!(wait_until_async(Duration::from_secs(2), || {
            let queue = Arc::clone(&queue);
            async move { queue.records().await.iter().all(|r| r.last_acked > 0) && queue.is_empty().await }
        })
        .await);
        hub.shutdown().await;
    }

    // Desired state moves on while the hub is down.
    store.put(&edge, "devices/a", 7).await;

    let mut hub = hub_with(config, Arc::clone(&store), Arc::new(RecordingUpstream::default()));
    hub.start().await.unwrap();
    let stats = hub.resync_now().await;
    assert_eq!(stats.resyncs_enqueued, 1);

    let peer = connect(&hub, "edge-1").await;
    let msg = peer.recv_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!((msg.resource.as_str(), msg.version), ("devices/a", 7));
    assert_eq!(msg.operation, Operation::Update);
    assert!(peer.recv_timeout(Duration::from_millis(200)).await.is_none());

    hub.shutdown().await;
}
