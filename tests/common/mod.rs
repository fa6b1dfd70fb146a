//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory desired-state source with failure injection
//! - An upstream sink that records what nodes sent
//! - Helpers for loopback nodes and polling

#![allow(dead_code)]

use cloudhub::message::{Message, NodeIdentity, ResourcePath};
use cloudhub::object_store::{BoxFuture, DesiredObject, DesiredStateSource, StoreError, UpstreamSink};
use cloudhub::transport::{Connection, LoopbackConnection, LoopbackPeer, PeerCredential};
use cloudhub::{CloudHub, HubConfig, MemorySecretStore};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Log to the test writer; `RUST_LOG=cloudhub=debug` for detail.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cloudhub=warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn node(name: &str) -> NodeIdentity {
    NodeIdentity::new(name).unwrap()
}

/// Desired state kept in memory, keyed by node then resource.
pub struct FakeObjectStore {
    objects: RwLock<HashMap<NodeIdentity, BTreeMap<ResourcePath, DesiredObject>>>,
    synced: AtomicBool,
    fail_reads: AtomicBool,
    reads: AtomicUsize,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(true),
            fail_reads: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        }
    }

    /// Caches that report they gave up.
    pub fn never_synced() -> Self {
        let store = Self::new();
        store.synced.store(false, Ordering::SeqCst);
        store
    }

    pub async fn put(&self, node: &NodeIdentity, resource: &str, version: u64) {
        let obj = DesiredObject::present(resource, version, json!({ "v": version }));
        self.objects
            .write()
            .await
            .entry(node.clone())
            .or_default()
            .insert(obj.resource.clone(), obj);
    }

    pub async fn remove(&self, node: &NodeIdentity, resource: &str, version: u64) {
        let obj = DesiredObject::deleted(resource, version);
        self.objects
            .write()
            .await
            .entry(node.clone())
            .or_default()
            .insert(obj.resource.clone(), obj);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError("object store unavailable".into()));
        }
        Ok(())
    }
}

impl DesiredStateSource for FakeObjectStore {
    fn wait_for_cache_sync(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(self.synced.load(Ordering::SeqCst)) })
    }

    fn list_nodes(&self) -> BoxFuture<'_, Vec<NodeIdentity>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.objects.read().await.keys().cloned().collect())
        })
    }

    fn desired_state(&self, node: &NodeIdentity) -> BoxFuture<'_, Vec<DesiredObject>> {
        let node = node.clone();
        Box::pin(async move {
            self.check()?;
            Ok(self
                .objects
                .read()
                .await
                .get(&node)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default())
        })
    }
}

/// Upstream sink that keeps every forwarded message.
#[derive(Default)]
pub struct RecordingUpstream {
    forwarded: RwLock<Vec<Message>>,
}

impl RecordingUpstream {
    pub async fn forwarded(&self) -> Vec<Message> {
        self.forwarded.read().await.clone()
    }
}

impl UpstreamSink for RecordingUpstream {
    fn forward(&self, message: Message) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.forwarded.write().await.push(message);
            Ok(())
        })
    }
}

/// Hub wired to a fake object store and a recording upstream.
pub fn hub_with(
    config: HubConfig,
    store: Arc<FakeObjectStore>,
    upstream: Arc<RecordingUpstream>,
) -> CloudHub<FakeObjectStore> {
    CloudHub::with_collaborators(config, store, upstream, Arc::new(MemorySecretStore::new()))
}

/// Attach a trusted loopback node and wait until it is registered.
pub async fn connect<S: DesiredStateSource>(hub: &CloudHub<S>, name: &str) -> LoopbackPeer {
    let (conn, peer) = LoopbackConnection::pair(PeerCredential::Trusted(node(name)));
    let conn_id = peer.connection_id();
    hub.attach(conn).await.unwrap();

    let registry = Arc::clone(hub.registry());
    let identity = node(name);
    assert!(
        wait_until(Duration::from_secs(2), || {
            registry.lookup(&identity).is_some_and(|c| c.id() == conn_id)
        })
        .await,
        "node {} never registered",
        name
    );
    peer
}

/// Receive one message and acknowledge it.
pub async fn recv_and_ack(peer: &LoopbackPeer) -> Option<Message> {
    let msg = peer.recv_timeout(Duration::from_secs(2)).await?;
    peer.send(msg.ack()).await.ok()?;
    Some(msg)
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Async flavour of [`wait_until`].
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond().await
}
