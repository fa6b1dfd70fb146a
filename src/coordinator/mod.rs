// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hub coordinator.
//!
//! [`CloudHub`] owns every long-lived piece and their background tasks:
//! - Credentials via [`crate::credentials::CredentialManager`] (plus token rotation)
//! - Node-facing listeners via [`crate::transport::TransportListener`]
//! - The registration loop feeding [`crate::registry::ConnectionRegistry`]
//! - The resync sweep ([`ReliableSyncTracker`])
//! - Debounced sync-record flushing to [`crate::sync_store::SyncStore`]
//! - The optional storage-driver socket
//!
//! # Startup
//!
//! 1. Validate config
//! 2. Ensure the certificate bundle (fatal on failure)
//! 3. Wait for the object-store caches (fatal on timeout)
//! 4. Open the sync store and restore records into queues
//! 5. Start token rotation, registration loop, listeners, tracker, flusher
//!
//! A listener that fails to bind is logged and skipped; the others run.
//!
//! # Shutdown
//!
//! Listeners and loops stop first, then every node is detached, then the
//! remaining dirty records are flushed and the store is closed. Queued
//! messages are not persisted; the tracker rebuilds them from desired state
//! on the next start.

mod types;
pub(crate) mod dispatcher;
mod tracker;

pub use dispatcher::DispatchExit;
pub use tracker::{NodeResync, ReliableSyncTracker, SweepStats};
pub use types::{HealthCheck, HubState};

use crate::admission::Admission;
use crate::circuit_breaker::ObjectStoreCircuit;
use crate::config::HubConfig;
use crate::credentials::{run_token_rotation, CredentialManager};
use crate::error::{HubError, Result};
use crate::message::{Message, NodeIdentity};
use crate::metrics;
use crate::object_store::{DesiredStateSource, NoOpObjectStore, UpstreamSink};
use crate::queue::{EnqueueOutcome, SyncRecord};
use crate::registry::{run_registrations, ConnectionRegistry};
use crate::resilience::{Bulkhead, RateLimiter};
use crate::router::MessageRouter;
use crate::secret_store::{MemorySecretStore, SecretStore};
use crate::sync_store::SyncStore;
use crate::transport::{AcceptContext, Accepted, Connection, Protocol, TransportListener};
use crate::uds::{StorageDriverHandler, UdsServer, UnsupportedStorageDriver};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Admitted connections waiting for the registration loop.
const REGISTRATION_BACKLOG: usize = 1024;

/// Reconnect events waiting for the tracker.
const RECONNECT_BACKLOG: usize = 4096;

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The cloud-side edge gateway.
pub struct CloudHub<S: DesiredStateSource = NoOpObjectStore> {
    config: HubConfig,

    state_tx: watch::Sender<HubState>,
    state_rx: watch::Receiver<HubState>,

    source: Arc<S>,
    credentials: Arc<CredentialManager>,
    circuit: Arc<ObjectStoreCircuit>,
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<ReliableSyncTracker<S>>,
    admission: Arc<Admission>,
    storage_driver: Arc<dyn StorageDriverHandler>,

    registration_tx: mpsc::Sender<Accepted>,
    registration_rx: Mutex<Option<mpsc::Receiver<Accepted>>>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<NodeIdentity>>>,

    sync_store: Arc<RwLock<Option<SyncStore>>>,
    listeners: RwLock<Vec<(Protocol, SocketAddr)>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl CloudHub<NoOpObjectStore> {
    /// Standalone hub: no object store, in-memory secrets.
    pub fn new(config: HubConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(NoOpObjectStore),
            Arc::new(NoOpObjectStore),
            Arc::new(MemorySecretStore::new()),
        )
    }
}

impl<S: DesiredStateSource> CloudHub<S> {
    /// Primary constructor used by the embedding process.
    pub fn with_collaborators(
        config: HubConfig,
        source: Arc<S>,
        upstream: Arc<dyn UpstreamSink>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(HubState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (registration_tx, registration_rx) = mpsc::channel(REGISTRATION_BACKLOG);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(RECONNECT_BACKLOG);

        let circuit = Arc::new(ObjectStoreCircuit::new());
        let credentials = Arc::new(CredentialManager::new(config.credentials.clone(), secrets));
        let admission = Arc::new(Admission::new(
            Arc::clone(&credentials),
            config.admission.admission_timeout_duration(),
        ));
        let router = Arc::new(MessageRouter::new(upstream, Arc::clone(&circuit)));
        let reconnects = config.sync.enabled.then_some(reconnect_tx);
        let registry = Arc::new(ConnectionRegistry::new(config.queue.clone(), router, reconnects));
        let tracker = Arc::new(ReliableSyncTracker::new(
            Arc::clone(&source),
            Arc::clone(&registry),
            Arc::clone(&circuit),
            config.sync.clone(),
            config.queue.enqueue_timeout_duration(),
        ));

        Self {
            config,
            state_tx,
            state_rx,
            source,
            credentials,
            circuit,
            registry,
            tracker,
            admission,
            storage_driver: Arc::new(UnsupportedStorageDriver),
            registration_tx,
            registration_rx: Mutex::new(Some(registration_rx)),
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            sync_store: Arc::new(RwLock::new(None)),
            listeners: RwLock::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Handler for the storage-driver socket (default: refuse everything).
    pub fn with_storage_driver(mut self, handler: Arc<dyn StorageDriverHandler>) -> Self {
        self.storage_driver = handler;
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn circuit(&self) -> &Arc<ObjectStoreCircuit> {
        &self.circuit
    }

    pub fn state(&self) -> HubState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<HubState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), HubState::Running)
    }

    fn set_state(&self, state: HubState) {
        let _ = self.state_tx.send(state);
        metrics::set_hub_state(&state.to_string());
    }

    fn fail(&self, e: HubError) -> HubError {
        error!(error = %e, "Hub startup failed");
        self.set_state(HubState::Failed);
        e
    }

    /// Start the hub. See the module docs for the sequence.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != HubState::Created {
            return Err(HubError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        self.config.validate().map_err(|e| self.fail(e))?;

        info!(
            websocket = self.config.websocket.enabled,
            quic = self.config.quic.enabled,
            unix_socket = self.config.unix_socket.enabled,
            "Starting cloud hub"
        );
        self.set_state(HubState::Starting);

        let bundle = self.credentials.ensure_certificates().await.map_err(|e| self.fail(e))?;
        info!(ca_hash = %bundle.ca_hash().unwrap_or_default(), "Certificate bundle ready");

        self.wait_for_cache_sync().await.map_err(|e| self.fail(e))?;
        self.open_sync_store().await.map_err(|e| self.fail(e))?;

        if let Err(e) = self.credentials.rotate().await {
            warn!(error = %e, "Initial token issue failed, rotation will retry");
        }
        self.spawn(run_token_rotation(Arc::clone(&self.credentials), self.shutdown_rx.clone()))
            .await;

        if let Some(registrations) = self.registration_rx.lock().await.take() {
            self.spawn(run_registrations(
                Arc::clone(&self.registry),
                registrations,
                self.shutdown_rx.clone(),
            ))
            .await;
        }

        self.start_listeners().await.map_err(|e| self.fail(e))?;

        if self.config.sync.enabled {
            if let Some(reconnects) = self.reconnect_rx.lock().await.take() {
                let tracker = Arc::clone(&self.tracker);
                self.spawn(tracker.run(reconnects, self.shutdown_rx.clone())).await;
            }
        }

        self.spawn_flush_task().await;
        self.start_storage_socket().await;

        self.set_state(HubState::Running);
        info!(listeners = self.listeners.read().await.len(), "Cloud hub running");
        Ok(())
    }

    async fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handles.write().await.push(tokio::spawn(task));
    }

    async fn wait_for_cache_sync(&self) -> Result<()> {
        let timeout = self.config.sync.cache_sync_timeout_duration();
        match tokio::time::timeout(timeout, self.source.wait_for_cache_sync()).await {
            Ok(Ok(true)) => {
                info!("Object store caches synced");
                Ok(())
            }
            Ok(Ok(false)) => Err(HubError::CacheSync("object store caches gave up".into())),
            Ok(Err(e)) => Err(HubError::CacheSync(e.to_string())),
            Err(_) => Err(HubError::CacheSync(format!("not synced within {:?}", timeout))),
        }
    }

    async fn open_sync_store(&self) -> Result<()> {
        let store = SyncStore::open(&self.config.store).await?;
        let mut by_node: HashMap<NodeIdentity, Vec<SyncRecord>> = HashMap::new();
        for record in store.load_all().await? {
            by_node.entry(record.node.clone()).or_default().push(record);
        }
        for (node, records) in by_node {
            self.registry.queue_for(&node).restore_records(records).await;
        }
        info!(path = %store.path(), "Sync store ready");
        *self.sync_store.write().await = Some(store);
        Ok(())
    }

    async fn start_listeners(&self) -> Result<()> {
        let ctx = Arc::new(AcceptContext {
            admission: Arc::clone(&self.admission),
            handshakes: Bulkhead::new(self.config.admission.max_concurrent_handshakes),
            limiter: self.config.admission.rate_limit_config().map(|cfg| {
                info!(rate_per_sec = cfg.refill_rate, burst = cfg.burst_size, "Admission rate limiting enabled");
                RateLimiter::new(cfg)
            }),
            registrations: self.registration_tx.clone(),
        });

        let mut bound = Vec::new();
        if self.config.websocket.enabled {
            let tls = self.credentials.server_tls_config()?;
            match TransportListener::bind_websocket(&self.config.websocket, tls).await {
                Ok(listener) => bound.push(listener),
                Err(e) => error!(error = %e, "WebSocket listener disabled"),
            }
        }
        if self.config.quic.enabled {
            let tls = self.credentials.quic_tls_config()?;
            let handshake_timeout = self.config.websocket.handshake_timeout_duration();
            match TransportListener::bind_quic(&self.config.quic, tls, handshake_timeout) {
                Ok(listener) => bound.push(listener),
                Err(e) => error!(error = %e, "QUIC listener disabled"),
            }
        }

        for listener in bound {
            let protocol = listener.protocol();
            if let Ok(addr) = listener.local_addr() {
                self.listeners.write().await.push((protocol, addr));
            }
            let ctx = Arc::clone(&ctx);
            self.spawn(listener.serve(ctx, self.shutdown_rx.clone())).await;
        }

        if self.config.has_network_listener() && self.listeners.read().await.is_empty() {
            warn!("No network listener could be started; only in-process attach is available");
        }
        Ok(())
    }

    async fn spawn_flush_task(&self) {
        let registry = Arc::clone(&self.registry);
        let sync_store = Arc::clone(&self.sync_store);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let flush_interval = self.config.sync.flush_interval_duration();

        self.spawn(async move {
            let _ = shutdown_rx.borrow_and_update();
            let mut timer =
                tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let guard = sync_store.read().await;
                        if let Some(store) = guard.as_ref() {
                            if let Err(e) = flush_records(&registry, store).await {
                                warn!(error = %e, "Failed to flush sync records");
                            }
                        }
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            debug!("Sync flush task stopping");
                            break;
                        }
                    }
                }
            }
        })
        .await;
    }

    async fn start_storage_socket(&self) {
        if !self.config.unix_socket.enabled {
            return;
        }
        match UdsServer::bind(&self.config.unix_socket, Arc::clone(&self.storage_driver)) {
            Ok(server) => self.spawn(server.serve(self.shutdown_rx.clone())).await,
            Err(e) => warn!(error = %e, path = %self.config.unix_socket.path, "Storage-driver socket disabled"),
        }
    }

    /// Address of the running listener for `protocol`.
    pub async fn local_addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.listeners
            .read()
            .await
            .iter()
            .find(|(p, _)| *p == protocol)
            .map(|(_, addr)| *addr)
    }

    /// Admit and register an in-process connection through the normal path.
    pub async fn attach(&self, conn: Arc<dyn Connection>) -> Result<NodeIdentity> {
        if !self.is_running() {
            let _ = conn.close().await;
            return Err(HubError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }
        let accepted = self
            .admission
            .admit(conn)
            .await
            .ok_or_else(|| HubError::admission("connection rejected"))?;
        let identity = accepted.identity.clone();
        self.registration_tx.send(accepted).await.map_err(|_| HubError::Shutdown)?;
        Ok(identity)
    }

    /// Queue `message` for `message.node`, waiting up to `queue.enqueue_timeout` for space.
    pub async fn enqueue(&self, message: Message) -> Result<EnqueueOutcome> {
        if matches!(self.state(), HubState::ShuttingDown | HubState::Stopped) {
            return Err(HubError::Shutdown);
        }
        let queue = self.registry.queue_for(&message.node);
        queue.enqueue(message, self.config.queue.enqueue_timeout_duration()).await
    }

    /// Permanently remove a node: connection, dispatcher, queue and stored records.
    pub async fn destroy_node(&self, identity: &NodeIdentity) -> Result<bool> {
        let existed = self.registry.destroy(identity).await;
        if let Some(store) = self.sync_store.read().await.as_ref() {
            store.delete_node(identity).await?;
        }
        Ok(existed)
    }

    /// Run one resync sweep now, ignoring backoff.
    pub async fn resync_now(&self) -> SweepStats {
        self.tracker.sweep().await
    }

    /// Persist dirty sync records now.
    pub async fn flush_sync_records(&self) -> Result<usize> {
        match self.sync_store.read().await.as_ref() {
            Some(store) => flush_records(&self.registry, store).await,
            None => Ok(0),
        }
    }

    /// Cached-state snapshot for readiness and liveness endpoints.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let ready = state == HubState::Running;
        let circuit_open = self.circuit.any_open();

        HealthCheck {
            state,
            ready,
            connected_nodes: self.registry.connected_count(),
            known_queues: self.registry.known_nodes().len(),
            queued_messages: self.registry.total_queued().await,
            circuit: self.circuit.metrics(),
            circuit_open,
            listeners: self
                .listeners
                .read()
                .await
                .iter()
                .map(|(p, addr)| (p.to_string(), *addr))
                .collect(),
            healthy: ready && !circuit_open,
        }
    }

    /// Stop everything.
    ///
    /// 1. Signal all tasks and wait for them (bounded)
    /// 2. Detach every node
    /// 3. Flush dirty records, checkpoint and close the store
    pub async fn shutdown(&mut self) {
        info!("Shutting down cloud hub");
        self.set_state(HubState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        self.registry.shutdown().await;

        if let Some(store) = self.sync_store.write().await.take() {
            match flush_records(&self.registry, &store).await {
                Ok(count) if count > 0 => info!(count, "Flushed sync records on shutdown"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush sync records on shutdown"),
            }
            store.close().await;
        }
        self.listeners.write().await.clear();

        self.set_state(HubState::Stopped);
        info!("Cloud hub stopped");
    }
}

/// Drain dirty records from every queue into the store. Failed rows go back
/// to their queue for the next attempt.
async fn flush_records(registry: &ConnectionRegistry, store: &SyncStore) -> Result<usize> {
    let mut flushed = 0;
    let mut errors = 0;

    for queue in registry.queues() {
        let (records, removed) = queue.take_dirty().await;
        if records.is_empty() && removed.is_empty() {
            continue;
        }
        let report = store.persist(queue.node(), records, removed).await;
        flushed += report.flushed;
        if report.errors() > 0 {
            errors += report.errors();
            queue.restore_dirty(&report.failed, &report.failed_removals).await;
        }
    }

    if flushed > 0 || errors > 0 {
        debug!(flushed, errors, "Flushed sync records");
        metrics::record_sync_flush(flushed, errors);
    }
    if errors > 0 {
        return Err(HubError::Internal(format!("failed to flush {} sync records", errors)));
    }
    Ok(flushed)
}
