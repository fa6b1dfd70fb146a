// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection registry: one live connection and one queue per node.
//!
//! # Per-Identity Serialization
//!
//! Every node has a [`NodeSlot`] holding an async mutex around its current
//! attachment (connection, dispatcher, receive loop). Registration,
//! disconnect and destroy for one identity take that lock; different
//! identities never contend. Destroy removes the slot while holding it, so a
//! registration that was waiting on the old slot retries on a fresh one.
//!
//! ```text
//! on_register(edge-1, conn B)          slot(edge-1) locked
//!   ├── close conn A, stop dispatcher A (bounded wait)
//!   ├── rewind queue (in-flight → pending)
//!   ├── spawn dispatcher B + receive loop B
//!   └── notify tracker (reconnect)     slot(edge-1) released
//! ```
//!
//! The receive loop of A eventually calls `on_disconnect(edge-1, A.id)`; by
//! then B is attached, the connection ids differ, and nothing happens.
//!
//! Queues are keyed separately and outlive attachments. Only
//! [`destroy`](ConnectionRegistry::destroy) removes one.

use crate::config::QueueConfig;
use crate::coordinator::dispatcher::run_dispatcher;
use crate::error::HubError;
use crate::message::NodeIdentity;
use crate::metrics;
use crate::queue::NodeQueue;
use crate::router::MessageRouter;
use crate::transport::{Accepted, Connection};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

struct Attachment {
    conn: Arc<dyn Connection>,
    stop_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
}

#[derive(Default)]
struct NodeSlot {
    attachment: Arc<Mutex<Option<Attachment>>>,
    /// Unix millis of the last inbound frame.
    last_seen: AtomicI64,
}

/// Identity → connection and identity → queue maps.
pub struct ConnectionRegistry {
    slots: DashMap<NodeIdentity, Arc<NodeSlot>>,
    connections: DashMap<NodeIdentity, Arc<dyn Connection>>,
    queues: DashMap<NodeIdentity, Arc<NodeQueue>>,
    router: Arc<MessageRouter>,
    config: QueueConfig,
    reconnects: Option<mpsc::Sender<NodeIdentity>>,
}

impl ConnectionRegistry {
    pub fn new(config: QueueConfig, router: Arc<MessageRouter>, reconnects: Option<mpsc::Sender<NodeIdentity>>) -> Self {
        Self {
            slots: DashMap::new(),
            connections: DashMap::new(),
            queues: DashMap::new(),
            router,
            config,
            reconnects,
        }
    }

    fn slot(&self, identity: &NodeIdentity) -> Arc<NodeSlot> {
        Arc::clone(self.slots.entry(identity.clone()).or_default().value())
    }

    /// Lock the node's slot, retrying if it was removed while we waited.
    async fn lock_slot(&self, identity: &NodeIdentity) -> (Arc<NodeSlot>, OwnedMutexGuard<Option<Attachment>>) {
        loop {
            let slot = self.slot(identity);
            let guard = Arc::clone(&slot.attachment).lock_owned().await;
            let current = self
                .slots
                .get(identity)
                .is_some_and(|s| Arc::ptr_eq(s.value(), &slot));
            if current {
                return (slot, guard);
            }
            debug!(node = %identity, "Slot removed while waiting, retrying");
        }
    }

    /// The node's queue, created on first use.
    pub fn queue_for(&self, identity: &NodeIdentity) -> Arc<NodeQueue> {
        let entry = self
            .queues
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(NodeQueue::new(identity.clone(), self.config.capacity)));
        Arc::clone(entry.value())
    }

    /// Existing queue only.
    pub fn existing_queue(&self, identity: &NodeIdentity) -> Option<Arc<NodeQueue>> {
        self.queues.get(identity).map(|q| Arc::clone(q.value()))
    }

    /// Attach an admitted connection, superseding any previous one.
    pub async fn on_register(self: &Arc<Self>, accepted: Accepted) {
        let Accepted { identity, conn } = accepted;
        let (slot, mut current) = self.lock_slot(&identity).await;

        let superseded = match current.take() {
            Some(old) => {
                info!(
                    node = %identity,
                    old_conn = old.conn.id(),
                    new_conn = conn.id(),
                    "Superseding existing connection"
                );
                self.detach(&identity, old).await;
                metrics::record_node_disconnected("superseded");
                true
            }
            None => false,
        };

        let queue = self.queue_for(&identity);
        let rewound = queue.rewind().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = {
            let identity = identity.clone();
            let queue = Arc::clone(&queue);
            let conn = Arc::clone(&conn);
            let max_in_flight = self.config.max_in_flight;
            let stop_rx = stop_rx.clone();
            tokio::spawn(async move {
                run_dispatcher(identity, queue, conn, max_in_flight, stop_rx).await;
            })
        };

        {
            let registry = Arc::clone(self);
            let identity = identity.clone();
            let conn = Arc::clone(&conn);
            let slot = Arc::clone(&slot);
            let span = tracing::info_span!("receiver", node = %identity, conn_id = conn.id());
            tokio::spawn(
                async move {
                    registry.run_receiver(identity, queue, conn, slot, stop_rx).await;
                }
                .instrument(span),
            );
        }

        slot.last_seen.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.connections.insert(identity.clone(), Arc::clone(&conn));
        *current = Some(Attachment {
            conn: Arc::clone(&conn),
            stop_tx,
            dispatcher,
        });
        drop(current);

        metrics::record_node_registered(superseded);
        metrics::set_connected_nodes(self.connections.len());
        info!(
            node = %identity,
            protocol = %conn.protocol(),
            conn_id = conn.id(),
            remote = ?conn.remote_addr(),
            superseded,
            rewound,
            "Node registered"
        );

        if let Some(tx) = &self.reconnects {
            if tx.try_send(identity.clone()).is_err() {
                debug!(node = %identity, "Reconnect queue full, periodic sweep will cover it");
            }
        }
    }

    /// Close the connection and stop its dispatcher. Caller holds the slot lock.
    async fn detach(&self, identity: &NodeIdentity, old: Attachment) {
        let _ = old.stop_tx.send(true);
        let _ = old.conn.close().await;
        self.connections
            .remove_if(identity, |_, c| c.id() == old.conn.id());

        let mut dispatcher = old.dispatcher;
        let timeout = self.config.dispatcher_stop_timeout_duration();
        if tokio::time::timeout(timeout, &mut dispatcher).await.is_err() {
            warn!(node = %identity, ?timeout, "Dispatcher did not stop in time, aborting");
            dispatcher.abort();
        }
    }

    /// Receive loop for one connection. Ends on close, error, idle timeout
    /// or stop, then deregisters.
    async fn run_receiver(
        self: Arc<Self>,
        identity: NodeIdentity,
        queue: Arc<NodeQueue>,
        conn: Arc<dyn Connection>,
        slot: Arc<NodeSlot>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        // Superseded before the first poll; the registry already detached us
        if *stop_rx.borrow_and_update() {
            let _ = conn.close().await;
            return;
        }
        let idle = self.config.node_idle_timeout();

        let reason = loop {
            let received = tokio::select! {
                biased;

                result = stop_rx.changed() => {
                    if result.is_err() || *stop_rx.borrow() {
                        break "stopped";
                    }
                    continue;
                }

                received = tokio::time::timeout(idle, conn.receive()) => received,
            };

            match received {
                Err(_) => {
                    info!(?idle, "No inbound traffic, closing idle connection");
                    break "idle";
                }
                Ok(Ok(Some(message))) => {
                    slot.last_seen.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
                    self.router.route(&identity, &queue, message).await;
                }
                Ok(Ok(None)) => break "closed",
                Ok(Err(HubError::Frame(e))) => {
                    warn!(error = %e, "Malformed frame, closing connection");
                    break "malformed_frame";
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "Receive failed");
                    break "io_error";
                }
            }
        };

        let _ = conn.close().await;
        self.on_disconnect(&identity, conn.id(), reason).await;
    }

    /// Detach `conn_id` if it is still the node's current connection.
    ///
    /// The queue and its unacknowledged contents are kept. Returns whether
    /// anything was detached.
    pub async fn on_disconnect(&self, identity: &NodeIdentity, conn_id: u64, reason: &str) -> bool {
        let Some(slot) = self.slots.get(identity).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut current = slot.attachment.lock().await;
        if current.as_ref().map(|a| a.conn.id()) != Some(conn_id) {
            return false;
        }
        let Some(old) = current.take() else {
            return false;
        };
        self.detach(identity, old).await;
        drop(current);

        metrics::record_node_disconnected(reason);
        metrics::set_connected_nodes(self.connections.len());
        info!(node = %identity, conn_id, reason, "Node disconnected, queue retained");
        true
    }

    /// Current connection for `identity`.
    pub fn lookup(&self, identity: &NodeIdentity) -> Option<Arc<dyn Connection>> {
        self.connections.get(identity).map(|c| Arc::clone(c.value()))
    }

    pub fn is_connected(&self, identity: &NodeIdentity) -> bool {
        self.connections.contains_key(identity)
    }

    /// Unix millis of the last inbound frame from `identity`.
    pub fn last_seen(&self, identity: &NodeIdentity) -> Option<i64> {
        self.slots.get(identity).map(|s| s.last_seen.load(Ordering::Relaxed))
    }

    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }

    pub fn known_nodes(&self) -> Vec<NodeIdentity> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    pub fn queues(&self) -> Vec<Arc<NodeQueue>> {
        self.queues.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Sum of queued messages across all nodes.
    pub async fn total_queued(&self) -> usize {
        let mut total = 0;
        for queue in self.queues() {
            total += queue.len().await;
        }
        total
    }

    /// Remove a node for good: fail its producers, close its connection,
    /// stop its dispatcher and drop its queue.
    ///
    /// Returns whether a queue existed.
    pub async fn destroy(&self, identity: &NodeIdentity) -> bool {
        let (slot, mut current) = self.lock_slot(identity).await;

        let queue = self.queues.remove(identity).map(|(_, q)| q);
        if let Some(queue) = &queue {
            queue.destroy().await;
        }
        if let Some(old) = current.take() {
            self.detach(identity, old).await;
            metrics::record_node_disconnected("destroyed");
        }
        self.slots.remove_if(identity, |_, s| Arc::ptr_eq(s, &slot));
        drop(current);

        metrics::set_connected_nodes(self.connections.len());

        if queue.is_some() {
            metrics::record_node_destroyed();
            info!(node = %identity, "Node destroyed");
        }
        queue.is_some()
    }

    /// Detach every node. Queues are kept for the final flush.
    pub async fn shutdown(&self) {
        let slots: Vec<(NodeIdentity, Arc<NodeSlot>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut detached = 0;
        for (identity, slot) in slots {
            let mut current = slot.attachment.lock().await;
            if let Some(old) = current.take() {
                self.detach(&identity, old).await;
                detached += 1;
            }
        }
        metrics::set_connected_nodes(self.connections.len());
        info!(detached, "Registry shut down");
    }
}

/// Consume admitted connections until the channel closes or shutdown.
///
/// Each registration runs on its own task so a slow supersession on one node
/// never holds up another. Registrations for the same identity are chained
/// and apply in arrival order.
pub async fn run_registrations(
    registry: Arc<ConnectionRegistry>,
    mut registrations: mpsc::Receiver<Accepted>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let _ = shutdown_rx.borrow_and_update();
    let mut pending: HashMap<NodeIdentity, JoinHandle<()>> = HashMap::new();
    loop {
        let accepted = tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }

            accepted = registrations.recv() => match accepted {
                Some(accepted) => accepted,
                None => break,
            },
        };
        pending.retain(|_, handle| !handle.is_finished());
        let identity = accepted.identity.clone();
        let previous = pending.remove(&identity);
        let registry = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            registry.on_register(accepted).await;
        });
        pending.insert(identity, handle);
    }

    // Registrations already under way finish before the registry shuts down
    for (_, handle) in pending.drain() {
        let _ = handle.await;
    }

    // Anything admitted after shutdown began never gets a dispatcher
    registrations.close();
    while let Ok(accepted) = registrations.try_recv() {
        let _ = accepted.conn.close().await;
    }
    debug!("Registration loop stopped");
}
