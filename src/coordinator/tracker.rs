// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reliable sync tracker: heals gaps between desired and acknowledged state.
//!
//! # Algorithm
//!
//! For each node (from the object store's node list plus every node that has
//! a queue):
//! 1. Read desired state through the `reads` circuit breaker
//! 2. Ask the node's queue for a resync plan: one message per resource whose
//!    desired version is ahead of both the acknowledged version and anything
//!    already queued, plus deletes for removed resources still on record
//! 3. Enqueue the plan; supersession collapses it with any pending entries
//!
//! Runs on a fixed interval and immediately for every reconnect event.
//!
//! # Backoff on Failure
//!
//! A node whose desired-state read fails (or whose queue stays full) is
//! skipped with exponential backoff. Backoff resets on success. One failing
//! node never holds up the others.

use crate::circuit_breaker::ObjectStoreCircuit;
use crate::config::SyncConfig;
use crate::error::{HubError, Result};
use crate::message::{NodeIdentity, Operation};
use crate::metrics;
use crate::object_store::DesiredStateSource;
use crate::queue::EnqueueOutcome;
use crate::registry::ConnectionRegistry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};

/// Statistics from one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub nodes_checked: usize,
    /// Nodes skipped because they are backing off.
    pub nodes_skipped: usize,
    pub resyncs_enqueued: usize,
    pub deletes_enqueued: usize,
    pub errors: usize,
}

impl SweepStats {
    fn absorb(&mut self, node: &NodeResync) {
        self.nodes_checked += 1;
        self.resyncs_enqueued += node.resyncs;
        self.deletes_enqueued += node.deletes;
    }
}

/// What one node's resync enqueued.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeResync {
    pub resyncs: usize,
    pub deletes: usize,
}

/// Per-node backoff: (consecutive_failures, backoff_until).
type Backoff = HashMap<NodeIdentity, (u32, Instant)>;

pub struct ReliableSyncTracker<S: DesiredStateSource> {
    source: Arc<S>,
    registry: Arc<ConnectionRegistry>,
    circuit: Arc<ObjectStoreCircuit>,
    config: SyncConfig,
    enqueue_timeout: Duration,
}

impl<S: DesiredStateSource> ReliableSyncTracker<S> {
    pub fn new(
        source: Arc<S>,
        registry: Arc<ConnectionRegistry>,
        circuit: Arc<ObjectStoreCircuit>,
        config: SyncConfig,
        enqueue_timeout: Duration,
    ) -> Self {
        Self {
            source,
            registry,
            circuit,
            config,
            enqueue_timeout,
        }
    }

    /// Bring one node's queue in line with its desired state.
    pub async fn resync_node(&self, node: &NodeIdentity) -> Result<NodeResync> {
        let source = Arc::clone(&self.source);
        let desired = self
            .circuit
            .reads
            .call(|| async move { source.desired_state(node).await.map_err(HubError::from) })
            .await?;

        let queue = self.registry.queue_for(node);
        let plan = queue.resync_plan(&desired).await;
        let mut result = NodeResync::default();

        for message in plan {
            let operation = message.operation;
            match queue.enqueue(message, self.enqueue_timeout).await {
                Ok(EnqueueOutcome::Stale) => {}
                Ok(_) if operation == Operation::Delete => result.deletes += 1,
                Ok(_) => result.resyncs += 1,
                Err(HubError::NodeDestroyed(_)) => break,
                Err(e) => return Err(e),
            }
        }

        if result.resyncs + result.deletes > 0 {
            debug!(node = %node, resyncs = result.resyncs, deletes = result.deletes, "Resync enqueued");
        }
        Ok(result)
    }

    /// Every node worth checking: the store's list plus every node with a queue.
    async fn nodes(&self) -> (Vec<NodeIdentity>, bool) {
        let mut nodes: BTreeSet<NodeIdentity> = self.registry.known_nodes().into_iter().collect();
        let source = Arc::clone(&self.source);
        let listed = self
            .circuit
            .reads
            .call(|| async move { source.list_nodes().await.map_err(HubError::from) })
            .await;

        match listed {
            Ok(listed) => {
                nodes.extend(listed);
                (nodes.into_iter().collect(), true)
            }
            Err(e) => {
                warn!(error = %HubError::from(e), "Failed to list nodes, sweeping known queues only");
                (nodes.into_iter().collect(), false)
            }
        }
    }

    /// One pass over every node, honoring and updating `backoff`.
    async fn sweep_with_backoff(&self, backoff: &mut Backoff) -> SweepStats {
        let mut stats = SweepStats::default();
        let (nodes, listed) = self.nodes().await;
        if !listed {
            stats.errors += 1;
        }
        let now = Instant::now();

        for node in nodes {
            if backoff.get(&node).is_some_and(|(_, until)| *until > now) {
                stats.nodes_skipped += 1;
                continue;
            }
            match self.resync_node(&node).await {
                Ok(result) => {
                    backoff.remove(&node);
                    stats.absorb(&result);
                }
                Err(e) => {
                    stats.nodes_checked += 1;
                    stats.errors += 1;
                    let failures = backoff.get(&node).map(|(f, _)| *f).unwrap_or(0) + 1;
                    let wait = self.config.backoff_for_failures(failures);
                    warn!(node = %node, error = %e, failures, backoff_secs = wait.as_secs(), "Resync failed");
                    backoff.insert(node, (failures, Instant::now() + wait));
                }
            }
        }
        stats
    }

    /// One pass over every node, ignoring backoff.
    pub async fn sweep(&self) -> SweepStats {
        self.sweep_with_backoff(&mut Backoff::new()).await
    }

    /// Periodic sweep plus reconnect-triggered resyncs, until shutdown.
    pub async fn run(self: Arc<Self>, mut reconnects: mpsc::Receiver<NodeIdentity>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("sync_tracker");

        async move {
            let _ = shutdown_rx.borrow_and_update();
            let interval = self.config.interval();
            info!(
                interval_secs = interval.as_secs(),
                backoff_base_sec = self.config.backoff_base_sec,
                backoff_max_sec = self.config.backoff_max_sec,
                "Starting sync tracker"
            );

            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut backoff = Backoff::new();
            let mut reconnects_open = true;

            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown signal received, stopping sync tracker");
                            break;
                        }
                    }

                    node = reconnects.recv(), if reconnects_open => match node {
                        Some(node) => self.on_reconnect(&node, &mut backoff).await,
                        None => reconnects_open = false,
                    },

                    _ = timer.tick() => {
                        if self.circuit.reads.is_likely_open() {
                            debug!("Skipping sweep, object store read circuit open");
                            metrics::record_sweep_skipped("circuit_open");
                            continue;
                        }
                        let started = Instant::now();
                        let stats = self.sweep_with_backoff(&mut backoff).await;
                        let duration = started.elapsed();
                        metrics::record_sweep(
                            stats.nodes_checked,
                            stats.resyncs_enqueued,
                            stats.deletes_enqueued,
                            stats.errors,
                            duration,
                        );
                        if stats.resyncs_enqueued + stats.deletes_enqueued > 0 {
                            info!(
                                nodes_checked = stats.nodes_checked,
                                resyncs = stats.resyncs_enqueued,
                                deletes = stats.deletes_enqueued,
                                errors = stats.errors,
                                duration_ms = duration.as_millis(),
                                "Sweep complete with repairs"
                            );
                        } else {
                            debug!(nodes_checked = stats.nodes_checked, nodes_skipped = stats.nodes_skipped, "Sweep complete, all caught up");
                        }
                    }
                }
            }

            info!("Sync tracker stopped");
        }
        .instrument(span)
        .await
    }

    /// A reconnect always gets a resync attempt, and success clears backoff.
    async fn on_reconnect(&self, node: &NodeIdentity, backoff: &mut Backoff) {
        match self.resync_node(node).await {
            Ok(result) => {
                backoff.remove(node);
                if result.resyncs + result.deletes > 0 {
                    info!(node = %node, resyncs = result.resyncs, deletes = result.deletes, "Resynced reconnected node");
                }
            }
            Err(e) => {
                let failures = backoff.get(node).map(|(f, _)| *f).unwrap_or(0) + 1;
                let wait = self.config.backoff_for_failures(failures);
                warn!(node = %node, error = %e, "Resync after reconnect failed");
                backoff.insert(node.clone(), (failures, Instant::now() + wait));
            }
        }
    }
}
