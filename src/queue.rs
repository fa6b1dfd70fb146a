// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-node reliable outbound queue.
//!
//! A [`NodeQueue`] outlives every connection its node ever makes. It holds
//! the node's undelivered messages and, per resource, a [`SyncRecord`] of
//! what was sent versus acknowledged.
//!
//! # Entry Lifecycle
//!
//! ```text
//!            enqueue                next_to_send              ack (version ≤ acked)
//! producer ─────────▶ Pending ───────────────────▶ InFlight ─────────────────────▶ retired
//!                        ▲                            │
//!                        └────── requeue / rewind ────┘   (send failure, reconnect)
//! ```
//!
//! # Supersession
//!
//! At most one `Pending` entry exists per resource. Enqueueing a version
//! `>=` the pending one replaces it in place (same queue position, so FIFO
//! order across resources is preserved). Anything older than the pending
//! entry, the last sent version, or the last acknowledged version is
//! reported as [`EnqueueOutcome::Stale`] and dropped. Equal versions are
//! last-write-wins.
//!
//! # Locking
//!
//! One mutex per node. Dispatcher (`mark_sent`), router (`acknowledge`) and
//! tracker (`resync_plan`) all serialize on it, never on a global lock.

use crate::error::{HubError, Result};
use crate::message::{Message, NodeIdentity, Operation, ResourcePath};
use crate::metrics;
use crate::object_store::DesiredObject;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Delivery state of one (node, resource) pair.
///
/// Invariant: `last_acked <= last_sent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub node: NodeIdentity,
    pub resource: ResourcePath,
    pub last_sent: u64,
    pub last_acked: u64,
    /// A delete was sent and is awaiting acknowledgment.
    pub deletion_pending: bool,
    /// Unix millis of the last change.
    pub updated_at: i64,
}

impl SyncRecord {
    pub fn new(node: NodeIdentity, resource: ResourcePath) -> Self {
        Self {
            node,
            resource,
            last_sent: 0,
            last_acked: 0,
            deletion_pending: false,
            updated_at: now_ms(),
        }
    }

    /// Caught up on `desired` version.
    pub fn is_caught_up(&self, desired: u64) -> bool {
        self.last_acked >= desired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended at the tail.
    Queued,
    /// Replaced a pending entry for the same resource.
    Superseded,
    /// Older than what the node already has or is about to get; dropped.
    Stale,
}

impl EnqueueOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Superseded => "superseded",
            Self::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    InFlight,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    message: Message,
    state: EntryState,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    next_seq: u64,
    records: HashMap<ResourcePath, SyncRecord>,
    dirty: HashSet<ResourcePath>,
    removed: HashSet<ResourcePath>,
    destroyed: bool,
}

impl QueueState {
    fn pending_for(&mut self, resource: &ResourcePath) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|e| e.state == EntryState::Pending && &e.message.resource == resource)
    }

    fn highest_queued(&self, resource: &ResourcePath) -> Option<u64> {
        self.entries
            .iter()
            .filter(|e| &e.message.resource == resource)
            .map(|e| e.message.version)
            .max()
    }

    fn in_flight(&self) -> usize {
        self.entries.iter().filter(|e| e.state == EntryState::InFlight).count()
    }

    fn touch(&mut self, resource: &ResourcePath) {
        self.removed.remove(resource);
        self.dirty.insert(resource.clone());
    }

    /// Drop pending entries shadowed by a later pending entry for the same
    /// resource with a version at least as high. Returns how many were dropped.
    fn collapse_pending(&mut self) -> usize {
        let mut newest: HashMap<ResourcePath, (u64, u64)> = HashMap::new();
        for e in self.entries.iter().filter(|e| e.state == EntryState::Pending) {
            let slot = newest.entry(e.message.resource.clone()).or_insert((e.seq, e.message.version));
            if e.message.version >= slot.1 {
                *slot = (e.seq, e.message.version);
            }
        }
        let before = self.entries.len();
        self.entries.retain(|e| {
            e.state != EntryState::Pending
                || newest.get(&e.message.resource).map(|(seq, _)| *seq) == Some(e.seq)
        });
        before - self.entries.len()
    }
}

/// Ordered, bounded, per-node message buffer with delivery tracking.
#[derive(Debug)]
pub struct NodeQueue {
    node: NodeIdentity,
    capacity: usize,
    state: Mutex<QueueState>,
    /// Signalled when a pending entry appears or an in-flight slot frees.
    work: Notify,
    /// Signalled when entries leave the queue.
    space: Notify,
}

impl NodeQueue {
    pub fn new(node: NodeIdentity, capacity: usize) -> Self {
        Self {
            node,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            work: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a message, waiting up to `timeout` for space.
    ///
    /// Never drops silently: the result is `Queued`, `Superseded`, `Stale`,
    /// or an error ([`HubError::QueueFull`], [`HubError::NodeDestroyed`]).
    pub async fn enqueue(&self, message: Message, timeout: Duration) -> Result<EnqueueOutcome> {
        let deadline = Instant::now() + timeout;
        let mut message = Some(message);

        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut st = self.state.lock().await;
                if st.destroyed {
                    metrics::record_enqueue("destroyed");
                    return Err(HubError::NodeDestroyed(self.node.to_string()));
                }
                let Some(msg) = message.take() else {
                    return Err(HubError::Internal("enqueue lost its message".into()));
                };

                if let Some(outcome) = self.try_place(&mut st, msg, &mut message) {
                    metrics::record_enqueue(outcome.as_str());
                    metrics::set_queue_depth(self.node.as_str(), st.entries.len());
                    if outcome != EnqueueOutcome::Stale {
                        self.work.notify_waiters();
                    }
                    return Ok(outcome);
                }
            }

            // Full: wait for an ack or a destroy, bounded by the deadline
            if tokio::time::timeout_at(deadline, space).await.is_err() {
                metrics::record_enqueue("full");
                return Err(HubError::QueueFull {
                    node: self.node.to_string(),
                    capacity: self.capacity,
                });
            }
        }
    }

    /// Place `msg`, or hand it back through `retry` when the queue is full.
    fn try_place(&self, st: &mut QueueState, msg: Message, retry: &mut Option<Message>) -> Option<EnqueueOutcome> {
        if let Some(rec) = st.records.get(&msg.resource) {
            if msg.version <= rec.last_acked || msg.version < rec.last_sent {
                trace!(node = %self.node, resource = %msg.resource, version = msg.version, "Stale enqueue");
                return Some(EnqueueOutcome::Stale);
            }
        }
        let in_flight_max = st
            .entries
            .iter()
            .filter(|e| e.state == EntryState::InFlight && e.message.resource == msg.resource)
            .map(|e| e.message.version)
            .max();
        if in_flight_max.is_some_and(|v| msg.version < v) {
            return Some(EnqueueOutcome::Stale);
        }

        if let Some(pending) = st.pending_for(&msg.resource) {
            if msg.version >= pending.message.version {
                debug!(
                    node = %self.node,
                    resource = %msg.resource,
                    from = pending.message.version,
                    to = msg.version,
                    "Superseding pending message"
                );
                pending.message = msg;
                return Some(EnqueueOutcome::Superseded);
            }
            return Some(EnqueueOutcome::Stale);
        }

        if st.entries.len() >= self.capacity {
            *retry = Some(msg);
            return None;
        }

        let seq = st.next_seq;
        st.next_seq += 1;
        st.entries.push_back(Entry {
            seq,
            message: msg,
            state: EntryState::Pending,
        });
        Some(EnqueueOutcome::Queued)
    }

    /// Wait for the oldest pending message while fewer than `max_in_flight`
    /// are outstanding, and mark it in flight.
    ///
    /// Cancel-safe: the entry is only claimed in the same poll that returns it.
    pub async fn next_to_send(&self, max_in_flight: usize) -> Result<(u64, Message)> {
        loop {
            let work = self.work.notified();
            tokio::pin!(work);
            work.as_mut().enable();

            {
                let mut st = self.state.lock().await;
                if st.destroyed {
                    return Err(HubError::NodeDestroyed(self.node.to_string()));
                }
                if st.in_flight() < max_in_flight.max(1) {
                    if let Some(entry) = st.entries.iter_mut().find(|e| e.state == EntryState::Pending) {
                        entry.state = EntryState::InFlight;
                        return Ok((entry.seq, entry.message.clone()));
                    }
                }
            }

            work.await;
        }
    }

    /// Record a successful send of entry `seq`.
    pub async fn mark_sent(&self, seq: u64) {
        let mut st = self.state.lock().await;
        let Some((resource, version, operation)) = st
            .entries
            .iter()
            .find(|e| e.seq == seq)
            .map(|e| (e.message.resource.clone(), e.message.version, e.message.operation))
        else {
            // Acked (or destroyed) before we got here
            return;
        };

        let node = self.node.clone();
        let rec = st
            .records
            .entry(resource.clone())
            .or_insert_with(|| SyncRecord::new(node, resource.clone()));
        rec.last_sent = rec.last_sent.max(version);
        match operation {
            Operation::Delete => rec.deletion_pending = true,
            Operation::Insert | Operation::Update => rec.deletion_pending = false,
            _ => {}
        }
        rec.updated_at = now_ms();
        st.touch(&resource);
    }

    /// Return entry `seq` to pending after a failed send.
    pub async fn requeue(&self, seq: u64) {
        let mut st = self.state.lock().await;
        if let Some(entry) = st.entries.iter_mut().find(|e| e.seq == seq) {
            entry.state = EntryState::Pending;
        }
        let dropped = st.collapse_pending();
        if dropped > 0 {
            self.space.notify_waiters();
        }
        self.work.notify_waiters();
    }

    /// Return every in-flight entry to pending, for replay on a new connection.
    pub async fn rewind(&self) -> usize {
        let mut st = self.state.lock().await;
        let mut rewound = 0;
        for entry in st.entries.iter_mut().filter(|e| e.state == EntryState::InFlight) {
            entry.state = EntryState::Pending;
            rewound += 1;
        }
        if st.collapse_pending() > 0 {
            self.space.notify_waiters();
        }
        metrics::set_queue_depth(self.node.as_str(), st.entries.len());
        self.work.notify_waiters();
        rewound
    }

    /// Process an acknowledgment for (`resource`, `version`).
    ///
    /// Idempotent: acking an already-acked version changes nothing. Returns
    /// the number of entries retired.
    pub async fn acknowledge(&self, resource: &ResourcePath, version: u64) -> usize {
        let mut st = self.state.lock().await;
        if st.destroyed {
            return 0;
        }

        let node = self.node.clone();
        let rec = st
            .records
            .entry(resource.clone())
            .or_insert_with(|| SyncRecord::new(node, resource.clone()));
        let advanced = version > rec.last_acked;
        if advanced {
            rec.last_acked = version;
            rec.updated_at = now_ms();
        }
        rec.last_sent = rec.last_sent.max(rec.last_acked);
        let acked = rec.last_acked;
        let delete_done = rec.deletion_pending && rec.last_acked >= rec.last_sent;

        let before = st.entries.len();
        st.entries
            .retain(|e| !(&e.message.resource == resource && e.message.version <= acked));
        let retired = before - st.entries.len();

        if delete_done {
            st.records.remove(resource);
            st.dirty.remove(resource);
            st.removed.insert(resource.clone());
        } else if advanced {
            st.touch(resource);
        }

        if retired > 0 {
            metrics::set_queue_depth(self.node.as_str(), st.entries.len());
            self.space.notify_waiters();
            self.work.notify_waiters();
        }
        trace!(node = %self.node, resource = %resource, version, retired, "Ack processed");
        retired
    }

    /// Messages needed to bring the node from its recorded state to `desired`.
    ///
    /// Skips resources already caught up or with an equal-or-newer version
    /// already queued. The caller enqueues the result.
    pub async fn resync_plan(&self, desired: &[DesiredObject]) -> Vec<Message> {
        let st = self.state.lock().await;
        let mut plan = Vec::new();

        for obj in desired {
            let rec = st.records.get(&obj.resource);
            let queued = st.highest_queued(&obj.resource);

            if obj.deleted {
                let Some(rec) = rec else { continue };
                let delete_queued = st
                    .entries
                    .iter()
                    .any(|e| e.message.resource == obj.resource && e.message.operation == Operation::Delete);
                if delete_queued || (rec.deletion_pending && rec.last_sent >= obj.version) {
                    continue;
                }
                let version = obj.version.max(rec.last_sent.saturating_add(1));
                plan.push(Message::delete(self.node.clone(), obj.resource.clone(), version));
                continue;
            }

            if rec.is_some_and(|r| r.is_caught_up(obj.version)) {
                continue;
            }
            if queued.is_some_and(|v| v >= obj.version) {
                continue;
            }
            let operation = if rec.is_some() { Operation::Update } else { Operation::Insert };
            plan.push(Message::new(
                self.node.clone(),
                obj.group.clone(),
                obj.resource.clone(),
                operation,
                obj.version,
                obj.content.clone(),
            ));
        }
        plan
    }

    /// Take records changed since the last call, plus resources whose record
    /// was removed.
    pub async fn take_dirty(&self) -> (Vec<SyncRecord>, Vec<ResourcePath>) {
        let mut st = self.state.lock().await;
        let dirty: Vec<ResourcePath> = st.dirty.drain().collect();
        let records = dirty.iter().filter_map(|r| st.records.get(r).cloned()).collect();
        let removed = st.removed.drain().collect();
        (records, removed)
    }

    /// Put back what a failed flush took.
    pub async fn restore_dirty(&self, records: &[SyncRecord], removed: &[ResourcePath]) {
        let mut st = self.state.lock().await;
        for rec in records {
            if st.records.contains_key(&rec.resource) {
                st.dirty.insert(rec.resource.clone());
            }
        }
        for resource in removed {
            if !st.records.contains_key(resource) {
                st.removed.insert(resource.clone());
            }
        }
    }

    /// Seed records loaded from the sync store at startup. Not marked dirty.
    pub async fn restore_records(&self, records: impl IntoIterator<Item = SyncRecord>) {
        let mut st = self.state.lock().await;
        for mut rec in records {
            rec.last_sent = rec.last_sent.max(rec.last_acked);
            st.records.insert(rec.resource.clone(), rec);
        }
    }

    pub async fn record(&self, resource: &ResourcePath) -> Option<SyncRecord> {
        self.state.lock().await.records.get(resource).cloned()
    }

    pub async fn records(&self) -> Vec<SyncRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    /// Total entries, pending and in flight.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight()
    }

    /// Snapshot of queued messages in delivery order.
    pub async fn snapshot(&self) -> Vec<Message> {
        self.state.lock().await.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Drop everything and fail current and future waiters with `NodeDestroyed`.
    pub async fn destroy(&self) {
        let mut st = self.state.lock().await;
        st.destroyed = true;
        st.entries.clear();
        st.records.clear();
        st.dirty.clear();
        st.removed.clear();
        metrics::set_queue_depth(self.node.as_str(), 0);
        self.space.notify_waiters();
        self.work.notify_waiters();
    }

    pub async fn is_destroyed(&self) -> bool {
        self.state.lock().await.destroyed
    }
}
