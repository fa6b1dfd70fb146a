//! Inbound message classification.
//!
//! Every frame a registered node sends is handed to [`MessageRouter::route`]:
//!
//! | Frame | Route |
//! |-------|-------|
//! | `response` (ack) | [`NodeQueue::acknowledge`] |
//! | `keepalive` | no-op (liveness is refreshed by the receive loop) |
//! | data in `resource` / `twin` / `user` group | [`UpstreamSink`] through the write circuit |
//! | anything else | logged and dropped |
//!
//! Routing never fails the receive loop. A node may only speak for itself:
//! frames naming a different node are dropped.

use crate::circuit_breaker::{CircuitError, ObjectStoreCircuit};
use crate::message::{Message, NodeIdentity, Operation, UPSTREAM_GROUPS};
use crate::metrics;
use crate::object_store::UpstreamSink;
use crate::queue::NodeQueue;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Acknowledgment applied; `retired` queue entries were removed.
    Ack { retired: usize },
    Keepalive,
    /// Forwarded to the upstream sink.
    Upstream,
    /// Dropped for the given reason.
    Dropped(&'static str),
}

impl RouteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack { .. } => "ack",
            Self::Keepalive => "keepalive",
            Self::Upstream => "upstream",
            Self::Dropped(reason) => reason,
        }
    }
}

pub struct MessageRouter {
    upstream: Arc<dyn UpstreamSink>,
    circuit: Arc<ObjectStoreCircuit>,
}

impl MessageRouter {
    pub fn new(upstream: Arc<dyn UpstreamSink>, circuit: Arc<ObjectStoreCircuit>) -> Self {
        Self { upstream, circuit }
    }

    pub async fn route(&self, identity: &NodeIdentity, queue: &NodeQueue, message: Message) -> RouteOutcome {
        let outcome = self.classify(identity, queue, message).await;
        metrics::record_inbound(outcome.as_str());
        outcome
    }

    async fn classify(&self, identity: &NodeIdentity, queue: &NodeQueue, message: Message) -> RouteOutcome {
        if &message.node != identity {
            warn!(
                node = %identity,
                claimed = %message.node,
                resource = %message.resource,
                "Dropping frame addressed as another node"
            );
            return RouteOutcome::Dropped("node_mismatch");
        }

        match message.operation {
            Operation::Response => {
                let retired = queue.acknowledge(&message.resource, message.version).await;
                metrics::record_ack();
                trace!(node = %identity, resource = %message.resource, version = message.version, retired, "Ack");
                RouteOutcome::Ack { retired }
            }
            Operation::Keepalive => RouteOutcome::Keepalive,
            Operation::Admit => {
                debug!(node = %identity, "Ignoring admit frame on an admitted connection");
                RouteOutcome::Dropped("late_admit")
            }
            Operation::Insert | Operation::Update | Operation::Delete | Operation::Upload => {
                if !UPSTREAM_GROUPS.contains(&message.group.as_str()) {
                    debug!(node = %identity, group = %message.group, "Dropping frame for unknown group");
                    return RouteOutcome::Dropped("unroutable");
                }
                self.forward(identity, message).await
            }
        }
    }

    async fn forward(&self, identity: &NodeIdentity, message: Message) -> RouteOutcome {
        let resource = message.resource.clone();
        let upstream = Arc::clone(&self.upstream);
        match self.circuit.writes.call(|| upstream.forward(message)).await {
            Ok(()) => {
                metrics::record_upstream_forward(true);
                RouteOutcome::Upstream
            }
            Err(CircuitError::Rejected) => {
                metrics::record_upstream_forward(false);
                warn!(node = %identity, resource = %resource, "Upstream circuit open, dropping frame");
                RouteOutcome::Dropped("upstream_circuit_open")
            }
            Err(CircuitError::Inner(e)) => {
                metrics::record_upstream_forward(false);
                warn!(node = %identity, resource = %resource, error = %e, "Upstream forward failed");
                RouteOutcome::Dropped("upstream_error")
            }
        }
    }
}
