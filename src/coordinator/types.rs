//! Hub state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (certs, cache sync, store, listeners ok)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Starting ── fatal startup error ──→ Failed
//! ```
//!
//! - **Created**: after `CloudHub::new()`. Nothing bound, nothing spawned.
//! - **Starting**: certificates, cache-sync gate, sync store, listeners.
//! - **Running**: accepting nodes and dispatching.
//! - **ShuttingDown**: listeners stopped, nodes detached, records flushing.
//! - **Stopped**: safe to drop.
//! - **Failed**: a fatal startup error; see logs.

use crate::circuit_breaker::ObjectStoreCircuitMetrics;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for HubState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubState::Created => write!(f, "Created"),
            HubState::Starting => write!(f, "Starting"),
            HubState::Running => write!(f, "Running"),
            HubState::ShuttingDown => write!(f, "ShuttingDown"),
            HubState::Stopped => write!(f, "Stopped"),
            HubState::Failed => write!(f, "Failed"),
        }
    }
}

/// Snapshot for readiness/liveness endpoints. Built without I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: HubState,
    /// Hub is `Running`.
    pub ready: bool,
    pub connected_nodes: usize,
    /// Nodes with a queue, connected or not.
    pub known_queues: usize,
    /// Messages pending or in flight across every queue.
    pub queued_messages: usize,
    pub circuit: ObjectStoreCircuitMetrics,
    pub circuit_open: bool,
    pub listeners: Vec<(String, SocketAddr)>,
    /// Ready and no object-store circuit open.
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_state_display() {
        assert_eq!(HubState::Created.to_string(), "Created");
        assert_eq!(HubState::Starting.to_string(), "Starting");
        assert_eq!(HubState::Running.to_string(), "Running");
        assert_eq!(HubState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(HubState::Stopped.to_string(), "Stopped");
        assert_eq!(HubState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_hub_state_equality() {
        assert_eq!(HubState::Created, HubState::Created);
        assert_ne!(HubState::Created, HubState::Running);
    }
}
