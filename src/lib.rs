//! # CloudHub
//!
//! Cloud-side gateway for a fleet of edge nodes.
//!
//! ## Architecture
//!
//! Nodes connect over WebSocket-over-TLS or QUIC. Each admitted node gets one
//! reliable queue; a dispatcher drains it onto the current connection and
//! a receiver routes what the node sends back.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                                 cloudhub                                  │
//! │                                                                           │
//! │  ┌────────────┐   ┌───────────┐   ┌──────────────────┐   ┌────────────┐   │
//! │  │ Listeners  │──►│ Admission │──►│ Registry         │──►│ Dispatcher │───┼──► node
//! │  │ (WS / QUIC)│   │ (mTLS or  │   │ (one conn/node)  │   │ (per node) │   │
//! │  └────────────┘   │  token)   │   └──────────────────┘   └────────────┘   │
//! │                   └───────────┘            │                    ▲         │
//! │                                            ▼                    │         │
//! │  ┌──────────────────┐            ┌──────────────┐      ┌─────────────┐    │
//! │  │ MessageRouter    │◄── inbound │ NodeQueue    │◄─────│ SyncTracker │    │
//! │  │ (acks, upstream) │            │ (supersede)  │      │ (resync)    │    │
//! │  └──────────────────┘            └──────────────┘      └─────────────┘    │
//! │                                         │                                 │
//! │                                         ▼                                 │
//! │                                  ┌─────────────┐                          │
//! │                                  │ SyncStore   │                          │
//! │                                  │ (SQLite)    │                          │
//! │                                  └─────────────┘                          │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! Delivery is at-least-once per (node, resource). A newer version of a
//! resource replaces an unsent older one in the queue, and the node's
//! acknowledgments are recorded so a restart resends only what is missing.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cloudhub::{CloudHub, HubConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut hub = CloudHub::new(HubConfig::default());
//!     hub.start().await.expect("Failed to start");
//!
//!     // Hub runs until shutdown
//!     hub.shutdown().await;
//! }
//! ```

pub mod admission;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod message;
pub mod metrics;
pub mod object_store;
pub mod queue;
pub mod registry;
pub mod resilience;
pub mod router;
pub mod secret_store;
pub mod sync_store;
pub mod transport;
pub mod uds;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, ObjectStoreCircuit};
pub use config::{HubConfig, QueueConfig, SyncConfig, SyncStoreConfig};
pub use coordinator::{CloudHub, HealthCheck, HubState, ReliableSyncTracker, SweepStats};
pub use credentials::CredentialManager;
pub use error::{HubError, Result};
pub use message::{Message, NodeIdentity, Operation, ResourcePath};
pub use object_store::{DesiredObject, DesiredStateSource, NoOpObjectStore, UpstreamSink};
pub use queue::{EnqueueOutcome, NodeQueue, SyncRecord};
pub use registry::ConnectionRegistry;
pub use secret_store::{FileSecretStore, MemorySecretStore, SecretStore};
pub use sync_store::SyncStore;
pub use transport::{Connection, PeerCredential, Protocol};
