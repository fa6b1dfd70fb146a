// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External collaborator traits.
//!
//! The hub does not decide *what* should be on a node, and it does not
//! consume node-originated data itself. Both concerns live outside this crate
//! and are reached through two traits:
//!
//! - [`DesiredStateSource`]: read-only view of the cluster object store
//!   (desired resource versions per node, plus the cache readiness gate)
//! - [`UpstreamSink`]: receives data messages uploaded by nodes
//!
//! # Example
//!
//! ```rust,no_run
//! use cloudhub::object_store::{BoxFuture, DesiredObject, DesiredStateSource};
//! use cloudhub::message::NodeIdentity;
//!
//! struct Inventory;
//!
//! impl DesiredStateSource for Inventory {
//!     fn wait_for_cache_sync(&self) -> BoxFuture<'_, bool> {
//!         Box::pin(async { Ok(true) })
//!     }
//!
//!     fn list_nodes(&self) -> BoxFuture<'_, Vec<NodeIdentity>> {
//!         Box::pin(async { Ok(vec![]) })
//!     }
//!
//!     fn desired_state(&self, _node: &NodeIdentity) -> BoxFuture<'_, Vec<DesiredObject>> {
//!         Box::pin(async { Ok(vec![]) })
//!     }
//! }
//! ```

use crate::message::{Message, NodeIdentity, ResourcePath, GROUP_RESOURCE};
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Result type for collaborator operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Simplified error for collaborator operations.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for crate::error::HubError {
    fn from(e: StoreError) -> Self {
        crate::error::HubError::ObjectStore(e.0)
    }
}

/// One resource as the object store wants it to look on a node.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredObject {
    pub resource: ResourcePath,
    pub group: String,
    /// Monotonic per-resource version.
    pub version: u64,
    pub content: serde_json::Value,
    /// The resource was removed and the node must delete its copy.
    pub deleted: bool,
}

impl DesiredObject {
    pub fn present(resource: impl Into<ResourcePath>, version: u64, content: serde_json::Value) -> Self {
        Self {
            resource: resource.into(),
            group: GROUP_RESOURCE.to_string(),
            version,
            content,
            deleted: false,
        }
    }

    pub fn deleted(resource: impl Into<ResourcePath>, version: u64) -> Self {
        Self {
            resource: resource.into(),
            group: GROUP_RESOURCE.to_string(),
            version,
            content: serde_json::Value::Null,
            deleted: true,
        }
    }
}

/// Read-only desired-state lookup against the cluster object store.
pub trait DesiredStateSource: Send + Sync + 'static {
    /// Resolve once local caches are fully synchronized.
    ///
    /// `Ok(false)` means the caches gave up; the hub treats that as fatal.
    fn wait_for_cache_sync(&self) -> BoxFuture<'_, bool>;

    /// Every node that should have a queue, connected or not.
    fn list_nodes(&self) -> BoxFuture<'_, Vec<NodeIdentity>>;

    /// Desired version/content of every resource destined for `node`.
    fn desired_state(&self, node: &NodeIdentity) -> BoxFuture<'_, Vec<DesiredObject>>;
}

/// Destination for node-originated data.
pub trait UpstreamSink: Send + Sync + 'static {
    fn forward(&self, message: Message) -> BoxFuture<'_, ()>;
}

/// Collaborator that knows nothing and accepts everything.
///
/// Used for standalone operation and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpObjectStore;

impl DesiredStateSource for NoOpObjectStore {
    fn wait_for_cache_sync(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { Ok(true) })
    }

    fn list_nodes(&self) -> BoxFuture<'_, Vec<NodeIdentity>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn desired_state(&self, _node: &NodeIdentity) -> BoxFuture<'_, Vec<DesiredObject>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

impl UpstreamSink for NoOpObjectStore {
    fn forward(&self, message: Message) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            debug!(
                node = %message.node,
                resource = %message.resource,
                operation = %message.operation,
                "Discarding upstream message (no sink configured)"
            );
            Ok(())
        })
    }
}
