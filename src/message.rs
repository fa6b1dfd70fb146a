// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire message model.
//!
//! Every frame exchanged with a node, in either direction and over either
//! transport, is one JSON-encoded [`Message`]:
//!
//! ```text
//! {
//!   "id": "6f1c…",            // unique per message
//!   "parent_id": "a2e4…",     // set on responses (acks)
//!   "node": "edge-berlin-7",  // destination (outbound) or source (inbound)
//!   "group": "resource",      // routing group
//!   "resource": "default/device/thermo-1",
//!   "operation": "update",    // insert | update | delete | response | keepalive | admit | upload
//!   "version": 42,            // per-(node, resource) version from the producer
//!   "timestamp_ms": 1735689600000,
//!   "content": { … }
//! }
//! ```
//!
//! [`NodeIdentity`] is validated on construction and on deserialization, so a
//! frame carrying a malformed node name is rejected as a malformed frame.

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Routing group for object synchronization traffic.
pub const GROUP_RESOURCE: &str = "resource";
/// Routing group for device twin traffic.
pub const GROUP_TWIN: &str = "twin";
/// Routing group for application payloads relayed upstream unchanged.
pub const GROUP_USER: &str = "user";
/// Routing group for hub control frames (keepalive, admission).
pub const GROUP_HUB: &str = "hub";

/// Groups an inbound data message may use to reach the upstream collaborator.
pub const UPSTREAM_GROUPS: &[&str] = &[GROUP_RESOURCE, GROUP_TWIN, GROUP_USER];

/// Longest accepted node name (DNS-1123 subdomain limit).
pub const MAX_IDENTITY_LEN: usize = 253;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeIdentity
// ═══════════════════════════════════════════════════════════════════════════════

/// Verified name of an edge node. Keys exactly one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// Validate and wrap a node name.
    ///
    /// Accepts lowercase alphanumerics plus `-`, `.` and `_`, starting and
    /// ending with an alphanumeric.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(HubError::admission("empty node identity"));
        }
        if name.len() > MAX_IDENTITY_LEN {
            return Err(HubError::admission(format!(
                "node identity longer than {} bytes",
                MAX_IDENTITY_LEN
            )));
        }
        let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | '_');
        let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !name.chars().all(valid_char) || !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
            return Err(HubError::admission(format!("invalid node identity {:?}", name)));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeIdentity {
    type Error = HubError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<NodeIdentity> for String {
    fn from(id: NodeIdentity) -> Self {
        id.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ResourcePath + Operation
// ═══════════════════════════════════════════════════════════════════════════════

/// Address of a synchronized object, e.g. `default/device/thermo-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcePath(String);

impl ResourcePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Object kind segment (`device` in `default/device/thermo-1`), if present.
    pub fn kind(&self) -> Option<&str> {
        let mut parts = self.0.split('/');
        match (parts.next(), parts.next()) {
            (Some(_), Some(kind)) if !kind.is_empty() => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourcePath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourcePath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    /// Node → hub acknowledgment of a delivered message.
    Response,
    Keepalive,
    /// First frame of a certificate-less connection.
    Admit,
    /// Node-originated data for the upstream collaborator.
    Upload,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Response => "response",
            Operation::Keepalive => "keepalive",
            Operation::Admit => "admit",
            Operation::Upload => "upload",
        };
        f.write_str(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Message
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub node: NodeIdentity,
    pub group: String,
    pub resource: ResourcePath,
    pub operation: Operation,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Content of an `admit` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmitRequest {
    pub node: String,
    pub token: String,
}

impl Message {
    pub fn new(
        node: NodeIdentity,
        group: impl Into<String>,
        resource: impl Into<ResourcePath>,
        operation: Operation,
        version: u64,
        content: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            node,
            group: group.into(),
            resource: resource.into(),
            operation,
            version,
            timestamp_ms: epoch_millis(),
            content,
        }
    }

    /// An `update` of a synchronized resource.
    pub fn update(node: NodeIdentity, resource: impl Into<ResourcePath>, version: u64, content: serde_json::Value) -> Self {
        Self::new(node, GROUP_RESOURCE, resource, Operation::Update, version, content)
    }

    /// A `delete` of a synchronized resource.
    pub fn delete(node: NodeIdentity, resource: impl Into<ResourcePath>, version: u64) -> Self {
        Self::new(node, GROUP_RESOURCE, resource, Operation::Delete, version, serde_json::Value::Null)
    }

    /// The acknowledgment a node sends back for this message.
    pub fn ack(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            node: self.node.clone(),
            group: self.group.clone(),
            resource: self.resource.clone(),
            operation: Operation::Response,
            version: self.version,
            timestamp_ms: epoch_millis(),
            content: serde_json::Value::Null,
        }
    }

    pub fn keepalive(node: NodeIdentity) -> Self {
        Self::new(node, GROUP_HUB, "hub/keepalive", Operation::Keepalive, 0, serde_json::Value::Null)
    }

    /// Admission frame carrying a token for `node`.
    pub fn admit(node: NodeIdentity, token: impl Into<String>) -> Self {
        let content = serde_json::json!({ "node": node.as_str(), "token": token.into() });
        Self::new(node, GROUP_HUB, "hub/admission", Operation::Admit, 0, content)
    }

    /// Decode the token request carried by an `admit` frame.
    pub fn admit_request(&self) -> Result<AdmitRequest> {
        if self.operation != Operation::Admit {
            return Err(HubError::admission(format!(
                "expected admit frame, got {} on {}",
                self.operation, self.resource
            )));
        }
        serde_json::from_value(self.content.clone())
            .map_err(|e| HubError::admission(format!("malformed admit content: {}", e)))
    }

    pub fn is_ack(&self) -> bool {
        self.operation == Operation::Response
    }

    /// Encode as a JSON frame body.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a JSON frame body. Any decode failure is a malformed frame.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| HubError::Frame(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeIdentity {
        NodeIdentity::new(name).unwrap()
    }

    #[test]
    fn test_identity_accepts_dns_names() {
        assert!(NodeIdentity::new("edge-1").is_ok());
        assert!(NodeIdentity::new("rack2.edge_7.berlin").is_ok());
        assert!(NodeIdentity::new("a").is_ok());
    }

    #[test]
    fn test_identity_rejects_bad_names() {
        assert!(NodeIdentity::new("").is_err());
        assert!(NodeIdentity::new("Edge-1").is_err());
        assert!(NodeIdentity::new("-edge").is_err());
        assert!(NodeIdentity::new("edge-").is_err());
        assert!(NodeIdentity::new("edge 1").is_err());
        assert!(NodeIdentity::new("*").is_err());
        assert!(NodeIdentity::new("a".repeat(MAX_IDENTITY_LEN + 1)).is_err());
    }

    #[test]
    fn test_identity_validated_on_deserialize() {
        let bad = r#"{"id":"00000000-0000-0000-0000-000000000000","node":"BAD NODE","group":"resource","resource":"a/b/c","operation":"update"}"#;
        let err = Message::from_slice(bad.as_bytes()).unwrap_err();
        assert!(matches!(err, HubError::Frame(_)));
    }

    #[test]
    fn test_resource_kind() {
        assert_eq!(ResourcePath::new("default/device/thermo-1").kind(), Some("device"));
        assert_eq!(ResourcePath::new("configmap").kind(), None);
        assert!(ResourcePath::new("  ").is_empty());
    }

    #[test]
    fn test_ack_references_original() {
        let msg = Message::update(node("edge-1"), "default/device/d1", 7, serde_json::json!({"temp": 21}));
        let ack = msg.ack();
        assert!(ack.is_ack());
        assert_eq!(ack.parent_id, Some(msg.id));
        assert_eq!(ack.resource, msg.resource);
        assert_eq!(ack.version, 7);
        assert_ne!(ack.id, msg.id);
    }

    #[test]
    fn test_operation_wire_names() {
        let msg = Message::delete(node("edge-1"), "default/device/d1", 3);
        let json = String::from_utf8(msg.to_bytes().unwrap()).unwrap();
        assert!(json.contains(r#""operation":"delete""#));
        assert!(!json.contains("parent_id"));
    }

    #[test]
    fn test_admit_request_roundtrip() {
        let msg = Message::admit(node("edge-9"), "abc.def.ghi");
        let req = msg.admit_request().unwrap();
        assert_eq!(req.node, "edge-9");
        assert_eq!(req.token, "abc.def.ghi");
    }

    #[test]
    fn test_admit_request_rejects_other_operations() {
        let msg = Message::keepalive(node("edge-9"));
        assert!(matches!(msg.admit_request(), Err(HubError::Admission { .. })));
    }

    #[test]
    fn test_minimal_inbound_frame_defaults() {
        let frame = r#"{"id":"6f1c8a56-0d0e-4c55-9b7e-3f2b8f8f9a10","node":"edge-2","group":"hub","resource":"hub/keepalive","operation":"keepalive"}"#;
        let msg = Message::from_slice(frame.as_bytes()).unwrap();
        assert_eq!(msg.version, 0);
        assert_eq!(msg.content, serde_json::Value::Null);
        assert_eq!(msg.operation, Operation::Keepalive);
    }

    #[test]
    fn test_garbage_is_frame_error() {
        assert!(matches!(Message::from_slice(b"\x00\x01not json"), Err(HubError::Frame(_))));
        assert!(matches!(Message::from_slice(b"{}"), Err(HubError::Frame(_))));
    }
}
