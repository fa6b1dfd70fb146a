// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the hub.
//!
//! Errors are grouped by how far their blast radius reaches: some stop the
//! process from starting, some close a single connection, and some only
//! affect a single queued message.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal | Description |
//! |------------|-----------|-------|-------------|
//! | `Certificate` | No | Yes | CA/server bundle unreadable or ungenerable |
//! | `Tls` | No | Yes | TLS configuration could not be built |
//! | `CacheSync` | No | Yes | Object-store caches never reported synced |
//! | `SecretStore` | Yes | No | Secret store read/write failed |
//! | `Config` | No | Yes | Configuration invalid |
//! | `Transport` | Yes | No | Socket/stream I/O error on one connection |
//! | `Handshake` | Yes | No | TLS or protocol upgrade failed |
//! | `Frame` | No | No | Malformed frame from a node |
//! | `ConnectionClosed` | Yes | No | Peer went away |
//! | `Admission` | No | No | Node failed certificate/token admission |
//! | `Token` | No | No | Token expired, forged, or malformed |
//! | `QueueFull` | Yes | No | Bounded wait for queue space elapsed |
//! | `NodeDestroyed` | No | No | Queue removed while a producer waited |
//! | `ObjectStore` | Yes | No | Desired-state lookup failed |
//! | `SyncStore` | No | No | Local SQLite errors |
//! | `InvalidState` | No | No | Hub state machine violation |
//! | `Shutdown` | No | No | Hub is shutting down |
//! | `Internal` | No | No | Unexpected internal error |
//!
//! Use [`HubError::is_retryable()`] for backoff decisions and
//! [`HubError::is_fatal()`] to decide whether startup must abort.

use thiserror::Error;

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

/// Errors that can occur in the hub.
#[derive(Error, Debug)]
pub enum HubError {
    /// The certificate bundle could not be loaded, generated or persisted.
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// A TLS server configuration could not be built (bad CA pool, key mismatch).
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// The object-store caches did not report synchronized in time.
    #[error("Cache sync failed: {0}")]
    CacheSync(String),

    /// Secret store access failure.
    #[error("Secret store error ({secret}): {message}")]
    SecretStore { secret: String, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O failure on a single connection.
    #[error("Transport error ({protocol}): {message}")]
    Transport { protocol: String, message: String },

    /// TLS handshake or protocol upgrade failure.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A frame could not be decoded.
    #[error("Malformed frame: {0}")]
    Frame(String),

    /// The connection has been closed (locally or by the peer).
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection did not present acceptable credentials.
    #[error("Admission rejected: {reason}")]
    Admission { reason: String },

    /// Token validation or issuance failure.
    #[error("Token error: {0}")]
    Token(String),

    /// The node's queue stayed full for the whole bounded wait.
    #[error("Queue full for node {node} (capacity {capacity})")]
    QueueFull { node: String, capacity: usize },

    /// The node's queue was destroyed.
    #[error("Queue destroyed for node {0}")]
    NodeDestroyed(String),

    /// The desired-state collaborator failed.
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// SQLite error during sync-record persistence.
    #[error("Sync store error: {0}")]
    SyncStore(#[from] sqlx::Error),

    /// Local I/O failure (sockets, secret files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hub state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Create a transport error tagged with its protocol.
    pub fn transport(protocol: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Transport {
            protocol: protocol.to_string(),
            message: message.into(),
        }
    }

    /// Create an admission rejection.
    pub fn admission(reason: impl Into<String>) -> Self {
        Self::Admission {
            reason: reason.into(),
        }
    }

    /// Create a secret store error.
    pub fn secret_store(secret: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::SecretStore {
            secret: secret.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Handshake(_) => true,
            Self::ConnectionClosed => true,
            Self::QueueFull { .. } => true,
            Self::ObjectStore(_) => true,
            Self::SecretStore { .. } => true,
            Self::Io(_) => true,
            Self::Certificate(_) => false,
            Self::Tls(_) => false,
            Self::CacheSync(_) => false,
            Self::Config(_) => false,
            Self::Frame(_) => false,
            Self::Admission { .. } => false,
            Self::Token(_) => false,
            Self::NodeDestroyed(_) => false,
            Self::SyncStore(_) => false, // Local DB issues need attention
            Self::Serialization(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Errors that must stop the hub from starting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Certificate(_) | Self::Tls(_) | Self::CacheSync(_) | Self::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_is_retryable() {
        let err = HubError::transport("quic", "stream reset");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("quic"));
        assert!(err.to_string().contains("stream reset"));
    }

    #[test]
    fn test_queue_full_is_retryable() {
        let err = HubError::QueueFull {
            node: "edge-1".to_string(),
            capacity: 16,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("edge-1"));
        assert!(err.to_string().contains("16"));
    }

    #[test]
    fn test_startup_errors_are_fatal() {
        assert!(HubError::Certificate("no CA".into()).is_fatal());
        assert!(HubError::Tls("empty root store".into()).is_fatal());
        assert!(HubError::CacheSync("timed out".into()).is_fatal());
        assert!(HubError::Config("no listeners".into()).is_fatal());
    }

    #[test]
    fn test_admission_errors_not_retryable() {
        let err = HubError::admission("no certificate and no token");
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("no certificate"));

        assert!(!HubError::Token("expired".into()).is_retryable());
    }

    #[test]
    fn test_frame_error_not_retryable() {
        let err = HubError::Frame("length 9999999 exceeds limit".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = HubError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_secret_store_formatting() {
        let err = HubError::secret_store("casecret", "permission denied");
        let msg = err.to_string();
        assert!(msg.contains("casecret"));
        assert!(msg.contains("permission denied"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let err: HubError = io.into();
        assert!(matches!(err, HubError::Io(_)));
        assert!(err.is_retryable());
    }
}
