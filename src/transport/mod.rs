// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport abstraction.
//!
//! Two wire protocols carry node traffic, and nothing above this module can
//! tell them apart:
//!
//! | Protocol | Socket | Framing | Multiplexing |
//! |----------|--------|---------|--------------|
//! | [`Protocol::WebSocket`] | TCP + TLS 1.2/1.3 | one WS binary message per [`Message`] | one stream per socket |
//! | [`Protocol::Quic`] | UDP + TLS 1.3 | length-prefixed JSON ([`codec`]) | up to `max_incoming_streams` bidi streams |
//!
//! Both produce an `Arc<dyn Connection>`. Listeners hand each admitted
//! connection to the registry through one channel of [`Accepted`] values,
//! which is the only registration path.
//!
//! # Connection Lifecycle
//!
//! ```text
//! accept → TLS handshake → protocol upgrade → admission → Accepted ──▶ registry
//!    │           │                │               │
//!    └───────────┴────────────────┴───────────────┴──▶ close (never registered)
//! ```
//!
//! `close()` is idempotent and wakes any task blocked in `send()` or
//! `receive()`; both then return [`HubError::ConnectionClosed`] or `Ok(None)`.

pub mod codec;
pub mod listener;
pub mod loopback;
pub mod quic;
pub mod websocket;

pub use listener::{AcceptContext, TransportListener};
pub use loopback::{LoopbackConnection, LoopbackPeer};

use crate::error::Result;
use crate::message::{Message, NodeIdentity};
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Wire protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    WebSocket,
    Quic,
    /// In-process pair, used by `CloudHub::attach` and tests.
    Loopback,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::WebSocket => "websocket",
            Protocol::Quic => "quic",
            Protocol::Loopback => "loopback",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the peer proved during the TLS handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCredential {
    /// Verified client certificate (leaf first).
    Certificate(CertificateDer<'static>),
    /// Identity established out of band (in-process attach).
    Trusted(NodeIdentity),
    /// No certificate; the peer must present a token.
    Anonymous,
}

/// One live session to one node.
pub trait Connection: Send + Sync + 'static {
    /// Process-unique id, used to tell a superseded connection from its successor.
    fn id(&self) -> u64;

    fn protocol(&self) -> Protocol;

    fn peer_credential(&self) -> &PeerCredential;

    fn remote_addr(&self) -> Option<SocketAddr>;

    fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, ()>;

    /// Next inbound message; `Ok(None)` once the peer or the hub has closed.
    fn receive(&self) -> BoxFuture<'_, Option<Message>>;

    fn close(&self) -> BoxFuture<'_, ()>;

    fn is_closed(&self) -> bool;
}

/// An admitted connection on its way to the registry.
pub struct Accepted {
    pub identity: NodeIdentity,
    pub conn: Arc<dyn Connection>,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("identity", &self.identity)
            .field("conn_id", &self.conn.id())
            .field("protocol", &self.conn.protocol())
            .finish()
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Shared "this connection is closed" flag that async waiters can observe.
#[derive(Debug)]
pub(crate) struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Returns `true` if this call performed the transition.
    pub(crate) fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `close()` has been called.
    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for checks the current value first
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
