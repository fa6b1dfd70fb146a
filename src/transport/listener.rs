// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Protocol-agnostic listener front.
//!
//! [`TransportListener`] is a tagged variant over the two network listeners,
//! chosen at construction time from configuration. Everything after the
//! protocol upgrade (throttling, admission, handing off to the registry) is
//! shared through [`AcceptContext`].

use super::quic::QuicListener;
use super::websocket::WebSocketListener;
use super::{Accepted, Connection, Protocol};
use crate::admission::Admission;
use crate::config::{QuicConfig, WebSocketConfig};
use crate::error::Result;
use crate::metrics;
use crate::resilience::{Bulkhead, RateLimiter};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tracing::{debug, warn, Instrument};

/// Shared state every listener uses after a raw accept.
pub struct AcceptContext {
    pub admission: Arc<Admission>,
    pub handshakes: Bulkhead,
    pub limiter: Option<RateLimiter>,
    pub registrations: mpsc::Sender<Accepted>,
}

impl AcceptContext {
    /// Pass the throttles, or `None` if this attempt should be dropped.
    ///
    /// The returned permit must live until admission finishes.
    pub(crate) fn throttle(&self, protocol: Protocol) -> Option<OwnedSemaphorePermit> {
        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire() {
                metrics::record_connection_throttled(protocol.as_str(), "rate_limit");
                return None;
            }
        }
        match self.handshakes.try_acquire() {
            Some(permit) => Some(permit),
            None => {
                metrics::record_connection_throttled(protocol.as_str(), "bulkhead");
                None
            }
        }
    }

    /// Admit an upgraded connection and hand it to the registry.
    pub(crate) async fn complete(&self, conn: Arc<dyn Connection>) {
        let Some(accepted) = self.admission.admit(conn).await else {
            return;
        };
        if let Err(mpsc::error::SendError(accepted)) = self.registrations.send(accepted).await {
            debug!(node = %accepted.identity, "Registry gone, dropping admitted connection");
            let _ = accepted.conn.close().await;
        }
    }
}

/// A bound network listener.
pub enum TransportListener {
    WebSocket(WebSocketListener),
    Quic(QuicListener),
}

impl TransportListener {
    pub async fn bind_websocket(config: &WebSocketConfig, tls: Arc<ServerConfig>) -> Result<Self> {
        Ok(Self::WebSocket(WebSocketListener::bind(config, tls).await?))
    }

    pub fn bind_quic(config: &QuicConfig, tls: Arc<ServerConfig>, handshake_timeout: std::time::Duration) -> Result<Self> {
        Ok(Self::Quic(QuicListener::bind(config, tls, handshake_timeout)?))
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Self::WebSocket(_) => Protocol::WebSocket,
            Self::Quic(_) => Protocol::Quic,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            Self::WebSocket(l) => l.local_addr(),
            Self::Quic(l) => l.local_addr(),
        }
    }

    /// Accept until shutdown. Each connection is handled on its own task.
    pub async fn serve(self, ctx: Arc<AcceptContext>, shutdown_rx: watch::Receiver<bool>) {
        let addr = self.local_addr().ok();
        let span = tracing::info_span!("listener", protocol = %self.protocol(), addr = ?addr);

        async move {
            match self {
                Self::WebSocket(l) => l.serve(ctx, shutdown_rx).await,
                Self::Quic(l) => l.serve(ctx, shutdown_rx).await,
            }
        }
        .instrument(span)
        .await
    }
}

/// Log an accept-loop error and pause briefly so a persistent failure
/// (e.g. fd exhaustion) does not spin.
pub(crate) async fn accept_backoff(protocol: Protocol, error: &(dyn std::fmt::Display + Sync)) {
    warn!(protocol = %protocol, error = %error, "Accept failed");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_accept_backoff_is_send() {
        let error = std::io::Error::other("too many open files");
        assert_send(&accept_backoff(Protocol::WebSocket, &error));
    }

    #[test]
    fn test_serve_is_send() {
        // Listeners run under tokio::spawn
        fn check(listener: TransportListener, ctx: Arc<AcceptContext>, shutdown_rx: watch::Receiver<bool>) {
            assert_send(&listener.serve(ctx, shutdown_rx));
        }
        let _ = check;
    }
}
