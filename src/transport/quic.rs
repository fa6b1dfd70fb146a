// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Datagram-stream listener over QUIC.
//!
//! # Streams
//!
//! ```text
//! QUIC connection
//! ├── bidi stream #0 (control) ◀──▶ outbound messages + inbound frames
//! ├── bidi stream #1           ───▶ inbound frames only
//! └── ... up to max_incoming_streams
//! ```
//!
//! The first bidirectional stream the node opens is the control stream; the
//! hub writes every outbound message there. Further streams may carry
//! inbound traffic (bulk uploads alongside acks) and are fanned into one
//! receive queue. The node must write on the control stream before the hub
//! can see it: a certificate-authenticated node typically sends a keepalive.
//!
//! The control stream ending ends the connection.

use super::codec;
use super::listener::AcceptContext;
use super::{next_connection_id, BoxFuture, CloseSignal, Connection, PeerCredential, Protocol};
use crate::config::QuicConfig;
use crate::error::{HubError, Result};
use crate::message::Message;
use crate::metrics;
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Endpoint, IdleTimeout, RecvStream, SendStream, TransportConfig, VarInt};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

/// Inbound frames buffered per connection across all its streams.
const INBOUND_BUFFER: usize = 64;

fn quic_err(e: impl std::fmt::Display) -> HubError {
    HubError::transport(Protocol::Quic, e.to_string())
}

pub struct QuicListener {
    endpoint: Endpoint,
    handshake_timeout: Duration,
    max_frame_bytes: usize,
}

impl QuicListener {
    pub fn bind(config: &QuicConfig, tls: Arc<ServerConfig>, handshake_timeout: Duration) -> Result<Self> {
        let crypto = QuicServerConfig::try_from(tls).map_err(|e| HubError::Tls(format!("QUIC TLS config: {}", e)))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

        let mut transport = TransportConfig::default();
        transport.max_concurrent_bidi_streams(VarInt::from_u32(config.max_incoming_streams));
        transport.max_concurrent_uni_streams(VarInt::from_u32(0));
        let idle = IdleTimeout::try_from(Duration::from_secs(config.idle_timeout_sec))
            .map_err(|e| HubError::Config(format!("quic.idle_timeout_sec: {}", e)))?;
        transport.max_idle_timeout(Some(idle));
        transport.keep_alive_interval(Some(Duration::from_secs(config.keep_alive_sec)));
        server_config.transport_config(Arc::new(transport));

        let endpoint = Endpoint::server(server_config, config.bind_addr())
            .map_err(|e| HubError::transport(Protocol::Quic, format!("bind {}: {}", config.bind_addr(), e)))?;

        Ok(Self {
            endpoint,
            handshake_timeout,
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub async fn serve(self, ctx: Arc<AcceptContext>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(addr = ?self.endpoint.local_addr().ok(), "QUIC listener started");
        let _ = shutdown_rx.borrow_and_update();

        loop {
            let incoming = tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };

            metrics::record_connection_accepted(Protocol::Quic.as_str());
            let Some(permit) = ctx.throttle(Protocol::Quic) else {
                incoming.refuse();
                continue;
            };

            let ctx = Arc::clone(&ctx);
            let handshake_timeout = self.handshake_timeout;
            let max_frame_bytes = self.max_frame_bytes;

            tokio::spawn(async move {
                let _permit = permit;
                let remote = incoming.remote_address();
                let started = Instant::now();

                let conn = match tokio::time::timeout(handshake_timeout, upgrade(incoming, max_frame_bytes)).await {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        metrics::record_handshake_failure(Protocol::Quic.as_str(), "error");
                        debug!(%remote, error = %e, "QUIC handshake failed");
                        return;
                    }
                    Err(_) => {
                        metrics::record_handshake_failure(Protocol::Quic.as_str(), "timeout");
                        debug!(%remote, "QUIC handshake timed out");
                        return;
                    }
                };
                metrics::record_handshake_duration(Protocol::Quic.as_str(), started.elapsed());

                ctx.complete(Arc::new(conn)).await;
            });
        }

        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        info!("QUIC listener stopped");
    }
}

/// Complete the handshake and wait for the control stream.
async fn upgrade(incoming: quinn::Incoming, max_frame_bytes: usize) -> Result<QuicConnection> {
    let connection = incoming
        .await
        .map_err(|e| HubError::Handshake(format!("QUIC: {}", e)))?;

    let credential = connection
        .peer_identity()
        .and_then(|identity| identity.downcast::<Vec<CertificateDer<'static>>>().ok())
        .and_then(|certs| certs.first().cloned())
        .map(PeerCredential::Certificate)
        .unwrap_or(PeerCredential::Anonymous);

    let (send, recv) = connection
        .accept_bi()
        .await
        .map_err(|e| HubError::Handshake(format!("no control stream: {}", e)))?;

    let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
    spawn_reader(recv, tx.clone(), max_frame_bytes, Some(connection.clone()));
    spawn_stream_acceptor(connection.clone(), tx, max_frame_bytes);

    Ok(QuicConnection {
        id: next_connection_id(),
        credential,
        remote: connection.remote_address(),
        connection,
        control: Mutex::new(send),
        inbound: Mutex::new(rx),
        closed: CloseSignal::new(),
        max_frame_bytes,
    })
}

/// Decode frames from one stream into the shared inbound queue.
///
/// `owner` is set for the control stream: when it ends, the whole QUIC
/// connection is closed, which in turn ends every other reader.
fn spawn_reader(
    mut recv: RecvStream,
    tx: mpsc::Sender<Result<Message>>,
    max_frame_bytes: usize,
    owner: Option<quinn::Connection>,
) {
    tokio::spawn(async move {
        loop {
            match codec::read_frame(&mut recv, max_frame_bytes).await {
                Ok(Some(msg)) => {
                    if tx.send(Ok(msg)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
        if let Some(connection) = owner {
            connection.close(VarInt::from_u32(0), b"control stream ended");
        }
    });
}

fn spawn_stream_acceptor(connection: quinn::Connection, tx: mpsc::Sender<Result<Message>>, max_frame_bytes: usize) {
    tokio::spawn(async move {
        while let Ok((mut send, recv)) = connection.accept_bi().await {
            // Replies only ever go out on the control stream
            let _ = send.finish();
            spawn_reader(recv, tx.clone(), max_frame_bytes, None);
        }
    });
}

pub struct QuicConnection {
    id: u64,
    credential: PeerCredential,
    remote: SocketAddr,
    connection: quinn::Connection,
    control: Mutex<SendStream>,
    inbound: Mutex<mpsc::Receiver<Result<Message>>>,
    closed: CloseSignal,
    max_frame_bytes: usize,
}

impl Connection for QuicConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::Quic
    }

    fn peer_credential(&self) -> &PeerCredential {
        &self.credential
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tokio::select! {
                _ = self.closed.closed() => Err(HubError::ConnectionClosed),
                sent = async {
                    let mut control = self.control.lock().await;
                    codec::write_frame(&mut *control, message, self.max_frame_bytes).await
                } => sent.map_err(|e| match e {
                    HubError::Io(io) => quic_err(io),
                    other => other,
                }),
            }
        })
    }

    fn receive(&self) -> BoxFuture<'_, Option<Message>> {
        Box::pin(async move {
            let mut inbound = self.inbound.lock().await;
            tokio::select! {
                biased;
                _ = self.closed.closed() => Ok(None),
                next = inbound.recv() => next.transpose(),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.close() {
                self.connection.close(VarInt::from_u32(0), b"closed");
            }
            Ok(())
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed() || self.connection.close_reason().is_some()
    }
}
