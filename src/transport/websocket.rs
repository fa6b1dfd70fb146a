// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream-over-TLS listener: TCP → TLS → WebSocket upgrade on a single path.
//!
//! One logical connection per socket. Each [`Message`] travels as one binary
//! WebSocket message (text messages holding JSON are accepted too).

use super::listener::{accept_backoff, AcceptContext};
use super::{next_connection_id, BoxFuture, CloseSignal, Connection, PeerCredential, Protocol};
use crate::config::WebSocketConfig;
use crate::error::{HubError, Result};
use crate::message::Message;
use crate::metrics;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<TlsStream<TcpStream>>;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

fn ws_err(e: impl std::fmt::Display) -> HubError {
    HubError::transport(Protocol::WebSocket, e.to_string())
}

pub struct WebSocketListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    path: String,
    handshake_timeout: Duration,
    max_frame_bytes: usize,
}

impl WebSocketListener {
    pub async fn bind(config: &WebSocketConfig, tls: Arc<ServerConfig>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr())
            .await
            .map_err(|e| HubError::transport(Protocol::WebSocket, format!("bind {}: {}", config.bind_addr(), e)))?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            path: config.path.clone(),
            handshake_timeout: config.handshake_timeout_duration(),
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self, ctx: Arc<AcceptContext>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(addr = ?self.listener.local_addr().ok(), path = %self.path, "WebSocket listener started");
        let _ = shutdown_rx.borrow_and_update();

        loop {
            let (stream, remote) = tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        accept_backoff(Protocol::WebSocket, &e).await;
                        continue;
                    }
                },
            };

            metrics::record_connection_accepted(Protocol::WebSocket.as_str());
            let Some(permit) = ctx.throttle(Protocol::WebSocket) else {
                debug!(%remote, "Dropping connection (throttled)");
                continue;
            };

            let ctx = Arc::clone(&ctx);
            let acceptor = self.acceptor.clone();
            let path = self.path.clone();
            let handshake_timeout = self.handshake_timeout;
            let max_frame_bytes = self.max_frame_bytes;

            tokio::spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let upgraded = tokio::time::timeout(
                    handshake_timeout,
                    upgrade(stream, remote, acceptor, path, max_frame_bytes),
                )
                .await;

                let conn = match upgraded {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        metrics::record_handshake_failure(Protocol::WebSocket.as_str(), "error");
                        debug!(%remote, error = %e, "WebSocket handshake failed");
                        return;
                    }
                    Err(_) => {
                        metrics::record_handshake_failure(Protocol::WebSocket.as_str(), "timeout");
                        debug!(%remote, "WebSocket handshake timed out");
                        return;
                    }
                };
                metrics::record_handshake_duration(Protocol::WebSocket.as_str(), started.elapsed());

                ctx.complete(Arc::new(conn)).await;
            });
        }

        info!("WebSocket listener stopped");
    }
}

/// TLS handshake, then WebSocket upgrade restricted to `path`.
async fn upgrade(
    stream: TcpStream,
    remote: SocketAddr,
    acceptor: TlsAcceptor,
    path: String,
    max_frame_bytes: usize,
) -> Result<WebSocketConnection> {
    let _ = stream.set_nodelay(true);
    let tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| HubError::Handshake(format!("TLS: {}", e)))?;

    let credential = match tls.get_ref().1.peer_certificates().and_then(|c| c.first()) {
        Some(leaf) => PeerCredential::Certificate(leaf.clone().into_owned()),
        None => PeerCredential::Anonymous,
    };

    let check_path = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        if req.uri().path() == path {
            Ok(resp)
        } else {
            let mut err = ErrorResponse::new(Some(format!("unknown path {}", req.uri().path())));
            *err.status_mut() = StatusCode::NOT_FOUND;
            Err(err)
        }
    };
    let ws = tokio_tungstenite::accept_hdr_async(tls, check_path)
        .await
        .map_err(|e| HubError::Handshake(format!("WebSocket upgrade: {}", e)))?;

    let (sink, stream) = ws.split();
    Ok(WebSocketConnection {
        id: next_connection_id(),
        credential,
        remote,
        sink: Mutex::new(sink),
        stream: Mutex::new(stream),
        closed: CloseSignal::new(),
        max_frame_bytes,
    })
}

pub struct WebSocketConnection {
    id: u64,
    credential: PeerCredential,
    remote: SocketAddr,
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed: CloseSignal,
    max_frame_bytes: usize,
}

impl Connection for WebSocketConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    fn peer_credential(&self) -> &PeerCredential {
        &self.credential
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let body = message.to_bytes()?;
            if body.len() > self.max_frame_bytes {
                return Err(HubError::Frame(format!(
                    "outbound message of {} bytes exceeds limit {}",
                    body.len(),
                    self.max_frame_bytes
                )));
            }
            tokio::select! {
                _ = self.closed.closed() => Err(HubError::ConnectionClosed),
                sent = async {
                    let mut sink = self.sink.lock().await;
                    sink.send(WsMessage::binary(body)).await
                } => sent.map_err(ws_err),
            }
        })
    }

    fn receive(&self) -> BoxFuture<'_, Option<Message>> {
        Box::pin(async move {
            let mut stream = self.stream.lock().await;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.closed.closed() => return Ok(None),
                    next = stream.next() => next,
                };
                let frame = match next {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(ws_err(e)),
                    Some(Ok(frame)) => frame,
                };
                match frame {
                    WsMessage::Binary(_) | WsMessage::Text(_) => {
                        let data = frame.into_data();
                        if data.len() > self.max_frame_bytes {
                            return Err(HubError::Frame(format!(
                                "inbound message of {} bytes exceeds limit {}",
                                data.len(),
                                self.max_frame_bytes
                            )));
                        }
                        return Message::from_slice(&data).map(Some);
                    }
                    WsMessage::Close(_) => return Ok(None),
                    // Pings are answered by tungstenite on the next write
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.close() {
                return Ok(());
            }
            let flushed = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
                let mut sink = self.sink.lock().await;
                sink.close().await
            })
            .await;
            if let Ok(Err(e)) = flushed {
                warn!(conn_id = self.id, remote = %self.remote, error = %e, "WebSocket close handshake failed");
            }
            Ok(())
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}
