//! In-process connection pair.
//!
//! [`LoopbackConnection::pair()`] returns the hub side (a [`Connection`]) and
//! the node side ([`LoopbackPeer`]). Messages travel through bounded channels,
//! so a peer that stops reading applies backpressure exactly like a slow
//! socket would. Closing either side closes both.

use super::{next_connection_id, BoxFuture, CloseSignal, Connection, PeerCredential, Protocol};
use crate::error::{HubError, Result};
use crate::message::Message;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const DEFAULT_CAPACITY: usize = 256;

/// Hub side of a loopback pair.
pub struct LoopbackConnection {
    id: u64,
    credential: PeerCredential,
    inbound: Mutex<mpsc::Receiver<Message>>,
    outbound: mpsc::Sender<Message>,
    closed: Arc<CloseSignal>,
    fail_sends: Arc<AtomicBool>,
}

/// Node side of a loopback pair.
pub struct LoopbackPeer {
    conn_id: u64,
    to_hub: mpsc::Sender<Message>,
    from_hub: Mutex<mpsc::Receiver<Message>>,
    closed: Arc<CloseSignal>,
    fail_sends: Arc<AtomicBool>,
}

impl LoopbackConnection {
    pub fn pair(credential: PeerCredential) -> (Arc<Self>, LoopbackPeer) {
        Self::pair_with_capacity(credential, DEFAULT_CAPACITY)
    }

    pub fn pair_with_capacity(credential: PeerCredential, capacity: usize) -> (Arc<Self>, LoopbackPeer) {
        let capacity = capacity.max(1);
        let (to_hub, inbound) = mpsc::channel(capacity);
        let (outbound, from_hub) = mpsc::channel(capacity);
        let closed = Arc::new(CloseSignal::new());
        let fail_sends = Arc::new(AtomicBool::new(false));
        let id = next_connection_id();

        let conn = Arc::new(Self {
            id,
            credential,
            inbound: Mutex::new(inbound),
            outbound,
            closed: Arc::clone(&closed),
            fail_sends: Arc::clone(&fail_sends),
        });
        let peer = LoopbackPeer {
            conn_id: id,
            to_hub,
            from_hub: Mutex::new(from_hub),
            closed,
            fail_sends,
        };
        (conn, peer)
    }
}

impl Connection for LoopbackConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn protocol(&self) -> Protocol {
        Protocol::Loopback
    }

    fn peer_credential(&self) -> &PeerCredential {
        &self.credential
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.closed.is_closed() {
                return Err(HubError::ConnectionClosed);
            }
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(HubError::transport(Protocol::Loopback, "injected send failure"));
            }
            tokio::select! {
                _ = self.closed.closed() => Err(HubError::ConnectionClosed),
                sent = self.outbound.send(message.clone()) => {
                    sent.map_err(|_| HubError::ConnectionClosed)
                }
            }
        })
    }

    fn receive(&self) -> BoxFuture<'_, Option<Message>> {
        Box::pin(async move {
            let mut inbound = self.inbound.lock().await;
            tokio::select! {
                biased;
                msg = inbound.recv() => Ok(msg),
                _ = self.closed.closed() => Ok(None),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.close();
            Ok(())
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

impl LoopbackPeer {
    /// Id of the hub-side connection this peer talks to.
    pub fn connection_id(&self) -> u64 {
        self.conn_id
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_closed() {
            return Err(HubError::ConnectionClosed);
        }
        self.to_hub.send(message).await.map_err(|_| HubError::ConnectionClosed)
    }

    /// Next message from the hub; `None` once closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        let mut from_hub = self.from_hub.lock().await;
        tokio::select! {
            biased;
            msg = from_hub.recv() => msg,
            _ = self.closed.closed() => from_hub.try_recv().ok(),
        }
    }

    /// Like [`recv`](Self::recv), giving up after `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Make every hub-side `send()` fail until reset.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.closed.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}
