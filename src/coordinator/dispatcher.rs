// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatcher: drains one node's queue onto its attached connection.
//!
//! One task per attached connection. The loop:
//! 1. Waits for the oldest pending message (bounded by the in-flight window)
//! 2. Sends it on the connection
//! 3. On success records it as sent; retirement waits for the ack
//! 4. On failure returns it to the head of the queue, closes the
//!    connection and exits
//!
//! # Stopping
//!
//! The stop signal is only observed while waiting for work, never mid-send,
//! so a message is either on the wire and marked sent, or still pending.
//! Whatever is in flight when the dispatcher exits is rewound by the
//! registry before the next dispatcher starts.

use crate::error::HubError;
use crate::message::NodeIdentity;
use crate::metrics;
use crate::queue::NodeQueue;
use crate::transport::Connection;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn, Instrument};

/// Why a dispatch cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    Stopped,
    SendFailed,
    QueueDestroyed,
}

/// Run the dispatch cycle for `identity` until stopped or the send path fails.
pub async fn run_dispatcher(
    identity: NodeIdentity,
    queue: Arc<NodeQueue>,
    conn: Arc<dyn Connection>,
    max_in_flight: usize,
    mut stop_rx: watch::Receiver<bool>,
) -> DispatchExit {
    let span = tracing::info_span!("dispatcher", node = %identity, conn_id = conn.id());

    async move {
        // Superseded before the first poll
        if *stop_rx.borrow_and_update() {
            debug!("Dispatcher stopped before attaching");
            return DispatchExit::Stopped;
        }
        let protocol = conn.protocol();
        let mut sent: u64 = 0;
        debug!(protocol = %protocol, max_in_flight, "Dispatcher attached");

        let exit = loop {
            let next = tokio::select! {
                biased;

                result = stop_rx.changed() => {
                    if result.is_err() || *stop_rx.borrow() {
                        break DispatchExit::Stopped;
                    }
                    continue;
                }

                next = queue.next_to_send(max_in_flight) => next,
            };

            let (seq, message) = match next {
                Ok(item) => item,
                Err(HubError::NodeDestroyed(_)) => break DispatchExit::QueueDestroyed,
                Err(e) => {
                    warn!(error = %e, "Unexpected queue error");
                    break DispatchExit::Stopped;
                }
            };

            match conn.send(&message).await {
                Ok(()) => {
                    queue.mark_sent(seq).await;
                    metrics::record_message_sent(protocol.as_str());
                    sent += 1;
                    trace!(resource = %message.resource, version = message.version, "Sent");
                }
                Err(e) => {
                    queue.requeue(seq).await;
                    metrics::record_send_failure(protocol.as_str());
                    warn!(
                        resource = %message.resource,
                        version = message.version,
                        error = %e,
                        "Send failed, message kept at head of queue"
                    );
                    // The receive loop sees the close and deregisters
                    let _ = conn.close().await;
                    break DispatchExit::SendFailed;
                }
            }
        };

        info!(sent, exit = ?exit, "Dispatcher detached");
        exit
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::transport::{LoopbackConnection, PeerCredential};
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(200);

    fn node() -> NodeIdentity {
        NodeIdentity::new("edge-1").unwrap()
    }

    fn spawn(
        queue: &Arc<NodeQueue>,
        conn: Arc<LoopbackConnection>,
        max_in_flight: usize,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<DispatchExit>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_dispatcher(node(), Arc::clone(queue), conn, max_in_flight, stop_rx));
        (stop_tx, handle)
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let queue = Arc::new(NodeQueue::new(node(), 16));
        for i in 1..=3 {
            queue.enqueue(Message::update(node(), format!("r{}", i), 1, json!(i)), WAIT).await.unwrap();
        }
        let (conn, peer) = LoopbackConnection::pair(PeerCredential::Trusted(node()));
        let (stop_tx, handle) = spawn(&queue, conn, 8);

        for i in 1..=3 {
            let msg = peer.recv_timeout(WAIT).await.unwrap();
            assert_eq!(msg.resource.as_str(), format!("r{}", i));
        }
        stop_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), DispatchExit::Stopped);
        // Sent but unacked stays queued
        assert_eq!(queue.len().await, 3);
    }

    #[tokio::test]
    async fn test_send_failure_keeps_message() {
        let queue = Arc::new(NodeQueue::new(node(), 16));
        queue.enqueue(Message::update(node(), "a", 1, json!(1)), WAIT).await.unwrap();
        let (conn, peer) = LoopbackConnection::pair(PeerCredential::Trusted(node()));
        peer.set_fail_sends(true);

        let (_stop_tx, handle) = spawn(&queue, conn, 8);
        let exit = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(exit, DispatchExit::SendFailed);
        assert!(peer.is_closed());
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.in_flight_len().await, 0);
        assert!(queue.record(&"a".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_window_waits_for_ack() {
        let queue = Arc::new(NodeQueue::new(node(), 16));
        let first = Message::update(node(), "a", 1, json!(1));
        queue.enqueue(first.clone(), WAIT).await.unwrap();
        queue.enqueue(Message::update(node(), "b", 1, json!(1)), WAIT).await.unwrap();

        let (conn, peer) = LoopbackConnection::pair(PeerCredential::Trusted(node()));
        let (stop_tx, handle) = spawn(&queue, conn, 1);

        assert_eq!(peer.recv_timeout(WAIT).await.unwrap().resource.as_str(), "a");
        assert!(peer.recv_timeout(Duration::from_millis(50)).await.is_none());

        queue.acknowledge(&first.resource, 1).await;
        assert_eq!(peer.recv_timeout(WAIT).await.unwrap().resource.as_str(), "b");

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_first_poll() {
        let queue = Arc::new(NodeQueue::new(node(), 16));
        let (conn, peer) = LoopbackConnection::pair(PeerCredential::Trusted(node()));
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();

        let handle = tokio::spawn(run_dispatcher(node(), Arc::clone(&queue), conn, 4, stop_rx));
        let exit = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(exit, DispatchExit::Stopped);

        queue.enqueue(Message::update(node(), "a", 1, json!(1)), WAIT).await.unwrap();
        assert!(peer.recv_timeout(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_exits_on_destroy() {
        let queue = Arc::new(NodeQueue::new(node(), 16));
        let (conn, _peer) = LoopbackConnection::pair(PeerCredential::Trusted(node()));
        let (_stop_tx, handle) = spawn(&queue, conn, 4);

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.destroy().await;
        let exit = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(exit, DispatchExit::QueueDestroyed);
    }
}
