// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Admission and framing over a real QUIC listener on localhost.
//!
//! The node opens the control stream and must write on it first: a token
//! frame for anonymous nodes, a keepalive for certificate-authenticated ones.

mod common;

use cloudhub::credentials::QUIC_ALPN;
use cloudhub::message::{Message, NodeIdentity};
use cloudhub::transport::codec::{read_frame, write_frame};
use cloudhub::transport::{Connection as _, Protocol};
use cloudhub::{CloudHub, HubConfig, NoOpObjectStore};
use common::{init_tracing, node, wait_until};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const MAX_FRAME: usize = 1 << 20;

struct QuicNode {
    // Dropping the endpoint tears the connection down
    _endpoint: Endpoint,
    connection: Connection,
    send: SendStream,
    recv: RecvStream,
}

impl QuicNode {
    async fn write(&mut self, msg: &Message) {
        write_frame(&mut self.send, msg, MAX_FRAME).await.unwrap();
    }

    async fn next_message(&mut self) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(2), read_frame(&mut self.recv, MAX_FRAME))
            .await
            .ok()?
            .ok()?
    }

    async fn closed_within(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.connection.closed()).await.is_ok()
    }
}

async fn started_hub(max_incoming_streams: u32) -> CloudHub<NoOpObjectStore> {
    init_tracing();
    let mut config = HubConfig::for_testing();
    config.sync.enabled = false;
    config.quic.enabled = true;
    config.quic.max_incoming_streams = max_incoming_streams;
    let mut hub = CloudHub::new(config);
    hub.start().await.unwrap();
    hub
}

fn client_config(
    hub: &CloudHub<NoOpObjectStore>,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
) -> quinn::ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.add(hub.credentials().bundle().unwrap().ca_der().unwrap()).unwrap();

    let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_root_certificates(roots);
    let mut tls = match identity {
        Some((chain, key)) => builder.with_client_auth_cert(chain, key).unwrap(),
        None => builder.with_no_client_auth(),
    };
    tls.alpn_protocols = vec![QUIC_ALPN.to_vec()];

    quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(tls).unwrap()))
}

/// Connect and open the control stream. Nothing is written yet.
async fn dial(hub: &CloudHub<NoOpObjectStore>, config: quinn::ClientConfig) -> QuicNode {
    let addr = hub.local_addr(Protocol::Quic).await.unwrap();
    let mut endpoint = Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    endpoint.set_default_client_config(config);

    let connection = endpoint.connect(addr, "localhost").unwrap().await.unwrap();
    let (send, recv) = connection.open_bi().await.unwrap();
    QuicNode {
        _endpoint: endpoint,
        connection,
        send,
        recv,
    }
}

#[tokio::test]
async fn no_token_on_anonymous_connection_is_closed() {
    let mut hub = started_hub(8).await;

    let mut quic = dial(&hub, client_config(&hub, None)).await;
    quic.write(&Message::keepalive(node("edge-1"))).await;

    assert!(quic.closed_within(Duration::from_secs(3)).await);
    assert_eq!(hub.registry().connected_count(), 0);

    hub.shutdown().await;
}

#[tokio::test]
async fn bad_token_is_closed() {
    let mut hub = started_hub(8).await;

    let mut quic = dial(&hub, client_config(&hub, None)).await;
    quic.write(&Message::admit(node("edge-1"), "deadbeef.not.a.jwt")).await;

    assert!(quic.closed_within(Duration::from_secs(3)).await);
    assert!(!hub.registry().is_connected(&node("edge-1")));

    hub.shutdown().await;
}

#[tokio::test]
async fn valid_token_registers_and_round_trips() {
    let mut hub = started_hub(8).await;
    let edge = node("edge-1");

    let token = hub.credentials().current_token().await.unwrap().token;
    let mut quic = dial(&hub, client_config(&hub, None)).await;
    quic.write(&Message::admit(edge.clone(), token)).await;

    let registry = Arc::clone(hub.registry());
    assert!(wait_until(Duration::from_secs(3), || registry.is_connected(&edge)).await);
    assert_eq!(registry.lookup(&edge).unwrap().protocol(), Protocol::Quic);

    hub.enqueue(Message::update(edge.clone(), "devices/d1", 4, json!({"on": true})))
        .await
        .unwrap();
    let msg = quic.next_message().await.unwrap();
    assert_eq!(msg.resource.as_str(), "devices/d1");
    assert_eq!(msg.version, 4);
    quic.write(&msg.ack()).await;

    let queue = registry.existing_queue(&edge).unwrap();
    let mut acked = false;
    for _ in 0..100 {
        if queue.record(&"devices/d1".into()).await.is_some_and(|r| r.last_acked == 4) {
            acked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(acked);

    hub.shutdown().await;
}

#[tokio::test]
async fn client_certificate_registers_without_token() {
    let mut hub = started_hub(8).await;

    let token = hub.credentials().current_token().await.unwrap().token;
    let issued = hub.credentials().issue_node_certificate(&token, "edge-9").unwrap();
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut issued.cert_pem.as_bytes())
        .collect::<Result<_, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut issued.key_pem.as_bytes()).unwrap().unwrap();

    let edge = NodeIdentity::new("edge-9").unwrap();
    let mut quic = dial(&hub, client_config(&hub, Some((chain, key)))).await;
    quic.write(&Message::keepalive(edge.clone())).await;

    let registry = Arc::clone(hub.registry());
    assert!(wait_until(Duration::from_secs(3), || registry.is_connected(&edge)).await);

    hub.shutdown().await;
}

#[tokio::test]
async fn acks_on_extra_stream_are_routed() {
    let mut hub = started_hub(8).await;
    let edge = node("edge-1");

    let token = hub.credentials().current_token().await.unwrap().token;
    let mut quic = dial(&hub, client_config(&hub, None)).await;
    quic.write(&Message::admit(edge.clone(), token)).await;
    let registry = Arc::clone(hub.registry());
    assert!(wait_until(Duration::from_secs(3), || registry.is_connected(&edge)).await);

    hub.enqueue(Message::update(edge.clone(), "devices/d2", 1, json!(1))).await.unwrap();
    let msg = quic.next_message().await.unwrap();

    let (mut extra, _extra_recv) = quic.connection.open_bi().await.unwrap();
    write_frame(&mut extra, &msg.ack(), MAX_FRAME).await.unwrap();

    let queue = registry.existing_queue(&edge).unwrap();
    let mut acked = false;
    for _ in 0..100 {
        if queue.is_empty().await {
            acked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(acked);

    hub.shutdown().await;
}

#[tokio::test]
async fn stream_limit_is_enforced() {
    let mut hub = started_hub(2).await;
    let edge = node("edge-1");

    let token = hub.credentials().current_token().await.unwrap().token;
    let mut quic = dial(&hub, client_config(&hub, None)).await;
    quic.write(&Message::admit(edge.clone(), token)).await;
    let registry = Arc::clone(hub.registry());
    assert!(wait_until(Duration::from_secs(3), || registry.is_connected(&edge)).await);

    // Control stream plus one more fills the limit
    let (mut second, _second_recv) = quic.connection.open_bi().await.unwrap();
    write_frame(&mut second, &Message::keepalive(edge.clone()), MAX_FRAME).await.unwrap();
    let third = tokio::time::timeout(Duration::from_millis(300), quic.connection.open_bi()).await;
    assert!(third.is_err(), "a third stream was allowed");

    hub.shutdown().await;
}

#[tokio::test]
async fn destroy_closes_quic_connection() {
    let mut hub = started_hub(8).await;
    let edge = node("edge-1");

    let token = hub.credentials().current_token().await.unwrap().token;
    let mut quic = dial(&hub, client_config(&hub, None)).await;
    quic.write(&Message::admit(edge.clone(), token)).await;
    let registry = Arc::clone(hub.registry());
    assert!(wait_until(Duration::from_secs(3), || registry.is_connected(&edge)).await);

    hub.destroy_node(&edge).await.unwrap();
    assert!(quic.closed_within(Duration::from_secs(2)).await);
    assert!(!registry.is_connected(&edge));

    hub.shutdown().await;
}
