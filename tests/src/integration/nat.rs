use dht_rpc::{Dht, DhtConfig};

use crate::{init_tracing, loopback, server_config};

/// `ping_nat` asks the responder to answer at the secondary socket's
/// port, exercising a second NAT mapping end to end.
#[tokio::test]
async fn nat_ping_is_answered_at_the_secondary_socket() {
    init_tracing();
    let (server, _server_events) = Dht::bind(server_config(vec![])).await.unwrap();
    let server_addr = loopback(&server);

    let (node, _events) = Dht::bind(DhtConfig {
        secondary_bind: Some(0),
        ..DhtConfig::for_testing()
    })
    .await
    .unwrap();
    node.ready().await.unwrap();

    let reply = node.ping_nat(server_addr).await.unwrap();
    assert_eq!(reply.from, server_addr);
    // The responder saw the request leave our primary socket.
    assert_eq!(
        reply.observed.map(|observed| observed.port()),
        Some(node.address().port())
    );

    server.destroy().await;
    node.destroy().await;
}

/// Without a secondary socket the operation fails up front.
#[tokio::test]
async fn nat_ping_requires_a_secondary_socket() {
    init_tracing();
    let (server, _server_events) = Dht::bind(server_config(vec![])).await.unwrap();
    let server_addr = loopback(&server);

    let (node, _events) = Dht::bind(DhtConfig::for_testing()).await.unwrap();
    node.ready().await.unwrap();

    assert!(node.ping_nat(server_addr).await.is_err());

    server.destroy().await;
    node.destroy().await;
}
