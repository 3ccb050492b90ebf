use std::time::Duration;

use dht_rpc::{
    commands, Dht, DhtConfig, DhtError, DhtEvent, NodeId, OutboundRequest, RequestOptions,
};

use crate::{blackhole, ephemeral_bootstrapper, init_tracing, SCENARIO_DEADLINE};

#[tokio::test]
async fn node_without_peers_is_ready_immediately() {
    init_tracing();
    let (node, mut events) = Dht::bind(DhtConfig::for_testing()).await.unwrap();
    node.ready().await.unwrap();

    let seen = tokio::time::timeout(SCENARIO_DEADLINE, async {
        let mut listening = false;
        while let Some(event) = events.recv().await {
            match event {
                DhtEvent::Listening(addr) => {
                    assert_eq!(addr.port(), node.address().port());
                    listening = true;
                }
                DhtEvent::Ready => return listening,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(seen, "expected Listening before Ready");

    assert!(node.ephemeral());
    assert!(node.id().is_none());
    node.destroy().await;
}

#[tokio::test]
async fn bootstrap_against_ephemeral_node_yields_empty_lookups() {
    init_tracing();
    let (bootstrapper, _boot_events, boot_addr) = ephemeral_bootstrapper().await.unwrap();

    let (node, _events) = Dht::bind(DhtConfig {
        bootstrap: vec![boot_addr],
        ..DhtConfig::for_testing()
    })
    .await
    .unwrap();
    node.ready().await.unwrap();

    // The bootstrapper answers but discloses no ID, so it is never
    // admitted anywhere.
    assert!(node.to_array().await.unwrap().is_empty());

    let mut query = node.find_node(NodeId::random());
    let result = query.finished().await.unwrap();
    assert!(result.closest_nodes.is_empty());
    assert!(result.closest_replies.is_empty());

    bootstrapper.destroy().await;
    node.destroy().await;
}

#[tokio::test]
async fn query_with_no_candidates_terminates_with_empty_streams() {
    init_tracing();
    let (node, _events) = Dht::bind(DhtConfig::for_testing()).await.unwrap();
    node.ready().await.unwrap();

    let mut query = node.find_node(NodeId::random());
    assert!(query.next().await.is_none());
    let result = query.finished().await.unwrap();
    assert!(result.closest_nodes.is_empty());
    node.destroy().await;
}

#[tokio::test]
async fn destroy_rejects_pending_and_new_operations() {
    init_tracing();
    let (_guard, dead) = blackhole().await;
    let (node, _events) = Dht::bind(DhtConfig {
        // Long enough that the request is still pending at destroy time.
        request_timeout: Duration::from_secs(5),
        ..DhtConfig::for_testing()
    })
    .await
    .unwrap();
    node.ready().await.unwrap();

    let pending = {
        let node = node.clone();
        tokio::spawn(async move { node.ping(dead).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    node.destroy().await;

    let outcome = pending.await.unwrap();
    assert!(matches!(outcome, Err(DhtError::Destroyed)), "{outcome:?}");
    assert!(node.destroyed());

    let outcome = node
        .request(
            OutboundRequest::new(commands::PING),
            dead,
            RequestOptions::default(),
        )
        .await;
    assert!(matches!(outcome, Err(DhtError::Destroyed)));
    assert!(matches!(node.ready().await, Err(DhtError::Destroyed)));

    let mut query = node.find_node(NodeId::random());
    assert!(matches!(query.finished().await, Err(DhtError::Destroyed)));
}
