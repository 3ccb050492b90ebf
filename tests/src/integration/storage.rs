//! A minimal key/value application laid over the substrate: command
//! `VALUES` stores token-verified payloads under `H(value)` and serves
//! them back to lookups.

use std::collections::HashMap;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use dht_rpc::{
    commands, status, Commit, Dht, DhtConfig, DhtEvent, DhtEvents, NodeId, OutboundRequest,
    QueryOptions, QuerySpec, RequestOptions,
};

use crate::{init_tracing, loopback, server_config, wait_for, SCENARIO_DEADLINE};

const VALUES: u64 = commands::APP_BASE;

fn hash(value: &[u8]) -> NodeId {
    let mut hasher = Sha256::new();
    hasher.update(value);
    NodeId::new(hasher.finalize().into())
}

/// Drive one node's event stream as a VALUES server.
fn serve_values(mut events: DhtEvents) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut store: HashMap<[u8; 32], Vec<u8>> = HashMap::new();
        while let Some(event) = events.recv().await {
            let DhtEvent::Request(request) = event else {
                continue;
            };
            if request.command != VALUES {
                request.error(status::UNKNOWN_COMMAND);
                continue;
            }
            let Some(target) = request.target else {
                request.error(status::UNKNOWN_COMMAND);
                continue;
            };
            match request.value.clone() {
                Some(value) => {
                    // Mutations demand proof of a prior round-trip.
                    if !request.token_ok {
                        request.error(status::INVALID_TOKEN);
                        continue;
                    }
                    store.insert(*target.as_bytes(), value);
                    request.reply(None);
                }
                None => {
                    let stored = store.get(target.as_bytes()).cloned();
                    request.reply(stored);
                }
            }
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn committed_values_are_retrievable_by_a_second_client() {
    init_tracing();
    let (bootstrapper, boot_events) = Dht::bind(server_config(vec![])).await.unwrap();
    serve_values(boot_events);
    let boot_addr = loopback(&bootstrapper);

    let mut swarm = Vec::new();
    for _ in 0..20 {
        let (node, events) = Dht::bind(server_config(vec![boot_addr])).await.unwrap();
        serve_values(events);
        swarm.push(node);
    }
    for node in &swarm {
        node.ready().await.unwrap();
    }
    wait_for("swarm persistent", || {
        swarm.iter().all(|node| !node.ephemeral())
    })
    .await;

    let client_config = DhtConfig {
        bootstrap: vec![boot_addr],
        ephemeral: Some(true),
        ..DhtConfig::for_testing()
    };
    let (writer, _writer_events) = Dht::bind(client_config.clone()).await.unwrap();
    let (reader, _reader_events) = Dht::bind(client_config).await.unwrap();
    writer.ready().await.unwrap();
    reader.ready().await.unwrap();

    let value = b"distributed hash tables carry arbitrary commands".to_vec();
    let target = hash(&value);

    let start = tokio::time::Instant::now();
    loop {
        // Store: the lookup phase collects tokens, the commit phase
        // re-requests the closest responders with them.
        let mut put = writer.query(
            QuerySpec {
                target,
                command: VALUES,
                value: Some(value.clone()),
            },
            QueryOptions {
                commit: Commit::Closest,
                ..QueryOptions::default()
            },
        );
        put.finished().await.unwrap();

        // Fetch from an independent client.
        let mut get = reader.query(
            QuerySpec {
                target,
                command: VALUES,
                value: None,
            },
            QueryOptions::default(),
        );
        let mut found = false;
        while let Some(reply) = get.next().await {
            if let Some(stored) = &reply.value {
                if hash(stored) == target {
                    found = true;
                }
            }
        }
        if found {
            break;
        }
        assert!(
            start.elapsed() < SCENARIO_DEADLINE,
            "stored value never surfaced"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn forged_tokens_are_rejected_and_nothing_is_stored() {
    init_tracing();
    let (server, events) = Dht::bind(server_config(vec![])).await.unwrap();
    serve_values(events);
    let server_addr = loopback(&server);

    let (client, _client_events) = Dht::bind(DhtConfig::for_testing()).await.unwrap();
    client.ready().await.unwrap();

    let value = b"not yours to store".to_vec();
    let target = hash(&value);

    // Forged token: rejected, nothing stored.
    let mut store = OutboundRequest::new(VALUES);
    store.target = Some(target);
    store.value = Some(value.clone());
    store.token = Some([0u8; 32]);
    let reply = client
        .request(store, server_addr, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.status, status::INVALID_TOKEN);

    let mut fetch = OutboundRequest::new(VALUES);
    fetch.target = Some(target);
    let reply = client
        .request(fetch.clone(), server_addr, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.status, status::OK);
    assert_eq!(reply.value, None);

    // A round-trip token from the server itself is accepted.
    let token = client.ping(server_addr).await.unwrap().token;
    assert!(token.is_some());
    let mut store = OutboundRequest::new(VALUES);
    store.target = Some(target);
    store.value = Some(value.clone());
    store.token = token;
    let reply = client
        .request(store, server_addr, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.status, status::OK);

    let reply = client
        .request(fetch, server_addr, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.value, Some(value));
}
