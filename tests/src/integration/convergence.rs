use std::time::Duration;

use dht_rpc::Dht;

use crate::{init_tracing, loopback, server_config, wait_for, SCENARIO_DEADLINE};

/// Bootstrapper plus two peers, all allowed to turn persistent. Each peer
/// must end up in the other's routing table and be resolvable by ID.
#[tokio::test(flavor = "multi_thread")]
async fn three_nodes_converge_to_mutual_routing_entries() {
    init_tracing();
    let (a, _a_events) = Dht::bind(server_config(vec![])).await.unwrap();
    let a_addr = loopback(&a);

    let (b, _b_events) = Dht::bind(server_config(vec![a_addr])).await.unwrap();
    let (c, _c_events) = Dht::bind(server_config(vec![a_addr])).await.unwrap();
    b.ready().await.unwrap();
    c.ready().await.unwrap();

    // The peers learn their endpoints from the bootstrapper's replies;
    // the bootstrapper learns its own from their inbound requests.
    wait_for("all three nodes persistent", || {
        !a.ephemeral() && !b.ephemeral() && !c.ephemeral()
    })
    .await;

    let b_id = b.id().unwrap();
    let c_id = c.id().unwrap();
    assert_ne!(b_id, c_id);

    let start = tokio::time::Instant::now();
    loop {
        let b_knows_c = b.to_array().await.unwrap().iter().any(|e| e.id == c_id);
        let c_knows_b = c.to_array().await.unwrap().iter().any(|e| e.id == b_id);
        if b_knows_c && c_knows_b {
            break;
        }
        assert!(
            start.elapsed() < SCENARIO_DEADLINE,
            "peers never learned each other"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // An ID lookup resolves the other peer as the closest node.
    let start = tokio::time::Instant::now();
    loop {
        let mut query = b.find_node(c_id);
        let result = query.finished().await.unwrap();
        if result.closest_nodes.first().map(|n| n.id) == Some(c_id) {
            break;
        }
        assert!(
            start.elapsed() < SCENARIO_DEADLINE,
            "find_node never resolved the peer, got {:?}",
            result.closest_nodes
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Manual admission: a fourth persistent node handed to `b` directly.
    let (d, _d_events) = Dht::bind(server_config(vec![a_addr])).await.unwrap();
    d.ready().await.unwrap();
    wait_for("fourth node persistent", || !d.ephemeral()).await;
    let d_id = d.id().unwrap();

    b.add_node(loopback(&d));
    let start = tokio::time::Instant::now();
    loop {
        if b.to_array().await.unwrap().iter().any(|e| e.id == d_id) {
            break;
        }
        assert!(
            start.elapsed() < SCENARIO_DEADLINE,
            "add_node never admitted the peer"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    for node in [&a, &b, &c, &d] {
        node.destroy().await;
    }
}
