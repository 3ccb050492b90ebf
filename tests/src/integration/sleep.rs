use std::sync::Arc;
use std::time::Duration;

use dht_rpc::{Dht, DhtEvent, ManualClock};

use crate::{init_tracing, loopback, server_config, wait_for, SCENARIO_DEADLINE};

/// A persistent node whose monotonic clock jumps past the heartbeat
/// window must emit a wake-up, drop its identity, and clear its table.
#[tokio::test(flavor = "multi_thread")]
async fn suspend_resume_downgrades_to_ephemeral() {
    init_tracing();
    let (bootstrapper, _boot_events) = Dht::bind(server_config(vec![])).await.unwrap();
    let boot_addr = loopback(&bootstrapper);

    let clock = Arc::new(ManualClock::new());
    let (node, mut events) = Dht::bind_with_clock(server_config(vec![boot_addr]), clock.clone())
        .await
        .unwrap();
    node.ready().await.unwrap();
    wait_for("node persistent", || !node.ephemeral()).await;
    assert!(node.id().is_some());

    // Nap far past interval + threshold; the next heartbeat sees the jump.
    clock.advance(Duration::from_secs(10));

    tokio::time::timeout(SCENARIO_DEADLINE, async {
        while let Some(event) = events.recv().await {
            if matches!(event, DhtEvent::WakeUp) {
                return;
            }
        }
        panic!("event stream ended without a wake-up");
    })
    .await
    .expect("no wake-up event");

    assert!(node.ephemeral());
    assert!(node.id().is_none());
    assert!(node.to_array().await.unwrap().is_empty());

    bootstrapper.destroy().await;
    node.destroy().await;
}
