use std::time::{Duration, Instant};

use dht_rpc::{commands, Dht, DhtConfig, DhtError, OutboundRequest, RequestOptions};

use crate::{blackhole, init_tracing};

/// Slack for scheduler jitter on top of the exact timeout budget.
const SLACK: Duration = Duration::from_millis(400);

#[tokio::test]
async fn lost_datagram_times_out_after_one_budget_without_retry() {
    init_tracing();
    let (_guard, dead) = blackhole().await;
    let config = DhtConfig::for_testing();
    let budget = config.request_timeout;
    let (node, _events) = Dht::bind(config).await.unwrap();
    node.ready().await.unwrap();

    let start = Instant::now();
    let outcome = node
        .request(
            OutboundRequest::new(commands::FIND_NODE),
            dead,
            RequestOptions::default(),
        )
        .await;
    let elapsed = start.elapsed();

    assert!(matches!(outcome, Err(DhtError::Timeout)), "{outcome:?}");
    assert!(elapsed >= budget, "failed early: {elapsed:?}");
    assert!(elapsed < budget + SLACK, "failed late: {elapsed:?}");
    node.destroy().await;
}

#[tokio::test]
async fn retry_doubles_the_timeout_budget() {
    init_tracing();
    let (_guard, dead) = blackhole().await;
    let config = DhtConfig::for_testing();
    let budget = config.request_timeout;
    let (node, _events) = Dht::bind(config).await.unwrap();
    node.ready().await.unwrap();

    let start = Instant::now();
    let outcome = node
        .request(
            OutboundRequest::new(commands::FIND_NODE),
            dead,
            RequestOptions {
                retry: true,
                ..RequestOptions::default()
            },
        )
        .await;
    let elapsed = start.elapsed();
    assert!(matches!(outcome, Err(DhtError::Timeout)));
    assert!(elapsed >= budget * 2, "failed early: {elapsed:?}");
    assert!(elapsed < budget * 2 + SLACK, "failed late: {elapsed:?}");

    // Pings retry implicitly.
    let start = Instant::now();
    let outcome = node.ping(dead).await;
    let elapsed = start.elapsed();
    assert!(matches!(outcome, Err(DhtError::Timeout)));
    assert!(elapsed >= budget * 2, "ping failed early: {elapsed:?}");
    node.destroy().await;
}

#[tokio::test]
async fn inflight_cap_fails_fast_with_overflow() {
    init_tracing();
    let (_guard, dead) = blackhole().await;
    let (node, _events) = Dht::bind(DhtConfig {
        max_inflight: 2,
        ..DhtConfig::for_testing()
    })
    .await
    .unwrap();
    node.ready().await.unwrap();

    let request = |node: &Dht| {
        let node = node.clone();
        async move {
            node.request(
                OutboundRequest::new(commands::FIND_NODE),
                dead,
                RequestOptions::default(),
            )
            .await
        }
    };
    let (first, second, third) = tokio::join!(request(&node), request(&node), request(&node));

    let outcomes = [first, second, third];
    let overflows = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Err(DhtError::Overflow)))
        .count();
    let timeouts = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Err(DhtError::Timeout)))
        .count();
    assert_eq!(overflows, 1, "{outcomes:?}");
    assert_eq!(timeouts, 2, "{outcomes:?}");
    node.destroy().await;
}
