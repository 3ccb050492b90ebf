//! # dht-rpc Test Suite
//!
//! Multi-node integration scenarios over loopback UDP, using
//! `DhtConfig::for_testing()` so every timer is in the millisecond range.
//!
//! ```bash
//! # All tests
//! cargo test -p dht-rpc-tests
//!
//! # One scenario group
//! cargo test -p dht-rpc-tests integration::convergence
//! ```

#![allow(dead_code)]

pub mod integration;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use dht_rpc::{Dht, DhtConfig, DhtError, DhtEvents};

/// Generous ceiling for convergence loops on a loaded CI machine.
pub const SCENARIO_DEADLINE: Duration = Duration::from_secs(15);

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The node's reachable loopback endpoint.
pub fn loopback(node: &Dht) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, node.address().port())
}

/// A node that is allowed to turn persistent as soon as its endpoint is
/// confirmed.
pub fn server_config(bootstrap: Vec<SocketAddrV4>) -> DhtConfig {
    DhtConfig {
        bootstrap,
        ephemeral: Some(false),
        firewalled: Some(false),
        ..DhtConfig::for_testing()
    }
}

/// Spin up a bootstrapper that never takes a stable identity.
pub async fn ephemeral_bootstrapper() -> Result<(Dht, DhtEvents, SocketAddrV4), DhtError> {
    let (node, events) = Dht::bind(DhtConfig {
        ephemeral: Some(true),
        ..DhtConfig::for_testing()
    })
    .await?;
    let addr = loopback(&node);
    Ok((node, events, addr))
}

/// Poll `check` until it passes or the scenario deadline expires.
pub async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while !check() {
        assert!(
            start.elapsed() < SCENARIO_DEADLINE,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A bound socket that never answers; datagrams sent to it vanish.
pub async fn blackhole() -> (tokio::net::UdpSocket, SocketAddrV4) {
    let socket = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("loopback bind");
    let port = match socket.local_addr().expect("local addr") {
        std::net::SocketAddr::V4(addr) => addr.port(),
        other => panic!("expected an IPv4 socket, got {other}"),
    };
    (socket, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}
