//! Node configuration.

use std::net::SocketAddrV4;
use std::time::Duration;

/// Bucket capacity and lookup width.
pub const DEFAULT_K: usize = 20;

/// Query parallelism.
pub const DEFAULT_ALPHA: usize = 3;

/// All tunables of a DHT node.
///
/// `Default` carries the production values; [`DhtConfig::for_testing`]
/// shortens every timer so multi-node scenarios converge in milliseconds
/// on loopback.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Well-known entry points contacted while the routing table is empty.
    pub bootstrap: Vec<SocketAddrV4>,
    /// Additional known peers admitted (after a ping round-trip) at startup.
    pub nodes: Vec<SocketAddrV4>,
    /// UDP bind port for the primary socket. The default of 0 lets the OS
    /// pick, which ephemeral nodes should keep so unstable endpoints never
    /// pollute stable IDs.
    pub bind: u16,
    /// Bind port for the optional secondary socket (hole punching, NAT
    /// probes); `Some(0)` binds a random port, `None` skips the socket.
    pub secondary_bind: Option<u16>,
    /// `Some(true)` pins the node ephemeral, `Some(false)` upgrades as soon
    /// as the public endpoint is confirmed, `None` upgrades adaptively
    /// after [`DhtConfig::adapt_after`].
    pub ephemeral: Option<bool>,
    /// Initial reachability belief. `None`/`Some(true)` assume a firewall
    /// until an unsolicited inbound request proves otherwise.
    pub firewalled: Option<bool>,

    /// Bucket capacity and lookup width (K).
    pub k: usize,
    /// Iterative query parallelism (alpha).
    pub alpha: usize,
    /// In-flight cap for the commit phase of a query.
    pub commit_concurrency: usize,
    /// In-flight request cap per socket; beyond it `request` fails fast.
    pub max_inflight: usize,

    /// Round-trip deadline for a single request attempt.
    pub request_timeout: Duration,
    /// Deadline for liveness probes (bucket eviction, staleness).
    pub probe_timeout: Duration,
    /// Token secret rotation period; tokens live one to two periods.
    pub secret_rotation: Duration,
    /// A peer silent for this long is probed and evicted on non-response.
    pub stale_after: Duration,
    /// Cadence of the routing-table refresh task.
    pub refresh_interval: Duration,
    /// Uptime required before an adaptive node turns persistent.
    pub adapt_after: Duration,
    /// Cadence of the heartbeat that drives sleep detection and identity
    /// upkeep.
    pub heartbeat_interval: Duration,
    /// Monotonic overshoot beyond the heartbeat interval treated as a
    /// suspend/resume cycle.
    pub sleep_threshold: Duration,

    /// Size of the sliding window of external endpoint reports.
    pub report_window: usize,
    /// Reports that must agree before an endpoint is considered stable.
    pub report_quorum: usize,
    /// An inbound request from an endpoint we have not contacted within
    /// this window counts as unsolicited (reachability evidence).
    pub contact_window: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            nodes: Vec::new(),
            bind: 0,
            secondary_bind: None,
            ephemeral: None,
            firewalled: None,

            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            commit_concurrency: 16,
            max_inflight: 2048,

            request_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
            secret_rotation: Duration::from_secs(5 * 60),
            stale_after: Duration::from_secs(15 * 60),
            refresh_interval: Duration::from_secs(60),
            adapt_after: Duration::from_secs(20 * 60),
            heartbeat_interval: Duration::from_secs(5),
            sleep_threshold: Duration::from_secs(2),

            report_window: 10,
            report_quorum: 3,
            contact_window: Duration::from_secs(60),
        }
    }
}

impl DhtConfig {
    /// Configuration with every timer shortened for loopback tests.
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(100),
            secret_rotation: Duration::from_millis(500),
            stale_after: Duration::from_secs(2),
            refresh_interval: Duration::from_millis(200),
            adapt_after: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(50),
            sleep_threshold: Duration::from_millis(200),
            contact_window: Duration::from_secs(2),
            ..Self::default()
        }
    }
}
