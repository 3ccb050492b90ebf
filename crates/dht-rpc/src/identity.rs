//! Identity and NAT self-discovery.
//!
//! A node starts *ephemeral*: it has no stable ID, advertises nothing, and
//! keeps no routing table. Peers report back the endpoint they see us at;
//! once enough recent reports agree, we are reachable, and (for adaptive
//! nodes) the uptime bar is met, the node turns *persistent*: its ID
//! becomes `H(public_ip || public_port)` and it starts participating in
//! peers' routing tables. The machine drops back to ephemeral when the
//! observed endpoint drifts away from the one baked into the ID, or when
//! the heartbeat detects a suspend/resume cycle.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::DhtConfig;
use crate::domain::id::NodeId;

/// Why a persistent node fell back to ephemeral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DowngradeReason {
    /// Monotonic clock jumped past the heartbeat interval: the host slept.
    Slept,
    /// The modal endpoint no longer matches the one the ID was derived
    /// from.
    EndpointChanged,
}

/// State change requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Upgrade { id: NodeId, addr: SocketAddrV4 },
    Downgrade(DowngradeReason),
}

/// Result of one heartbeat tick.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Heartbeat {
    /// A sleep jump was observed this tick.
    pub slept: bool,
    pub transition: Option<Transition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Ephemeral,
    Persistent { id: NodeId, addr: SocketAddrV4 },
}

#[derive(Debug)]
pub struct Identity {
    mode: Mode,
    /// Caller override: `Some(true)` pins ephemeral, `Some(false)` skips
    /// the uptime bar.
    forced: Option<bool>,
    firewalled: bool,
    /// Last N external reports of our endpoint, oldest first.
    reports: VecDeque<SocketAddrV4>,
    started: Instant,
    last_heartbeat: Instant,

    window: usize,
    quorum: usize,
    adapt_after: Duration,
    heartbeat_interval: Duration,
    sleep_threshold: Duration,
}

impl Identity {
    pub fn new(config: &DhtConfig, now: Instant) -> Self {
        Self {
            mode: Mode::Ephemeral,
            forced: config.ephemeral,
            firewalled: config.firewalled.unwrap_or(true),
            reports: VecDeque::with_capacity(config.report_window),
            started: now,
            last_heartbeat: now,
            window: config.report_window,
            quorum: config.report_quorum,
            adapt_after: config.adapt_after,
            heartbeat_interval: config.heartbeat_interval,
            sleep_threshold: config.sleep_threshold,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self.mode, Mode::Ephemeral)
    }

    pub fn firewalled(&self) -> bool {
        self.firewalled
    }

    /// Whether the caller allows this node to turn persistent at all.
    pub fn wants_upgrade(&self) -> bool {
        self.forced != Some(true)
    }

    pub fn id(&self) -> Option<&NodeId> {
        match &self.mode {
            Mode::Persistent { id, .. } => Some(id),
            Mode::Ephemeral => None,
        }
    }

    /// Best current guess of the public endpoint: the modal host, with the
    /// port zeroed while the port reports disagree (port-randomizing NAT).
    pub fn public_addr(&self) -> Option<SocketAddrV4> {
        let host = self.modal_host()?;
        Some(SocketAddrV4::new(host, self.modal_port().unwrap_or(0)))
    }

    /// An unsolicited inbound request reached us: the endpoint accepts
    /// traffic from strangers.
    pub fn on_unsolicited_request(&mut self) {
        if self.firewalled {
            debug!("unsolicited inbound request, clearing firewalled flag");
            self.firewalled = false;
        }
    }

    /// A peer told us where it sees us. Returns a transition when the
    /// report completes an upgrade or reveals endpoint drift.
    pub fn on_report(&mut self, reported: SocketAddrV4, now: Instant) -> Option<Transition> {
        if self.reports.len() == self.window {
            self.reports.pop_front();
        }
        self.reports.push_back(reported);
        self.evaluate(now)
    }

    /// Heartbeat tick: detects sleep, re-checks the adaptive upgrade bar.
    pub fn on_heartbeat(&mut self, now: Instant) -> Heartbeat {
        let elapsed = now.saturating_duration_since(self.last_heartbeat);
        self.last_heartbeat = now;

        if elapsed > self.heartbeat_interval + self.sleep_threshold {
            info!(?elapsed, "monotonic clock jump, assuming suspend/resume");
            // Whatever we believed about our endpoint predates the nap.
            self.reports.clear();
            let transition = match self.mode {
                Mode::Persistent { .. } => {
                    self.mode = Mode::Ephemeral;
                    Some(Transition::Downgrade(DowngradeReason::Slept))
                }
                Mode::Ephemeral => None,
            };
            return Heartbeat {
                slept: true,
                transition,
            };
        }

        Heartbeat {
            slept: false,
            transition: self.evaluate(now),
        }
    }

    /// Called after a downgrade is applied by the node.
    pub fn reset_after_downgrade(&mut self, now: Instant) {
        self.mode = Mode::Ephemeral;
        self.reports.clear();
        self.started = now;
    }

    fn evaluate(&mut self, now: Instant) -> Option<Transition> {
        match &self.mode {
            Mode::Ephemeral => {
                if self.forced == Some(true) || self.firewalled {
                    return None;
                }
                let host = self.modal_host()?;
                let port = self.modal_port()?;
                if self.forced.is_none()
                    && now.saturating_duration_since(self.started) < self.adapt_after
                {
                    return None;
                }
                let addr = SocketAddrV4::new(host, port);
                let id = NodeId::for_endpoint(host, port);
                info!(%addr, %id, "public endpoint confirmed, turning persistent");
                self.mode = Mode::Persistent { id, addr };
                Some(Transition::Upgrade { id, addr })
            }
            Mode::Persistent { addr, .. } => {
                let current = SocketAddrV4::new(self.modal_host()?, self.modal_port()?);
                if current != *addr {
                    info!(was = %addr, now = %current, "public endpoint moved, dropping identity");
                    self.mode = Mode::Ephemeral;
                    self.reports.clear();
                    return Some(Transition::Downgrade(DowngradeReason::EndpointChanged));
                }
                None
            }
        }
    }

    fn modal_host(&self) -> Option<Ipv4Addr> {
        let mut counts: HashMap<Ipv4Addr, usize> = HashMap::new();
        for report in &self.reports {
            *counts.entry(*report.ip()).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n >= self.quorum)
            .max_by_key(|(_, n)| *n)
            .map(|(ip, _)| ip)
    }

    fn modal_port(&self) -> Option<u16> {
        let mut counts: HashMap<u16, usize> = HashMap::new();
        for report in &self.reports {
            *counts.entry(report.port()).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n >= self.quorum)
            .max_by_key(|(_, n)| *n)
            .map(|(port, _)| port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DhtConfig {
        DhtConfig {
            ephemeral: Some(false),
            firewalled: Some(false),
            report_quorum: 3,
            ..DhtConfig::default()
        }
    }

    fn report(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(80, 1, 1, last), port)
    }

    #[test]
    fn quorum_of_agreeing_reports_upgrades_a_forced_node() {
        let now = Instant::now();
        let mut identity = Identity::new(&config(), now);

        assert_eq!(identity.on_report(report(1, 9000), now), None);
        assert_eq!(identity.on_report(report(1, 9000), now), None);
        let transition = identity.on_report(report(1, 9000), now);

        let expected = NodeId::for_endpoint(Ipv4Addr::new(80, 1, 1, 1), 9000);
        assert_eq!(
            transition,
            Some(Transition::Upgrade {
                id: expected,
                addr: report(1, 9000)
            })
        );
        assert!(!identity.is_ephemeral());
        assert_eq!(identity.id(), Some(&expected));
    }

    #[test]
    fn disagreeing_ports_zero_the_public_port_and_block_upgrade() {
        let now = Instant::now();
        let mut identity = Identity::new(&config(), now);

        for port in [9000, 9001, 9002, 9003, 9004] {
            assert_eq!(identity.on_report(report(1, port), now), None);
        }
        assert!(identity.is_ephemeral());
        assert_eq!(identity.public_addr(), Some(report(1, 0)));
    }

    #[test]
    fn firewalled_nodes_never_upgrade() {
        let now = Instant::now();
        let mut identity = Identity::new(
            &DhtConfig {
                ephemeral: Some(false),
                firewalled: Some(true),
                report_quorum: 3,
                ..DhtConfig::default()
            },
            now,
        );

        for _ in 0..5 {
            assert_eq!(identity.on_report(report(1, 9000), now), None);
        }
        assert!(identity.is_ephemeral());

        // Reachability evidence unblocks the upgrade on the next report.
        identity.on_unsolicited_request();
        assert!(identity.on_report(report(1, 9000), now).is_some());
    }

    #[test]
    fn adaptive_nodes_wait_for_the_uptime_bar() {
        let start = Instant::now();
        let cfg = DhtConfig {
            ephemeral: None,
            firewalled: Some(false),
            report_quorum: 3,
            ..DhtConfig::default()
        };
        let mut identity = Identity::new(&cfg, start);

        for _ in 0..5 {
            assert_eq!(identity.on_report(report(1, 9000), start), None);
        }
        assert!(identity.is_ephemeral());

        let later = start + cfg.adapt_after + Duration::from_secs(1);
        assert!(matches!(
            identity.on_report(report(1, 9000), later),
            Some(Transition::Upgrade { .. })
        ));
    }

    #[test]
    fn endpoint_drift_downgrades() {
        let now = Instant::now();
        let mut identity = Identity::new(&config(), now);
        for _ in 0..3 {
            identity.on_report(report(1, 9000), now);
        }
        assert!(!identity.is_ephemeral());

        // The NAT rebinds: a new address takes over the window.
        let mut transition = None;
        for _ in 0..10 {
            transition = identity.on_report(report(2, 9100), now);
            if transition.is_some() {
                break;
            }
        }
        assert_eq!(
            transition,
            Some(Transition::Downgrade(DowngradeReason::EndpointChanged))
        );
        assert!(identity.is_ephemeral());
    }

    #[test]
    fn monotonic_jump_downgrades_and_flags_sleep() {
        let now = Instant::now();
        let cfg = config();
        let mut identity = Identity::new(&cfg, now);
        for _ in 0..3 {
            identity.on_report(report(1, 9000), now);
        }
        assert!(!identity.is_ephemeral());

        // Ticks on schedule stay quiet.
        let tick = now + cfg.heartbeat_interval;
        assert_eq!(identity.on_heartbeat(tick), Heartbeat::default());

        // One tick arrives late by more than the sleep threshold.
        let late = tick + cfg.heartbeat_interval + cfg.sleep_threshold + Duration::from_secs(1);
        let hb = identity.on_heartbeat(late);
        assert!(hb.slept);
        assert_eq!(
            hb.transition,
            Some(Transition::Downgrade(DowngradeReason::Slept))
        );
        assert!(identity.is_ephemeral());
    }
}
