//! Peer records and the compact endpoint encodings.
//!
//! The overlay is IPv4; v6 datagrams are ignored at the socket boundary.
//! Two peers are the same peer iff their `(host, port)` match — the ID is
//! advisory metadata that may change when a peer re-derives its identity.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use crate::domain::id::NodeId;

/// Encoded `(ipv4, port)` length.
pub const ADDR_ENCODED_LEN: usize = 6;

/// Encoded `(id, ipv4, port)` length.
pub const NODE_ENCODED_LEN: usize = 38;

const RTT_SAMPLES: usize = 4;

/// Wire-level view of a remote node: its claimed ID and endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

/// A peer as stored in the routing table.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    pub added: Instant,
    pub last_seen: Instant,
    pub last_pinged: Instant,
    rtt: RttRing,
}

impl Peer {
    pub fn new(id: NodeId, addr: SocketAddrV4, now: Instant) -> Self {
        Self {
            id,
            addr,
            added: now,
            last_seen: now,
            last_pinged: now,
            rtt: RttRing::default(),
        }
    }

    /// Confirmed traffic from this peer.
    pub fn seen(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn pinged(&mut self, now: Instant) {
        self.last_pinged = now;
    }

    pub fn record_rtt(&mut self, sample: Duration) {
        self.rtt.push(sample);
    }

    /// Mean of the recorded round-trip samples, if any.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt.mean()
    }

    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= stale_after
    }

    pub fn entry(&self) -> NodeEntry {
        NodeEntry {
            id: self.id,
            addr: self.addr,
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Peer {}

/// Small ring of round-trip samples.
#[derive(Debug, Clone, Default)]
struct RttRing {
    samples: [Duration; RTT_SAMPLES],
    len: usize,
    next: usize,
}

impl RttRing {
    fn push(&mut self, sample: Duration) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % RTT_SAMPLES;
        self.len = (self.len + 1).min(RTT_SAMPLES);
    }

    fn mean(&self) -> Option<Duration> {
        if self.len == 0 {
            return None;
        }
        let total: Duration = self.samples[..self.len].iter().sum();
        Some(total / self.len as u32)
    }
}

/// Append the 6-byte encoding of an endpoint.
pub fn encode_addr(addr: &SocketAddrV4, out: &mut Vec<u8>) {
    out.extend_from_slice(&addr.ip().octets());
    out.extend_from_slice(&addr.port().to_be_bytes());
}

/// Decode a 6-byte endpoint.
pub fn decode_addr(bytes: &[u8]) -> Option<SocketAddrV4> {
    if bytes.len() < ADDR_ENCODED_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Some(SocketAddrV4::new(ip, port))
}

/// Append the 38-byte encoding of a node entry.
pub fn encode_node(node: &NodeEntry, out: &mut Vec<u8>) {
    out.extend_from_slice(node.id.as_bytes());
    encode_addr(&node.addr, out);
}

/// Decode a 38-byte node entry.
pub fn decode_node(bytes: &[u8]) -> Option<NodeEntry> {
    if bytes.len() < NODE_ENCODED_LEN {
        return None;
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&bytes[..32]);
    let addr = decode_addr(&bytes[32..])?;
    Some(NodeEntry {
        id: NodeId::new(id),
        addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_are_equal_by_endpoint_only() {
        let now = Instant::now();
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000);
        let a = Peer::new(NodeId::random(), addr, now);
        let b = Peer::new(NodeId::random(), addr, now);
        assert_eq!(a, b);
    }

    #[test]
    fn addr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), 50_000);
        let mut buf = Vec::new();
        encode_addr(&addr, &mut buf);
        assert_eq!(buf.len(), ADDR_ENCODED_LEN);
        assert_eq!(decode_addr(&buf), Some(addr));
    }

    #[test]
    fn node_round_trip() {
        let node = NodeEntry {
            id: NodeId::random(),
            addr: SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 9),
        };
        let mut buf = Vec::new();
        encode_node(&node, &mut buf);
        assert_eq!(buf.len(), NODE_ENCODED_LEN);
        assert_eq!(decode_node(&buf), Some(node));
    }

    #[test]
    fn rtt_ring_keeps_a_bounded_mean() {
        let mut ring = RttRing::default();
        assert_eq!(ring.mean(), None);
        for ms in [10, 20, 30, 40, 50, 60] {
            ring.push(Duration::from_millis(ms));
        }
        // Only the last four samples survive.
        assert_eq!(ring.mean(), Some(Duration::from_millis(45)));
    }
}
