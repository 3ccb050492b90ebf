//! K-bucket: up to K peers at one shared-prefix length, ordered from
//! least-recently-seen (front) to most-recently-seen (back).

use std::net::SocketAddrV4;
use std::time::Instant;

use crate::domain::peer::Peer;

/// A candidate parked while the bucket head is probed for liveness. The
/// candidate is admitted only if the head turns out dead; this keeps
/// long-lived peers in place against churn and flooding.
#[derive(Debug, Clone)]
pub(crate) struct PendingEviction {
    pub candidate: Peer,
    /// Endpoint of the head under probe.
    pub probing: SocketAddrV4,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct KBucket {
    peers: Vec<Peer>,
    pending: Option<PendingEviction>,
}

impl KBucket {
    pub fn is_full(&self, k: usize) -> bool {
        self.peers.len() >= k
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn get_mut(&mut self, addr: &SocketAddrV4) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| &p.addr == addr)
    }

    /// Least-recently-seen peer.
    pub fn head(&self) -> Option<&Peer> {
        self.peers.first()
    }

    pub fn push_back(&mut self, peer: Peer) {
        self.peers.push(peer);
    }

    pub fn remove(&mut self, addr: &SocketAddrV4) -> Option<Peer> {
        self.peers
            .iter()
            .position(|p| &p.addr == addr)
            .map(|pos| self.peers.remove(pos))
    }

    /// Refresh recency: move the peer to the most-recently-seen position.
    pub fn move_to_back(&mut self, addr: &SocketAddrV4, now: Instant) -> bool {
        match self.peers.iter().position(|p| &p.addr == addr) {
            Some(pos) => {
                let mut peer = self.peers.remove(pos);
                peer.seen(now);
                self.peers.push(peer);
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> Option<&PendingEviction> {
        self.pending.as_ref()
    }

    pub fn set_pending(&mut self, pending: PendingEviction) {
        self.pending = Some(pending);
    }

    pub fn take_pending(&mut self) -> Option<PendingEviction> {
        self.pending.take()
    }
}
