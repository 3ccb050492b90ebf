//! The routing table: 256 k-buckets indexed by shared-prefix length with
//! the local ID.
//!
//! The table owns the peer records; queries and callers get lightweight
//! copies. It never performs I/O itself — when an insertion needs a
//! liveness probe the table parks the candidate and reports the head to
//! probe, and the node actor calls back with the outcome.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::domain::id::{bucket_index, NodeId, ID_BITS};
use crate::domain::peer::Peer;

use super::bucket::{KBucket, PendingEviction};

/// Outcome of [`RoutingTable::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    /// Appended as most-recently-seen.
    Added,
    /// Already present; recency refreshed.
    Refreshed,
    /// Bucket full: the candidate was parked and the caller must probe
    /// `head`, then report via `probe_succeeded` / `probe_failed`.
    Probe { bucket: usize, head: SocketAddrV4 },
    /// Dropped (self, or bucket full with a probe already pending).
    Dropped,
}

#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<KBucket>,
    /// Endpoint → bucket index, so per-datagram refreshes avoid a scan.
    index: HashMap<SocketAddrV4, usize>,
    k: usize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            buckets: (0..ID_BITS).map(|_| KBucket::default()).collect(),
            index: HashMap::new(),
            k,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Admit or refresh a peer.
    ///
    /// An endpoint that shows up with a new ID is first removed from its
    /// old bucket, keeping every peer in exactly one bucket.
    pub fn insert(&mut self, id: NodeId, addr: SocketAddrV4, now: Instant) -> Insertion {
        if id == self.local_id {
            return Insertion::Dropped;
        }
        let bucket_idx = bucket_index(&self.local_id, &id);

        if let Some(&current) = self.index.get(&addr) {
            let same_id = self.buckets[current]
                .get_mut(&addr)
                .is_some_and(|p| p.id == id);
            if same_id {
                self.buckets[current].move_to_back(&addr, now);
                return Insertion::Refreshed;
            }
            self.buckets[current].remove(&addr);
            self.index.remove(&addr);
        }

        let bucket = &mut self.buckets[bucket_idx];
        if !bucket.is_full(self.k) {
            bucket.push_back(Peer::new(id, addr, now));
            self.index.insert(addr, bucket_idx);
            return Insertion::Added;
        }

        if bucket.pending().is_some() {
            return Insertion::Dropped;
        }
        let head = match bucket.head() {
            Some(peer) => peer.addr,
            None => return Insertion::Dropped,
        };
        bucket.set_pending(PendingEviction {
            candidate: Peer::new(id, addr, now),
            probing: head,
        });
        Insertion::Probe {
            bucket: bucket_idx,
            head,
        }
    }

    /// The probed head answered: keep it (refreshed) and drop the parked
    /// candidate.
    pub fn probe_succeeded(&mut self, bucket: usize, head: SocketAddrV4, now: Instant) {
        let Some(slot) = self.buckets.get_mut(bucket) else {
            return;
        };
        match slot.pending() {
            Some(pending) if pending.probing == head => {
                slot.take_pending();
                slot.move_to_back(&head, now);
            }
            _ => {}
        }
    }

    /// The probed head stayed silent: evict it and admit the candidate.
    pub fn probe_failed(&mut self, bucket: usize, head: SocketAddrV4) {
        let Some(slot) = self.buckets.get_mut(bucket) else {
            return;
        };
        match slot.pending() {
            Some(pending) if pending.probing == head => {}
            _ => return,
        }
        let Some(pending) = slot.take_pending() else {
            return;
        };
        slot.remove(&head);
        self.index.remove(&head);
        let addr = pending.candidate.addr;
        slot.push_back(pending.candidate);
        self.index.insert(addr, bucket);
    }

    /// Erase a peer; the bucket is left sparse.
    pub fn remove(&mut self, addr: &SocketAddrV4) -> Option<Peer> {
        let bucket = self.index.remove(addr)?;
        self.buckets[bucket].remove(addr)
    }

    pub fn contains(&self, addr: &SocketAddrV4) -> bool {
        self.index.contains_key(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddrV4) -> Option<&mut Peer> {
        let bucket = *self.index.get(addr)?;
        self.buckets[bucket].get_mut(addr)
    }

    /// Refresh recency for confirmed traffic from a known endpoint.
    pub fn touch(&mut self, addr: &SocketAddrV4, now: Instant) -> bool {
        match self.index.get(addr) {
            Some(&bucket) => self.buckets[bucket].move_to_back(addr, now),
            None => false,
        }
    }

    /// Up to `n` peers of minimal XOR distance to `target`, deterministic
    /// for a frozen table: ties break on `(host, port)` bytewise.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<Peer> {
        let mut peers: Vec<&Peer> = self.buckets.iter().flat_map(KBucket::peers).collect();
        peers.sort_unstable_by(|a, b| {
            a.id.distance(target)
                .cmp(&b.id.distance(target))
                .then_with(|| a.addr.ip().octets().cmp(&b.addr.ip().octets()))
                .then_with(|| a.addr.port().cmp(&b.addr.port()))
        });
        peers.into_iter().take(n).cloned().collect()
    }

    /// A random bucket index containing at least one peer not seen within
    /// `min_age`, for refresh lookups.
    pub fn random_aging_bucket(&self, now: Instant, min_age: Duration) -> Option<usize> {
        let aging: Vec<usize> = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.peers().iter().any(|p| p.is_stale(now, min_age)))
            .map(|(i, _)| i)
            .collect();
        if aging.is_empty() {
            return None;
        }
        Some(aging[rand::thread_rng().gen_range(0..aging.len())])
    }

    /// Endpoints silent for at least `stale_after`.
    pub fn stale_peers(&self, now: Instant, stale_after: Duration) -> Vec<SocketAddrV4> {
        self.buckets
            .iter()
            .flat_map(KBucket::peers)
            .filter(|p| p.is_stale(now, stale_after))
            .map(|p| p.addr)
            .collect()
    }

    pub fn to_vec(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(KBucket::peers)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn bucket(&self, index: usize) -> &KBucket {
        &self.buckets[index]
    }
}
