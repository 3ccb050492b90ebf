//! Node identifiers and the XOR metric.
//!
//! A persistent node's ID is `SHA-256(public_ip || public_port)`, which
//! ties table membership to a verified endpoint. Ephemeral nodes carry no
//! stable ID and never advertise one.

use std::fmt;
use std::net::Ipv4Addr;

use rand::Rng;
use sha2::{Digest, Sha256};

/// ID width in bytes.
pub const ID_BYTES: usize = 32;

/// ID width in bits; also the number of routing-table buckets.
pub const ID_BITS: usize = ID_BYTES * 8;

/// 256-bit node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    pub const fn new(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Derive the stable ID owned by a public endpoint.
    pub fn for_endpoint(ip: Ipv4Addr, port: u16) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ip.octets());
        hasher.update(port.to_be_bytes());
        Self(hasher.finalize().into())
    }

    /// Uniformly random ID (bootstrap targets, ephemeral lookups).
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub const fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// XOR distance to `other`; compares as a 256-bit big-endian integer.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Number of leading bits shared with `other`, in `0..=256`.
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        for i in 0..ID_BYTES {
            let xor = self.0[i] ^ other.0[i];
            if xor != 0 {
                return i * 8 + xor.leading_zeros() as usize;
            }
        }
        ID_BITS
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; ID_BYTES]> for NodeId {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }
}

/// XOR distance between two IDs. Derived ordering on the big-endian byte
/// array is the numeric ordering; smaller is closer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_BYTES]);

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

/// Bucket index of `id` relative to `local`: the shared-prefix length,
/// clamped into the valid bucket range for the (never stored) case of a
/// peer claiming our own ID.
pub fn bucket_index(local: &NodeId, id: &NodeId) -> usize {
    local.common_prefix_len(id).min(ID_BITS - 1)
}

/// Random ID whose shared-prefix length with `local` is exactly `index`:
/// the first `index` bits are copied, bit `index` is inverted, the rest is
/// random. Used to aim refresh lookups at a specific bucket.
pub fn random_id_in_bucket(local: &NodeId, index: usize) -> NodeId {
    debug_assert!(index < ID_BITS);
    let mut bytes: [u8; ID_BYTES] = rand::thread_rng().gen();
    let byte = index / 8;
    let bit = index % 8;

    bytes[..byte].copy_from_slice(&local.as_bytes()[..byte]);
    let keep = if bit == 0 { 0 } else { !0u8 << (8 - bit) };
    bytes[byte] = (local.as_bytes()[byte] & keep) | (bytes[byte] & !keep);

    let flip = 0x80u8 >> bit;
    bytes[byte] ^= (bytes[byte] ^ !local.as_bytes()[byte]) & flip;

    NodeId(bytes)
}
