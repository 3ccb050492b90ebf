//! Round-trip tokens.
//!
//! A token proves the bearer received a datagram at the claimed endpoint;
//! it is an HMAC over the endpoint under a per-node secret, so it carries
//! no confidentiality and no identity beyond endpoint possession. Two
//! secrets are live at any time: validating against the previous secret
//! keeps tokens usable across a rotation, giving each a lifetime between
//! one and two rotation periods.

use std::net::SocketAddrV4;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Token width.
pub const TOKEN_LEN: usize = 32;

/// Opaque round-trip token.
pub type Token = [u8; TOKEN_LEN];

type Secret = [u8; 32];

/// Per-node token state. Rotation is driven by the node's timer wheel.
#[derive(Debug)]
pub struct TokenManager {
    current: Secret,
    previous: Secret,
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            current: fresh_secret(),
            previous: fresh_secret(),
        }
    }

    /// Shift the current secret down and draw a fresh one.
    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = fresh_secret();
    }

    /// Token for `addr` under the current secret.
    pub fn derive(&self, addr: &SocketAddrV4) -> Token {
        mac(&self.current, addr)
    }

    /// Whether `token` was derived for `addr` under either live secret.
    pub fn verify(&self, token: &[u8], addr: &SocketAddrV4) -> bool {
        keyed(&self.current, addr).verify_slice(token).is_ok()
            || keyed(&self.previous, addr).verify_slice(token).is_ok()
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn fresh_secret() -> Secret {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

fn keyed(secret: &Secret, addr: &SocketAddrV4) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&addr.ip().octets());
    mac.update(&addr.port().to_be_bytes());
    mac
}

fn mac(secret: &Secret, addr: &SocketAddrV4) -> Token {
    keyed(secret, addr).finalize().into_bytes().into()
}
