//! Error taxonomy.
//!
//! Local errors (this enum) never travel on the wire. Protocol-level
//! failures are carried as a non-zero `status` byte in reply frames and
//! resolve the request future with the reply itself.

use std::io;

use thiserror::Error;

/// Errors surfaced by node operations.
#[derive(Debug, Error)]
pub enum DhtError {
    /// The request (including any retry) ran out of time.
    #[error("request timed out")]
    Timeout,
    /// The node was destroyed while the operation was pending.
    #[error("node destroyed")]
    Destroyed,
    /// The per-socket in-flight request cap was reached.
    #[error("too many in-flight requests")]
    Overflow,
    /// A reply matched a pending transaction but was not addressed to us.
    #[error("invalid reply")]
    InvalidReply,
    /// The operation requires a completed bootstrap.
    #[error("node is not bootstrapped")]
    NotBootstrapped,
    /// Socket-level failure.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
}

/// Wire frame decoding failures. Frames failing to decode are dropped by
/// the RPC layer; the error only surfaces through logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame is shorter than its declared field set.
    #[error("frame truncated")]
    Truncated,
    /// Varint is malformed or does not fit in 64 bits.
    #[error("invalid varint")]
    Varint,
}

/// Reserved reply status codes. Values 3..16 are reserved for future
/// protocol use; application-defined codes start at [`status::APP_BASE`].
pub mod status {
    /// Success.
    pub const OK: u8 = 0;
    /// The receiver does not implement the requested command.
    pub const UNKNOWN_COMMAND: u8 = 1;
    /// The echoed round-trip token did not verify for the sender.
    pub const INVALID_TOKEN: u8 = 2;
    /// First status code available to applications.
    pub const APP_BASE: u8 = 16;
}
