//! RPC transport: sockets, pending requests, timeouts.

mod socket;

pub(crate) use socket::{Pending, Purpose, RpcSocket};

use std::net::SocketAddrV4;

use crate::domain::id::NodeId;
use crate::domain::peer::NodeEntry;
use crate::domain::token::Token;

/// Which of the node's sockets an operation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketSel {
    #[default]
    Primary,
    /// The optional secondary socket (NAT probes, hole punching).
    Secondary,
}

/// A reply delivered to a waiting request or query.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Responder endpoint; always equals the request destination.
    pub from: SocketAddrV4,
    /// Responder's stable ID; absent for ephemeral responders.
    pub from_id: Option<NodeId>,
    /// Status byte; zero for success, see [`crate::status`].
    pub status: u8,
    /// Opaque payload.
    pub value: Option<Vec<u8>>,
    /// Round-trip token for follow-up mutating requests.
    pub token: Option<Token>,
    /// Responder's closest peers to the request target.
    pub nodes: Vec<NodeEntry>,
    /// Responder's view of our public endpoint.
    pub observed: Option<SocketAddrV4>,
}
