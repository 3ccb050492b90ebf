//! Wire codec for RPC frames.
//!
//! A frame is a single datagram:
//!
//! ```text
//! version (u8 = 1)
//! flags   (u8)
//! tid     (u16 BE)
//! from_id  (32B, if flags.ID)
//! to_id    (32B, if flags.TO)
//! token    (32B, if flags.TOKEN)
//! target   (32B, if flags.TARGET)
//! command  (varint)
//! status   (u8)
//! value    (varint length + bytes, if flags.VALUE)
//! nodes    (varint count + 38B entries, if flags.NODES)
//! observed (6B endpoint, if flags.OBSERVED)
//! ```
//!
//! Frames shorter than their declared field set fail to decode; a frame
//! with an unknown version decodes to `None` and is dropped without
//! noise. Trailing bytes are ignored.

use std::net::SocketAddrV4;

use crate::domain::id::{NodeId, ID_BYTES};
use crate::domain::peer::{self, NodeEntry, ADDR_ENCODED_LEN, NODE_ENCODED_LEN};
use crate::domain::token::{Token, TOKEN_LEN};
use crate::error::DecodeError;


/// Current wire version.
pub const VERSION: u8 = 1;

/// Built-in command space. Application commands start at
/// [`commands::APP_BASE`]; lower values are reserved.
pub mod commands {
    /// Liveness probe; the reply's observed endpoint feeds NAT inference.
    pub const PING: u64 = 0;
    /// Like `PING`, but the reply goes to the port named in the request
    /// value, so a caller can exercise a second NAT mapping.
    pub const PING_NAT: u64 = 1;
    /// Closest-peer lookup toward `target`.
    pub const FIND_NODE: u64 = 2;
    /// Advisory that the endpoint in the request value looks dead.
    pub const DOWN_HINT: u64 = 3;
    /// First command available to applications.
    pub const APP_BASE: u64 = 16;
}

mod flags {
    pub const RESPONSE: u8 = 1 << 0;
    pub const ID: u8 = 1 << 1;
    pub const TO: u8 = 1 << 2;
    pub const TOKEN: u8 = 1 << 3;
    pub const TARGET: u8 = 1 << 4;
    pub const VALUE: u8 = 1 << 5;
    pub const NODES: u8 = 1 << 6;
    pub const OBSERVED: u8 = 1 << 7;
}

/// One decoded RPC frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    /// Reply flag; unset for requests.
    pub response: bool,
    /// Transaction ID matching replies to pending requests.
    pub tid: u16,
    /// Sender's stable ID; absent for ephemeral senders.
    pub from_id: Option<NodeId>,
    /// Addressee's ID as known to the sender; advisory.
    pub to_id: Option<NodeId>,
    /// Round-trip token: echoed in requests, freshly derived in replies.
    pub token: Option<Token>,
    /// Lookup target.
    pub target: Option<NodeId>,
    /// Command number; see [`commands`].
    pub command: u64,
    /// Reply status; zero in requests.
    pub status: u8,
    /// Opaque application payload.
    pub value: Option<Vec<u8>>,
    /// Responder's closest peers to `target` (replies only).
    pub nodes: Vec<NodeEntry>,
    /// In a reply: the responder's view of the requester's endpoint. In a
    /// request: the sender's view of the destination endpoint.
    pub observed: Option<SocketAddrV4>,
}

impl Frame {
    pub fn request(tid: u16, command: u64) -> Self {
        Self {
            tid,
            command,
            ..Self::default()
        }
    }

    pub fn reply(tid: u16, command: u64, status: u8) -> Self {
        Self {
            response: true,
            tid,
            command,
            status,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.response {
            flags |= flags::RESPONSE;
        }
        if self.from_id.is_some() {
            flags |= flags::ID;
        }
        if self.to_id.is_some() {
            flags |= flags::TO;
        }
        if self.token.is_some() {
            flags |= flags::TOKEN;
        }
        if self.target.is_some() {
            flags |= flags::TARGET;
        }
        if self.value.is_some() {
            flags |= flags::VALUE;
        }
        if !self.nodes.is_empty() {
            flags |= flags::NODES;
        }
        if self.observed.is_some() {
            flags |= flags::OBSERVED;
        }

        let mut out = Vec::with_capacity(64);
        out.push(VERSION);
        out.push(flags);
        out.extend_from_slice(&self.tid.to_be_bytes());
        for id in [&self.from_id, &self.to_id] {
            if let Some(id) = id {
                out.extend_from_slice(id.as_bytes());
            }
        }
        if let Some(token) = &self.token {
            out.extend_from_slice(token);
        }
        if let Some(target) = &self.target {
            out.extend_from_slice(target.as_bytes());
        }
        write_varint(&mut out, self.command);
        out.push(self.status);
        if let Some(value) = &self.value {
            write_varint(&mut out, value.len() as u64);
            out.extend_from_slice(value);
        }
        if !self.nodes.is_empty() {
            write_varint(&mut out, self.nodes.len() as u64);
            for node in &self.nodes {
                peer::encode_node(node, &mut out);
            }
        }
        if let Some(observed) = &self.observed {
            peer::encode_addr(observed, &mut out);
        }
        out
    }

    /// Decode one frame. `Ok(None)` means an unknown version, which the
    /// caller drops silently.
    pub fn decode(buf: &[u8]) -> Result<Option<Frame>, DecodeError> {
        let mut r = Reader::new(buf);
        if r.u8()? != VERSION {
            return Ok(None);
        }
        let flags = r.u8()?;
        let tid = u16::from_be_bytes([r.u8()?, r.u8()?]);

        let from_id = r.id_if(flags & flags::ID != 0)?;
        let to_id = r.id_if(flags & flags::TO != 0)?;
        let token = if flags & flags::TOKEN != 0 {
            let mut token = [0u8; TOKEN_LEN];
            token.copy_from_slice(r.bytes(TOKEN_LEN)?);
            Some(token)
        } else {
            None
        };
        let target = r.id_if(flags & flags::TARGET != 0)?;

        let command = r.varint()?;
        let status = r.u8()?;

        let value = if flags & flags::VALUE != 0 {
            let len = r.varint()? as usize;
            Some(r.bytes(len)?.to_vec())
        } else {
            None
        };

        let mut nodes = Vec::new();
        if flags & flags::NODES != 0 {
            let count = r.varint()? as usize;
            for _ in 0..count {
                let entry =
                    peer::decode_node(r.bytes(NODE_ENCODED_LEN)?).ok_or(DecodeError::Truncated)?;
                nodes.push(entry);
            }
        }

        let observed = if flags & flags::OBSERVED != 0 {
            Some(peer::decode_addr(r.bytes(ADDR_ENCODED_LEN)?).ok_or(DecodeError::Truncated)?)
        } else {
            None
        };

        Ok(Some(Frame {
            response: flags & flags::RESPONSE != 0,
            tid,
            from_id,
            to_id,
            token,
            target,
            command,
            status,
            value,
            nodes,
            observed,
        }))
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.buf.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn id_if(&mut self, present: bool) -> Result<Option<NodeId>, DecodeError> {
        if !present {
            return Ok(None);
        }
        let mut id = [0u8; ID_BYTES];
        id.copy_from_slice(self.bytes(ID_BYTES)?);
        Ok(Some(NodeId::new(id)))
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let mut out = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift == 63 && byte > 1 {
                return Err(DecodeError::Varint);
            }
            out |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(out);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::Varint);
            }
        }
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}
