//! One UDP socket plus its request-response bookkeeping.
//!
//! Transaction IDs wrap through the `u16` space, skipping values still in
//! flight, so pending tids stay pairwise distinct per socket. The pending
//! table stores the encoded frame so a retry resends identical bytes under
//! the same tid.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::DhtError;

use super::Reply;

/// Where a pending request's outcome is routed.
#[derive(Debug)]
pub(crate) enum Purpose {
    /// A caller awaiting `Dht::request` / `ping`.
    External(oneshot::Sender<Result<Reply, DhtError>>),
    /// Part of an iterative query.
    Query(u64),
    /// Liveness probe of a bucket head with a parked candidate.
    EvictionProbe { bucket: usize, head: SocketAddrV4 },
    /// Staleness probe; a timeout evicts the destination.
    StaleProbe,
    /// Outcome only feeds passive state (identity reports, table refresh).
    FireAndForget,
}

#[derive(Debug)]
pub(crate) struct Pending {
    pub dest: SocketAddrV4,
    /// Encoded frame, kept for retries.
    pub payload: Vec<u8>,
    pub deadline: Instant,
    pub retries_left: u8,
    pub sent_at: Instant,
    pub purpose: Purpose,
}

#[derive(Debug)]
pub(crate) struct RpcSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddrV4,
    next_tid: u16,
    pending: HashMap<u16, Pending>,
}

impl RpcSocket {
    pub async fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        Self::from_socket(socket)
    }

    /// Wrap a socket the caller bound themselves.
    pub fn from_socket(socket: UdpSocket) -> io::Result<Self> {
        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("expected an IPv4 bind, got {addr}"),
                ))
            }
        };
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            next_tid: rand::random(),
            pending: HashMap::new(),
        })
    }

    pub fn handle(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Next free transaction ID. The in-flight cap is far below the tid
    /// space, so the scan terminates.
    pub fn alloc_tid(&mut self) -> u16 {
        loop {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1);
            if !self.pending.contains_key(&tid) {
                return tid;
            }
        }
    }

    pub fn insert_pending(&mut self, tid: u16, pending: Pending) {
        let replaced = self.pending.insert(tid, pending);
        debug_assert!(replaced.is_none(), "tid {tid} reused while pending");
    }

    pub fn pending_mut(&mut self, tid: u16) -> Option<&mut Pending> {
        self.pending.get_mut(&tid)
    }

    pub fn remove_pending(&mut self, tid: u16) -> Option<Pending> {
        self.pending.remove(&tid)
    }

    /// Resolve a reply: the tid must be pending and the datagram origin
    /// must match the recorded destination, otherwise the frame is left
    /// for the caller to drop.
    pub fn match_reply(&mut self, tid: u16, from: SocketAddrV4) -> Option<Pending> {
        match self.pending.get(&tid) {
            Some(pending) if pending.dest == from => self.pending.remove(&tid),
            Some(pending) => {
                trace!(
                    tid,
                    %from,
                    expected = %pending.dest,
                    "reply origin mismatch, dropping"
                );
                None
            }
            None => None,
        }
    }

    pub async fn send(&self, to: SocketAddrV4, bytes: &[u8]) -> io::Result<()> {
        self.socket.send_to(bytes, SocketAddr::V4(to)).await?;
        Ok(())
    }

    /// Fail every pending request and drain the table (node teardown).
    pub fn drain(&mut self) -> Vec<Pending> {
        self.pending.drain().map(|(_, p)| p).collect()
    }
}
