//! The DHT node: a public handle plus the actor task owning every piece
//! of mutable state.
//!
//! All mutations of the routing table, pending-request tables, query
//! state, token secrets, and the identity machine happen inside one actor
//! task, which multiplexes the command channel, the sockets, and the
//! timer wheel in a single `select!` loop. Handles talk to the actor over
//! an unbounded command channel; readable properties are published
//! through a `watch` snapshot so property reads never round-trip.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::Stream;
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::domain::id::{random_id_in_bucket, NodeId};
use crate::domain::peer::{self, NodeEntry};
use crate::domain::routing_table::{Insertion, RoutingTable};
use crate::domain::token::{Token, TokenManager};
use crate::error::{status, DhtError};
use crate::identity::{Identity, Transition};
use crate::query::{Query, QueryAction, QueryOptions, QueryResult, QuerySpec, QueryState};
use crate::rpc::{Pending, Purpose, Reply, RpcSocket, SocketSel};
use crate::time::{Clock, SystemClock};
use crate::wire::{commands, Frame};

/// Recent responders remembered while ephemeral, used to seed the routing
/// table on upgrade and queries before a table exists.
const KNOWN_PEERS_CAP: usize = 32;

/// Lifecycle and traffic events of one node. One consumer per node.
#[derive(Debug)]
pub enum DhtEvent {
    /// The primary socket is bound.
    Listening(SocketAddrV4),
    /// The initial bootstrap lookup converged.
    Bootstrap,
    /// The node is ready for use.
    Ready,
    /// The node confirmed its public endpoint and turned persistent.
    Persistent,
    /// A suspend/resume cycle was detected.
    WakeUp,
    /// An application-command request; reply or drop it.
    Request(InboundRequest),
}

/// Stream of [`DhtEvent`]s.
#[derive(Debug)]
pub struct DhtEvents {
    rx: mpsc::UnboundedReceiver<DhtEvent>,
}

impl DhtEvents {
    /// Next event; `None` once the node is destroyed.
    pub async fn recv(&mut self) -> Option<DhtEvent> {
        self.rx.recv().await
    }
}

impl Stream for DhtEvents {
    type Item = DhtEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// An inbound application-command request. Consuming it with
/// [`InboundRequest::reply`] or [`InboundRequest::error`] sends the reply;
/// dropping it leaves the requester to time out.
#[derive(Debug)]
pub struct InboundRequest {
    pub from: SocketAddrV4,
    pub command: u64,
    pub target: Option<NodeId>,
    pub value: Option<Vec<u8>>,
    /// Whether the echoed round-trip token verified for the sender. Check
    /// this before mutating state on behalf of the request.
    pub token_ok: bool,
    tid: u16,
    socket: SocketSel,
    requester_id: Option<NodeId>,
    responder: mpsc::UnboundedSender<NodeCommand>,
}

impl InboundRequest {
    pub fn reply(self, value: Option<Vec<u8>>) {
        self.respond(status::OK, value);
    }

    pub fn error(self, code: u8) {
        self.respond(code, None);
    }

    fn respond(self, status: u8, value: Option<Vec<u8>>) {
        let _ = self.responder.send(NodeCommand::Respond {
            socket: self.socket,
            to: self.from,
            requester_id: self.requester_id,
            tid: self.tid,
            command: self.command,
            status,
            value,
            target: self.target,
        });
    }
}

/// Request payload for [`Dht::request`].
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub command: u64,
    pub target: Option<NodeId>,
    pub value: Option<Vec<u8>>,
    /// Round-trip token previously echoed by the destination.
    pub token: Option<Token>,
}

impl OutboundRequest {
    pub fn new(command: u64) -> Self {
        Self {
            command,
            target: None,
            value: None,
            token: None,
        }
    }
}

/// Options for [`Dht::request`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Retry once on timeout (pings always retry).
    pub retry: bool,
    /// Socket to send from.
    pub socket: SocketSel,
}

/// Snapshot of a node's externally readable state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: Option<NodeId>,
    pub ephemeral: bool,
    pub firewalled: bool,
    pub local_addr: SocketAddrV4,
    pub public_addr: Option<SocketAddrV4>,
    pub bootstrapped: bool,
    pub destroyed: bool,
}

#[derive(Debug)]
pub(crate) enum NodeCommand {
    Request {
        to: SocketAddrV4,
        request: OutboundRequest,
        retry: bool,
        socket: SocketSel,
        tx: oneshot::Sender<Result<Reply, DhtError>>,
    },
    PingNat {
        to: SocketAddrV4,
        tx: oneshot::Sender<Result<Reply, DhtError>>,
    },
    StartQuery {
        id: u64,
        spec: QuerySpec,
        opts: QueryOptions,
        stream: mpsc::UnboundedSender<Reply>,
        finished: oneshot::Sender<QueryResult>,
    },
    CancelQuery(u64),
    Respond {
        socket: SocketSel,
        to: SocketAddrV4,
        requester_id: Option<NodeId>,
        tid: u16,
        command: u64,
        status: u8,
        value: Option<Vec<u8>>,
        target: Option<NodeId>,
    },
    AddNode {
        addr: SocketAddrV4,
    },
    ToArray {
        tx: oneshot::Sender<Vec<NodeEntry>>,
    },
    Refresh,
    Destroy {
        tx: oneshot::Sender<()>,
    },
}

/// Handle to a running DHT node. Cheap to clone; the node lives until
/// [`Dht::destroy`] or until every handle is dropped.
#[derive(Debug, Clone)]
pub struct Dht {
    commands: mpsc::UnboundedSender<NodeCommand>,
    status: watch::Receiver<NodeStatus>,
    next_query_id: Arc<AtomicU64>,
}

impl Dht {
    /// Bind the sockets and spawn the node actor.
    pub async fn bind(config: DhtConfig) -> Result<(Dht, DhtEvents), DhtError> {
        Self::bind_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Run the node on a socket the caller already bound, instead of
    /// binding one from `config.bind`.
    pub async fn with_socket(
        config: DhtConfig,
        socket: tokio::net::UdpSocket,
    ) -> Result<(Dht, DhtEvents), DhtError> {
        let primary = RpcSocket::from_socket(socket)?;
        Self::start(config, Arc::new(SystemClock), primary).await
    }

    /// Like [`Dht::bind`] with an injected monotonic clock, so tests can
    /// simulate suspend/resume.
    pub async fn bind_with_clock(
        config: DhtConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(Dht, DhtEvents), DhtError> {
        let primary = RpcSocket::bind(config.bind).await?;
        Self::start(config, clock, primary).await
    }

    async fn start(
        config: DhtConfig,
        clock: Arc<dyn Clock>,
        primary: RpcSocket,
    ) -> Result<(Dht, DhtEvents), DhtError> {
        let secondary = match config.secondary_bind {
            Some(port) => Some(RpcSocket::bind(port).await?),
            None => None,
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(NodeStatus {
            id: None,
            ephemeral: true,
            firewalled: config.firewalled.unwrap_or(true),
            local_addr: primary.local_addr(),
            public_addr: None,
            bootstrapped: false,
            destroyed: false,
        });
        let next_query_id = Arc::new(AtomicU64::new(1));

        let now = clock.now();
        let actor = NodeActor {
            identity: Identity::new(&config, now),
            bootstrap: config.bootstrap.clone(),
            cfg: config,
            clock,
            primary,
            secondary,
            commands: command_rx,
            command_tx: command_tx.clone(),
            events: event_tx,
            status: status_tx,
            tokens: TokenManager::new(),
            table: None,
            queries: HashMap::new(),
            next_query_id: Arc::clone(&next_query_id),
            timers: BinaryHeap::new(),
            known: VecDeque::new(),
            recently_contacted: HashMap::new(),
            bootstrapped: false,
            bootstrap_query: None,
            report_probe_idx: 0,
            destroyed: false,
        };
        tokio::spawn(actor.run());

        Ok((
            Dht {
                commands: command_tx,
                status: status_rx,
                next_query_id,
            },
            DhtEvents { rx: event_rx },
        ))
    }

    /// Resolves once the initial bootstrap lookup has converged.
    pub async fn ready(&self) -> Result<(), DhtError> {
        let mut status = self.status.clone();
        loop {
            {
                let snapshot = status.borrow();
                if snapshot.destroyed {
                    return Err(DhtError::Destroyed);
                }
                if snapshot.bootstrapped {
                    return Ok(());
                }
            }
            if status.changed().await.is_err() {
                return Err(DhtError::Destroyed);
            }
        }
    }

    /// Send one request and await the matching reply. Protocol failures
    /// resolve to a reply with a non-zero status; transport failures
    /// resolve to an error.
    pub async fn request(
        &self,
        request: OutboundRequest,
        to: SocketAddrV4,
        opts: RequestOptions,
    ) -> Result<Reply, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::Request {
                to,
                request,
                retry: opts.retry,
                socket: opts.socket,
                tx,
            })
            .map_err(|_| DhtError::Destroyed)?;
        rx.await.map_err(|_| DhtError::Destroyed)?
    }

    /// Liveness probe; always retried once.
    pub async fn ping(&self, to: SocketAddrV4) -> Result<Reply, DhtError> {
        self.request(
            OutboundRequest::new(commands::PING),
            to,
            RequestOptions::default(),
        )
        .await
    }

    /// Ask `to` to answer at the secondary socket, exercising a second
    /// NAT mapping. Requires a secondary socket.
    pub async fn ping_nat(&self, to: SocketAddrV4) -> Result<Reply, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::PingNat { to, tx })
            .map_err(|_| DhtError::Destroyed)?;
        rx.await.map_err(|_| DhtError::Destroyed)?
    }

    /// Start an iterative query toward `spec.target`.
    pub fn query(&self, spec: QuerySpec, opts: QueryOptions) -> Query {
        let id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = oneshot::channel();
        let _ = self.commands.send(NodeCommand::StartQuery {
            id,
            spec,
            opts,
            stream: stream_tx,
            finished: finished_tx,
        });
        Query {
            id,
            commands: self.commands.clone(),
            replies: stream_rx,
            finished_rx: Some(finished_rx),
            result: None,
        }
    }

    /// Closest-peer lookup toward `target`.
    pub fn find_node(&self, target: NodeId) -> Query {
        self.query(
            QuerySpec {
                target,
                command: commands::FIND_NODE,
                value: None,
            },
            QueryOptions::default(),
        )
    }

    /// Ping `addr` and admit it into the routing table on a round-trip.
    pub fn add_node(&self, addr: SocketAddrV4) {
        let _ = self.commands.send(NodeCommand::AddNode { addr });
    }

    /// Every peer currently in the routing table.
    pub async fn to_array(&self) -> Result<Vec<NodeEntry>, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::ToArray { tx })
            .map_err(|_| DhtError::Destroyed)?;
        rx.await.map_err(|_| DhtError::Destroyed)
    }

    /// Trigger a routing-table refresh lookup now.
    pub fn refresh(&self) {
        let _ = self.commands.send(NodeCommand::Refresh);
    }

    /// Tear the node down: every pending operation fails with
    /// [`DhtError::Destroyed`], sockets close, new operations are
    /// rejected.
    pub async fn destroy(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(NodeCommand::Destroy { tx }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn id(&self) -> Option<NodeId> {
        self.status.borrow().id
    }

    pub fn ephemeral(&self) -> bool {
        self.status.borrow().ephemeral
    }

    pub fn firewalled(&self) -> bool {
        self.status.borrow().firewalled
    }

    /// Local bound address of the primary socket.
    pub fn address(&self) -> SocketAddrV4 {
        self.status.borrow().local_addr
    }

    /// Best current guess of the public endpoint.
    pub fn public_address(&self) -> Option<SocketAddrV4> {
        self.status.borrow().public_addr
    }

    pub fn destroyed(&self) -> bool {
        self.status.borrow().destroyed
    }

    /// Full snapshot of the readable properties.
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }
}

/// Reply routing context captured from an inbound request.
struct ReplyTo {
    socket: SocketSel,
    /// Where the reply datagram goes (differs from `origin` for PING_NAT).
    addr: SocketAddrV4,
    /// Datagram origin of the request; tokens and observed endpoints are
    /// derived for it.
    origin: SocketAddrV4,
    requester_id: Option<NodeId>,
    tid: u16,
    command: u64,
}

enum Due {
    Retry {
        dest: SocketAddrV4,
        payload: Vec<u8>,
        deadline: Instant,
    },
    Expire,
}

struct NodeActor {
    cfg: DhtConfig,
    clock: Arc<dyn Clock>,
    primary: RpcSocket,
    secondary: Option<RpcSocket>,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    command_tx: mpsc::UnboundedSender<NodeCommand>,
    events: mpsc::UnboundedSender<DhtEvent>,
    status: watch::Sender<NodeStatus>,
    tokens: TokenManager,
    identity: Identity,
    table: Option<RoutingTable>,
    queries: HashMap<u64, QueryState>,
    next_query_id: Arc<AtomicU64>,
    /// Request deadlines: `(deadline, socket, tid)`. Entries are lazily
    /// invalidated against the pending tables.
    timers: BinaryHeap<Reverse<(Instant, u8, u16)>>,
    bootstrap: Vec<SocketAddrV4>,
    known: VecDeque<NodeEntry>,
    /// Outbound destinations with timestamps, for classifying inbound
    /// requests as unsolicited.
    recently_contacted: HashMap<SocketAddrV4, Instant>,
    bootstrapped: bool,
    bootstrap_query: Option<u64>,
    report_probe_idx: usize,
    destroyed: bool,
}

fn socket_tag(socket: SocketSel) -> u8 {
    match socket {
        SocketSel::Primary => 0,
        SocketSel::Secondary => 1,
    }
}

fn socket_from_tag(tag: u8) -> SocketSel {
    if tag == 0 {
        SocketSel::Primary
    } else {
        SocketSel::Secondary
    }
}

impl NodeActor {
    async fn run(mut self) {
        let _ = self
            .events
            .send(DhtEvent::Listening(self.primary.local_addr()));
        info!(addr = %self.primary.local_addr(), "node listening");
        self.start_bootstrap().await;

        let start = tokio::time::Instant::now();
        let mut rotate =
            tokio::time::interval_at(start + self.cfg.secret_rotation, self.cfg.secret_rotation);
        let mut maintenance =
            tokio::time::interval_at(start + self.cfg.refresh_interval, self.cfg.refresh_interval);
        let mut heartbeat = tokio::time::interval_at(
            start + self.cfg.heartbeat_interval,
            self.cfg.heartbeat_interval,
        );

        let mut pbuf = vec![0u8; 65_535];
        let mut sbuf = vec![0u8; 65_535];

        while !self.destroyed {
            let deadline = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let primary = self.primary.handle();
            let secondary = self.secondary.as_ref().map(RpcSocket::handle);

            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => self.shutdown(None),
                },
                res = primary.recv_from(&mut pbuf) => match res {
                    Ok((len, from)) => {
                        self.on_datagram(SocketSel::Primary, from, &pbuf[..len]).await;
                    }
                    Err(err) => warn!(%err, "primary socket receive failed"),
                },
                res = async {
                    secondary.as_ref().expect("branch disabled when absent").recv_from(&mut sbuf).await
                }, if secondary.is_some() => match res {
                    Ok((len, from)) => {
                        self.on_datagram(SocketSel::Secondary, from, &sbuf[..len]).await;
                    }
                    Err(err) => warn!(%err, "secondary socket receive failed"),
                },
                _ = tokio::time::sleep_until(deadline.into()) => self.on_deadline().await,
                _ = rotate.tick() => self.tokens.rotate(),
                _ = maintenance.tick() => self.on_maintenance().await,
                _ = heartbeat.tick() => self.on_heartbeat().await,
            }
        }
    }

    fn socket_ref(&self, socket: SocketSel) -> &RpcSocket {
        match socket {
            SocketSel::Primary => &self.primary,
            SocketSel::Secondary => self.secondary.as_ref().unwrap_or(&self.primary),
        }
    }

    fn socket_mut(&mut self, socket: SocketSel) -> &mut RpcSocket {
        match socket {
            SocketSel::Primary => &mut self.primary,
            SocketSel::Secondary => match self.secondary.as_mut() {
                Some(sock) => sock,
                None => &mut self.primary,
            },
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((at, _, _))| *at)
    }

    fn update_status(&mut self) {
        self.status.send_replace(NodeStatus {
            id: self.identity.id().copied(),
            ephemeral: self.identity.is_ephemeral(),
            firewalled: self.identity.firewalled(),
            local_addr: self.primary.local_addr(),
            public_addr: self.identity.public_addr(),
            bootstrapped: self.bootstrapped,
            destroyed: self.destroyed,
        });
    }

    async fn on_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Request {
                to,
                request,
                retry,
                socket,
                tx,
            } => {
                let retries = if retry || request.command == commands::PING {
                    1
                } else {
                    0
                };
                self.send_request(
                    socket,
                    to,
                    Outgoing {
                        command: request.command,
                        target: request.target,
                        value: request.value,
                        token: request.token,
                        to_id: None,
                    },
                    self.cfg.request_timeout,
                    retries,
                    Purpose::External(tx),
                )
                .await;
            }
            NodeCommand::PingNat { to, tx } => self.send_ping_nat(to, tx).await,
            NodeCommand::StartQuery {
                id,
                spec,
                opts,
                stream,
                finished,
            } => {
                self.start_query(id, spec, opts, stream, Some(finished))
                    .await;
            }
            NodeCommand::CancelQuery(id) => {
                if let Some(mut query) = self.queries.remove(&id) {
                    query.cancel();
                    debug!(query = id, "query cancelled");
                }
            }
            NodeCommand::Respond {
                socket,
                to,
                requester_id,
                tid,
                command,
                status,
                value,
                target,
            } => {
                self.send_reply(
                    ReplyTo {
                        socket,
                        addr: to,
                        origin: to,
                        requester_id,
                        tid,
                        command,
                    },
                    status,
                    value,
                    target.as_ref(),
                )
                .await;
            }
            NodeCommand::AddNode { addr } => {
                self.send_request(
                    SocketSel::Primary,
                    addr,
                    Outgoing::command(commands::PING),
                    self.cfg.request_timeout,
                    1,
                    Purpose::FireAndForget,
                )
                .await;
            }
            NodeCommand::ToArray { tx } => {
                let entries = self
                    .table
                    .as_ref()
                    .map(|t| t.to_vec().iter().map(|p| p.entry()).collect())
                    .unwrap_or_default();
                let _ = tx.send(entries);
            }
            NodeCommand::Refresh => self.refresh_table().await,
            NodeCommand::Destroy { tx } => self.shutdown(Some(tx)),
        }
    }

    async fn send_request(
        &mut self,
        socket: SocketSel,
        to: SocketAddrV4,
        outgoing: Outgoing,
        timeout: Duration,
        retries: u8,
        purpose: Purpose,
    ) {
        if self.socket_ref(socket).pending_len() >= self.cfg.max_inflight {
            if let Purpose::External(tx) = purpose {
                let _ = tx.send(Err(DhtError::Overflow));
            }
            return;
        }
        let from_id = self.identity.id().copied();
        let tid = self.socket_mut(socket).alloc_tid();

        let mut frame = Frame::request(tid, outgoing.command);
        frame.from_id = from_id;
        frame.to_id = outgoing.to_id;
        frame.token = outgoing.token;
        frame.target = outgoing.target;
        frame.value = outgoing.value;
        frame.observed = Some(to);
        let payload = frame.encode();

        let now = Instant::now();
        let purpose = match self.socket_ref(socket).send(to, &payload).await {
            Ok(()) => purpose,
            Err(err) => {
                warn!(%err, %to, "request send failed");
                match purpose {
                    Purpose::External(tx) => {
                        let _ = tx.send(Err(DhtError::Socket(err)));
                        return;
                    }
                    // Other purposes fall through: the armed timer fails
                    // them through the regular timeout path.
                    other => other,
                }
            }
        };

        let deadline = now + timeout;
        self.socket_mut(socket).insert_pending(
            tid,
            Pending {
                dest: to,
                payload,
                deadline,
                retries_left: retries,
                sent_at: now,
                purpose,
            },
        );
        self.timers
            .push(Reverse((deadline, socket_tag(socket), tid)));
        self.recently_contacted.insert(to, now);
    }

    /// Route the outcome of a resolved (timed out or misaddressed)
    /// pending request.
    async fn fail_resolved(&mut self, purpose: Purpose, dest: SocketAddrV4, err: DhtError) {
        match purpose {
            Purpose::External(tx) => {
                let _ = tx.send(Err(err));
            }
            Purpose::Query(qid) => {
                if let Some(query) = self.queries.get_mut(&qid) {
                    let actions = query.on_failure(dest);
                    self.process_query_actions(qid, actions).await;
                }
            }
            Purpose::EvictionProbe { bucket, head } => {
                if let Some(table) = &mut self.table {
                    table.probe_failed(bucket, head);
                    debug!(%head, bucket, "bucket head silent, candidate admitted");
                }
            }
            Purpose::StaleProbe => {
                if let Some(table) = &mut self.table {
                    if table.remove(&dest).is_some() {
                        debug!(%dest, "evicted silent peer");
                    }
                }
            }
            Purpose::FireAndForget => {}
        }
    }

    async fn send_ping_nat(
        &mut self,
        to: SocketAddrV4,
        tx: oneshot::Sender<Result<Reply, DhtError>>,
    ) {
        let Some(secondary) = self.secondary.as_mut() else {
            let _ = tx.send(Err(DhtError::Socket(io::Error::new(
                io::ErrorKind::Unsupported,
                "ping_nat requires a secondary socket",
            ))));
            return;
        };
        if secondary.pending_len() >= self.cfg.max_inflight {
            let _ = tx.send(Err(DhtError::Overflow));
            return;
        }
        // The reply is addressed at the secondary socket, so the pending
        // entry lives there even though the request leaves the primary.
        let tid = secondary.alloc_tid();
        let reply_port = secondary.local_addr().port();

        let mut frame = Frame::request(tid, commands::PING_NAT);
        frame.from_id = self.identity.id().copied();
        frame.value = Some(reply_port.to_be_bytes().to_vec());
        frame.observed = Some(to);
        let payload = frame.encode();

        let now = Instant::now();
        if let Err(err) = self.primary.send(to, &payload).await {
            let _ = tx.send(Err(DhtError::Socket(err)));
            return;
        }
        let deadline = now + self.cfg.request_timeout;
        self.socket_mut(SocketSel::Secondary).insert_pending(
            tid,
            Pending {
                dest: to,
                payload,
                deadline,
                retries_left: 0,
                sent_at: now,
                purpose: Purpose::External(tx),
            },
        );
        self.timers
            .push(Reverse((deadline, socket_tag(SocketSel::Secondary), tid)));
        self.recently_contacted.insert(to, now);
    }

    async fn on_datagram(&mut self, socket: SocketSel, from: SocketAddr, bytes: &[u8]) {
        let SocketAddr::V4(from) = from else {
            return;
        };
        let frame = match Frame::decode(bytes) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                trace!(%err, %from, "dropping undecodable datagram");
                return;
            }
        };
        if frame.response {
            self.on_reply(socket, from, frame).await;
        } else {
            self.on_request(socket, from, frame).await;
        }
    }

    async fn on_reply(&mut self, socket: SocketSel, from: SocketAddrV4, frame: Frame) {
        let Some(pending) = self.socket_mut(socket).match_reply(frame.tid, from) else {
            trace!(tid = frame.tid, %from, "unmatched reply dropped");
            return;
        };
        let now = Instant::now();
        let rtt = now.saturating_duration_since(pending.sent_at);

        if let Some(observed) = frame.observed {
            self.apply_report(observed).await;
        }

        if let (Some(to_id), Some(our_id)) = (frame.to_id, self.identity.id()) {
            if &to_id != our_id {
                self.fail_resolved(pending.purpose, from, DhtError::InvalidReply)
                    .await;
                return;
            }
        }

        match frame.from_id {
            Some(id) => self.admit_peer(id, from, now, Some(rtt)).await,
            None => {
                if let Some(table) = &mut self.table {
                    table.touch(&from, now);
                }
            }
        }

        let reply = Reply {
            from,
            from_id: frame.from_id,
            status: frame.status,
            value: frame.value,
            token: frame.token,
            nodes: frame.nodes,
            observed: frame.observed,
        };

        match pending.purpose {
            Purpose::External(tx) => {
                let _ = tx.send(Ok(reply));
            }
            Purpose::Query(qid) => {
                if let Some(query) = self.queries.get_mut(&qid) {
                    let actions = query.on_reply(from, reply);
                    self.process_query_actions(qid, actions).await;
                }
                // A missing query was cancelled; the detached reply still
                // refreshed the routing table above.
            }
            Purpose::EvictionProbe { bucket, head } => {
                if let Some(table) = &mut self.table {
                    table.probe_succeeded(bucket, head, now);
                }
            }
            Purpose::StaleProbe | Purpose::FireAndForget => {}
        }
    }

    async fn on_request(&mut self, socket: SocketSel, from: SocketAddrV4, frame: Frame) {
        let now = Instant::now();
        let solicited = self
            .recently_contacted
            .get(&from)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.cfg.contact_window);
        if !solicited {
            self.identity.on_unsolicited_request();
        }

        if let Some(observed) = frame.observed {
            self.apply_report(observed).await;
        }
        if let Some(id) = frame.from_id {
            self.admit_peer(id, from, now, None).await;
        }

        let token_ok = frame
            .token
            .as_ref()
            .is_some_and(|token| self.tokens.verify(token, &from));

        let reply_to = ReplyTo {
            socket,
            addr: from,
            origin: from,
            requester_id: frame.from_id,
            tid: frame.tid,
            command: frame.command,
        };

        match frame.command {
            commands::PING => self.send_reply(reply_to, status::OK, None, None).await,
            commands::PING_NAT => {
                // The requester names the port it wants the answer at.
                let addr = match frame.value.as_deref() {
                    Some([hi, lo, ..]) => {
                        SocketAddrV4::new(*from.ip(), u16::from_be_bytes([*hi, *lo]))
                    }
                    _ => from,
                };
                let reply_to = ReplyTo {
                    addr,
                    ..reply_to
                };
                self.send_reply(reply_to, status::OK, None, None).await;
            }
            commands::FIND_NODE => {
                self.send_reply(reply_to, status::OK, None, frame.target.as_ref())
                    .await;
            }
            commands::DOWN_HINT => {
                if let Some(suspect) = frame.value.as_deref().and_then(peer::decode_addr) {
                    if self.table.as_ref().is_some_and(|t| t.contains(&suspect)) {
                        debug!(%suspect, "probing down-hinted peer");
                        self.send_request(
                            SocketSel::Primary,
                            suspect,
                            Outgoing::command(commands::PING),
                            self.cfg.probe_timeout,
                            0,
                            Purpose::StaleProbe,
                        )
                        .await;
                    }
                }
                self.send_reply(reply_to, status::OK, None, None).await;
            }
            command if command >= commands::APP_BASE => {
                let request = InboundRequest {
                    from,
                    command,
                    target: frame.target,
                    value: frame.value,
                    token_ok,
                    tid: frame.tid,
                    socket,
                    requester_id: frame.from_id,
                    responder: self.command_tx.clone(),
                };
                if let Err(unsent) = self.events.send(DhtEvent::Request(request)) {
                    drop(unsent);
                    self.send_reply(reply_to, status::UNKNOWN_COMMAND, None, None)
                        .await;
                }
            }
            _ => {
                self.send_reply(reply_to, status::UNKNOWN_COMMAND, None, None)
                    .await;
            }
        }
    }

    /// Build and send a reply frame. Every reply carries a fresh token and
    /// the origin's observed endpoint; `target` attaches our closest peers
    /// to it.
    async fn send_reply(
        &mut self,
        to: ReplyTo,
        status: u8,
        value: Option<Vec<u8>>,
        target: Option<&NodeId>,
    ) {
        let mut frame = Frame::reply(to.tid, to.command, status);
        frame.from_id = self.identity.id().copied();
        frame.to_id = to.requester_id;
        frame.token = Some(self.tokens.derive(&to.origin));
        frame.observed = Some(to.origin);
        if let Some(target) = target {
            if let Some(table) = &self.table {
                frame.nodes = table
                    .closest(target, self.cfg.k)
                    .iter()
                    .map(|p| p.entry())
                    .collect();
            }
        }
        frame.value = value;

        if let Err(err) = self.socket_ref(to.socket).send(to.addr, &frame.encode()).await {
            debug!(%err, to = %to.addr, "reply send failed");
        }
    }

    /// Remember and, when persistent, admit a peer that completed a
    /// round-trip or sent an identified request.
    async fn admit_peer(&mut self, id: NodeId, addr: SocketAddrV4, now: Instant, rtt: Option<Duration>) {
        self.remember_known(NodeEntry { id, addr });

        let insertion = match &mut self.table {
            Some(table) => table.insert(id, addr, now),
            None => return,
        };
        if let Insertion::Probe { bucket, head } = insertion {
            self.send_request(
                SocketSel::Primary,
                head,
                Outgoing::command(commands::PING),
                self.cfg.probe_timeout,
                0,
                Purpose::EvictionProbe { bucket, head },
            )
            .await;
        }
        if let Some(rtt) = rtt {
            if let Some(peer) = self.table.as_mut().and_then(|t| t.get_mut(&addr)) {
                peer.record_rtt(rtt);
            }
        }
    }

    fn remember_known(&mut self, entry: NodeEntry) {
        self.known.retain(|known| known.addr != entry.addr);
        self.known.push_back(entry);
        if self.known.len() > KNOWN_PEERS_CAP {
            self.known.pop_front();
        }
    }

    async fn apply_report(&mut self, observed: SocketAddrV4) {
        let now = self.clock.now();
        if let Some(transition) = self.identity.on_report(observed, now) {
            self.apply_transition(transition).await;
        }
        self.update_status();
    }

    async fn apply_transition(&mut self, transition: Transition) {
        match transition {
            Transition::Upgrade { id, addr } => {
                let now = Instant::now();
                debug!(%addr, seeds = self.known.len(), "rebuilding routing table");
                let mut table = RoutingTable::new(id, self.cfg.k);
                let mut probes = Vec::new();
                for entry in &self.known {
                    if let Insertion::Probe { bucket, head } = table.insert(entry.id, entry.addr, now)
                    {
                        probes.push((bucket, head));
                    }
                }
                self.table = Some(table);
                for (bucket, head) in probes {
                    self.send_request(
                        SocketSel::Primary,
                        head,
                        Outgoing::command(commands::PING),
                        self.cfg.probe_timeout,
                        0,
                        Purpose::EvictionProbe { bucket, head },
                    )
                    .await;
                }
                self.update_status();
                let _ = self.events.send(DhtEvent::Persistent);
                // Announce ourselves along the path toward our own ID.
                let qid = self.next_query_id.fetch_add(1, Ordering::Relaxed);
                self.run_internal_query(
                    qid,
                    QuerySpec {
                        target: id,
                        command: commands::FIND_NODE,
                        value: None,
                    },
                )
                .await;
            }
            Transition::Downgrade(reason) => {
                info!(?reason, "downgrading to ephemeral");
                self.table = None;
                self.identity.reset_after_downgrade(self.clock.now());
                self.update_status();
                self.start_bootstrap_lookup().await;
            }
        }
    }

    async fn start_query(
        &mut self,
        id: u64,
        spec: QuerySpec,
        opts: QueryOptions,
        stream: mpsc::UnboundedSender<Reply>,
        finished: Option<oneshot::Sender<QueryResult>>,
    ) {
        let mut skip = HashSet::new();
        skip.insert(self.primary.local_addr());
        if let Some(secondary) = &self.secondary {
            skip.insert(secondary.local_addr());
        }
        if let Some(public) = self.identity.public_addr() {
            skip.insert(public);
        }

        let mut query = QueryState::new(
            id,
            spec,
            opts.commit,
            opts.socket,
            self.cfg.k,
            self.cfg.alpha,
            self.cfg.commit_concurrency,
            skip,
            self.identity.id().copied(),
            stream,
            finished,
        );

        if opts.nodes.is_empty() {
            let seeds = self
                .table
                .as_ref()
                .map(|t| t.closest(query.target(), self.cfg.k))
                .unwrap_or_default();
            if seeds.is_empty() {
                for addr in self.bootstrap.clone() {
                    query.add_endpoint(addr);
                }
                for entry in &self.known {
                    query.add_candidate(*entry);
                }
            } else {
                for peer in seeds {
                    query.add_candidate(peer.entry());
                }
            }
        } else {
            for addr in opts.nodes {
                query.add_endpoint(addr);
            }
        }

        let actions = query.start();
        self.queries.insert(id, query);
        self.process_query_actions(id, actions).await;
    }

    async fn run_internal_query(&mut self, id: u64, spec: QuerySpec) {
        let (stream, _) = mpsc::unbounded_channel();
        self.start_query(id, spec, QueryOptions::default(), stream, None)
            .await;
    }

    async fn process_query_actions(&mut self, qid: u64, actions: Vec<QueryAction>) {
        let socket = self
            .queries
            .get(&qid)
            .map(|q| q.socket)
            .unwrap_or_default();
        let mut finished = false;
        for action in actions {
            match action {
                QueryAction::Send {
                    to,
                    to_id,
                    token,
                    command,
                    value,
                    target,
                } => {
                    self.send_request(
                        socket,
                        to,
                        Outgoing {
                            command,
                            target: Some(target),
                            value,
                            token,
                            to_id,
                        },
                        self.cfg.request_timeout,
                        0,
                        Purpose::Query(qid),
                    )
                    .await;
                }
                QueryAction::DownHint { to, about } => {
                    let mut value = Vec::with_capacity(peer::ADDR_ENCODED_LEN);
                    peer::encode_addr(&about, &mut value);
                    self.send_request(
                        socket,
                        to,
                        Outgoing {
                            command: commands::DOWN_HINT,
                            target: None,
                            value: Some(value),
                            token: None,
                            to_id: None,
                        },
                        self.cfg.request_timeout,
                        0,
                        Purpose::FireAndForget,
                    )
                    .await;
                }
                QueryAction::Finished => finished = true,
            }
        }
        if finished {
            self.queries.remove(&qid);
            if self.bootstrap_query == Some(qid) {
                self.bootstrap_query = None;
                self.finish_bootstrap();
            }
        }
    }

    async fn start_bootstrap(&mut self) {
        for addr in self.cfg.nodes.clone() {
            self.send_request(
                SocketSel::Primary,
                addr,
                Outgoing::command(commands::PING),
                self.cfg.request_timeout,
                1,
                Purpose::FireAndForget,
            )
            .await;
        }
        if self.bootstrap.is_empty() && self.cfg.nodes.is_empty() {
            self.finish_bootstrap();
            return;
        }
        self.start_bootstrap_lookup().await;
    }

    async fn start_bootstrap_lookup(&mut self) {
        let target = self
            .identity
            .id()
            .copied()
            .unwrap_or_else(NodeId::random);
        let qid = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        self.bootstrap_query = Some(qid);
        self.run_internal_query(
            qid,
            QuerySpec {
                target,
                command: commands::FIND_NODE,
                value: None,
            },
        )
        .await;
    }

    fn finish_bootstrap(&mut self) {
        if !self.bootstrapped {
            self.bootstrapped = true;
            self.update_status();
            let _ = self.events.send(DhtEvent::Bootstrap);
            let _ = self.events.send(DhtEvent::Ready);
            info!(
                table = self.table.as_ref().map(RoutingTable::len).unwrap_or(0),
                "bootstrap complete"
            );
        }
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();
        loop {
            let Some(&Reverse((deadline, tag, tid))) = self.timers.peek() else {
                break;
            };
            if deadline > now {
                break;
            }
            self.timers.pop();
            let socket = socket_from_tag(tag);

            let request_timeout = self.cfg.request_timeout;
            let due = {
                let Some(pending) = self.socket_mut(socket).pending_mut(tid) else {
                    continue;
                };
                if pending.deadline > now {
                    // Superseded by a retry; a newer heap entry exists.
                    continue;
                }
                if pending.retries_left > 0 {
                    pending.retries_left -= 1;
                    pending.deadline = now + request_timeout;
                    Due::Retry {
                        dest: pending.dest,
                        payload: pending.payload.clone(),
                        deadline: pending.deadline,
                    }
                } else {
                    Due::Expire
                }
            };

            match due {
                Due::Retry {
                    dest,
                    payload,
                    deadline,
                } => {
                    trace!(tid, %dest, "retrying request");
                    self.timers.push(Reverse((deadline, tag, tid)));
                    if let Err(err) = self.socket_ref(socket).send(dest, &payload).await {
                        debug!(%err, %dest, "retry send failed");
                    }
                }
                Due::Expire => {
                    let Some(pending) = self.socket_mut(socket).remove_pending(tid) else {
                        continue;
                    };
                    trace!(tid, dest = %pending.dest, "request timed out");
                    self.fail_resolved(pending.purpose, pending.dest, DhtError::Timeout)
                        .await;
                }
            }
        }
    }

    async fn on_maintenance(&mut self) {
        let now = Instant::now();
        self.recently_contacted
            .retain(|_, at| now.saturating_duration_since(*at) < self.cfg.contact_window);

        let Some(table) = &self.table else {
            return;
        };
        if table.is_empty() {
            // Lost every peer (or upgraded before anyone knew us): walk
            // back in through the bootstrap nodes.
            if self.bootstrap_query.is_none() {
                self.start_bootstrap_lookup().await;
            }
            return;
        }

        let refresh_target = table
            .random_aging_bucket(now, self.cfg.refresh_interval)
            .map(|bucket| random_id_in_bucket(table.local_id(), bucket));
        let stale = table.stale_peers(now, self.cfg.stale_after);

        if let Some(target) = refresh_target {
            let qid = self.next_query_id.fetch_add(1, Ordering::Relaxed);
            self.run_internal_query(
                qid,
                QuerySpec {
                    target,
                    command: commands::FIND_NODE,
                    value: None,
                },
            )
            .await;
        }
        for addr in stale {
            if let Some(table) = &mut self.table {
                if let Some(peer) = table.get_mut(&addr) {
                    peer.pinged(now);
                }
            }
            self.send_request(
                SocketSel::Primary,
                addr,
                Outgoing::command(commands::PING),
                self.cfg.probe_timeout,
                0,
                Purpose::StaleProbe,
            )
            .await;
        }
    }

    async fn refresh_table(&mut self) {
        let target = match &self.table {
            Some(table) => *table.local_id(),
            None => NodeId::random(),
        };
        let qid = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        self.run_internal_query(
            qid,
            QuerySpec {
                target,
                command: commands::FIND_NODE,
                value: None,
            },
        )
        .await;
    }

    async fn on_heartbeat(&mut self) {
        let now = self.clock.now();
        let heartbeat = self.identity.on_heartbeat(now);
        if heartbeat.slept {
            let _ = self.events.send(DhtEvent::WakeUp);
        }
        if let Some(transition) = heartbeat.transition {
            self.apply_transition(transition).await;
        }
        self.update_status();

        // While ephemeral (and allowed to upgrade), keep pinging known
        // peers so endpoint reports accumulate.
        if self.identity.is_ephemeral() && self.identity.wants_upgrade() {
            if let Some(target) = self.report_probe_target() {
                self.send_request(
                    SocketSel::Primary,
                    target,
                    Outgoing::command(commands::PING),
                    self.cfg.request_timeout,
                    0,
                    Purpose::FireAndForget,
                )
                .await;
            }
        }
    }

    fn report_probe_target(&mut self) -> Option<SocketAddrV4> {
        let mut pool: Vec<SocketAddrV4> = self.bootstrap.clone();
        pool.extend(self.known.iter().map(|entry| entry.addr));
        if pool.is_empty() {
            return None;
        }
        let target = pool[self.report_probe_idx % pool.len()];
        self.report_probe_idx = self.report_probe_idx.wrapping_add(1);
        Some(target)
    }

    fn shutdown(&mut self, ack: Option<oneshot::Sender<()>>) {
        self.destroyed = true;
        for pending in self.primary.drain() {
            if let Purpose::External(tx) = pending.purpose {
                let _ = tx.send(Err(DhtError::Destroyed));
            }
        }
        if let Some(secondary) = &mut self.secondary {
            for pending in secondary.drain() {
                if let Purpose::External(tx) = pending.purpose {
                    let _ = tx.send(Err(DhtError::Destroyed));
                }
            }
        }
        for (_, mut query) in self.queries.drain() {
            query.cancel();
        }
        self.update_status();
        info!("node destroyed");
        if let Some(tx) = ack {
            let _ = tx.send(());
        }
    }
}

/// The request-side fields of an outbound frame.
struct Outgoing {
    command: u64,
    target: Option<NodeId>,
    value: Option<Vec<u8>>,
    token: Option<Token>,
    to_id: Option<NodeId>,
}

impl Outgoing {
    fn command(command: u64) -> Self {
        Self {
            command,
            target: None,
            value: None,
            token: None,
            to_id: None,
        }
    }
}
