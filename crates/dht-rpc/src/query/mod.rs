//! Iterative query engine.
//!
//! A query walks the ID space toward a target with α-parallel requests,
//! re-evaluating the K closest candidates after every reply so better
//! candidates preempt probing of worse ones. The state machine performs no
//! I/O: the node actor feeds it replies and timeouts and executes the
//! [`QueryAction`]s it emits.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio_stream::Stream;
use tracing::debug;

use crate::domain::id::NodeId;
use crate::domain::peer::NodeEntry;
use crate::domain::token::Token;
use crate::error::DhtError;
use crate::node::NodeCommand;
use crate::rpc::{Reply, SocketSel};


/// What to look up and which command to carry.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub target: NodeId,
    pub command: u64,
    pub value: Option<Vec<u8>>,
}

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Commit phase behavior once the lookup converges.
    pub commit: Commit,
    /// Caller-supplied seed endpoints, visited unconditionally.
    pub nodes: Vec<SocketAddrV4>,
    /// Socket to send from.
    pub socket: SocketSel,
}

/// What a query sends during its commit phase.
#[derive(Clone, Default)]
pub enum Commit {
    /// No commit phase.
    #[default]
    None,
    /// Re-request the query command at the K closest responders, each
    /// carrying the token that responder echoed.
    Closest,
    /// Per-reply hook deciding what (if anything) to send to each of the
    /// K closest responders.
    Custom(CommitHook),
}

/// Hook receiving a closest responder's lookup reply; returns the commit
/// request for that responder, or `None` to skip it.
pub type CommitHook = Arc<dyn Fn(&Reply) -> Option<CommitRequest> + Send + Sync>;

/// A commit request produced by a [`CommitHook`].
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub command: u64,
    pub value: Option<Vec<u8>>,
}

impl fmt::Debug for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Commit::None => f.write_str("None"),
            Commit::Closest => f.write_str("Closest"),
            Commit::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Terminal state of a query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// The K closest responding peers at convergence.
    pub closest_nodes: Vec<NodeEntry>,
    /// The K best replies by XOR distance of the responder to the target.
    pub closest_replies: Vec<Reply>,
}

/// Handle to a running query: a stream of replies plus the terminal
/// result. Dropping the handle cancels the query.
pub struct Query {
    pub(crate) id: u64,
    pub(crate) commands: mpsc::UnboundedSender<NodeCommand>,
    pub(crate) replies: mpsc::UnboundedReceiver<Reply>,
    pub(crate) finished_rx: Option<oneshot::Receiver<QueryResult>>,
    pub(crate) result: Option<QueryResult>,
}

impl Query {
    /// Next reply, in arrival order. `None` once the query has converged
    /// (or was cancelled) and the buffered replies are drained.
    pub async fn next(&mut self) -> Option<Reply> {
        self.replies.recv().await
    }

    /// Wait for convergence and return the terminal result. Fails with
    /// [`DhtError::Destroyed`] if the node went away first.
    pub async fn finished(&mut self) -> Result<QueryResult, DhtError> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }
        let rx = self.finished_rx.take().ok_or(DhtError::Destroyed)?;
        match rx.await {
            Ok(result) => {
                self.result = Some(result.clone());
                Ok(result)
            }
            Err(_) => Err(DhtError::Destroyed),
        }
    }

    /// Terminal K closest responders; empty before [`Query::finished`].
    pub fn closest_nodes(&self) -> &[NodeEntry] {
        self.result
            .as_ref()
            .map(|r| r.closest_nodes.as_slice())
            .unwrap_or_default()
    }

    /// Terminal K best replies; empty before [`Query::finished`].
    pub fn closest_replies(&self) -> &[Reply] {
        self.result
            .as_ref()
            .map(|r| r.closest_replies.as_slice())
            .unwrap_or_default()
    }
}

impl Stream for Query {
    type Item = Reply;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.replies.poll_recv(cx)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query").field("id", &self.id).finish()
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        let _ = self.commands.send(NodeCommand::CancelQuery(self.id));
    }
}

/// Instruction emitted by the state machine for the actor to execute.
#[derive(Debug)]
pub(crate) enum QueryAction {
    Send {
        to: SocketAddrV4,
        to_id: Option<NodeId>,
        token: Option<Token>,
        command: u64,
        value: Option<Vec<u8>>,
        target: NodeId,
    },
    /// Advise `to` that `about` looks dead.
    DownHint {
        to: SocketAddrV4,
        about: SocketAddrV4,
    },
    /// The query reached its terminal state; the actor removes it.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateStatus {
    Untried,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    id: NodeId,
    addr: SocketAddrV4,
    status: CandidateStatus,
    token: Option<Token>,
    /// Lookup reply, kept for commit hooks.
    reply: Option<Reply>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Lookup,
    Commit,
    Done,
}

struct CommitSend {
    to: SocketAddrV4,
    to_id: NodeId,
    token: Option<Token>,
    command: u64,
    value: Option<Vec<u8>>,
}

pub(crate) struct QueryState {
    id: u64,
    target: NodeId,
    command: u64,
    value: Option<Vec<u8>>,
    commit: Commit,
    pub(crate) socket: SocketSel,

    k: usize,
    alpha: usize,
    commit_concurrency: usize,

    /// Our own endpoints plus the self-reported public endpoint; never
    /// become candidates.
    skip: HashSet<SocketAddrV4>,
    local_id: Option<NodeId>,
    /// Every endpoint ever admitted or visited, for dedup.
    seen: HashSet<SocketAddrV4>,
    /// Sorted by XOR distance to the target, ties on (host, port).
    candidates: Vec<Candidate>,
    /// Seed endpoints without IDs, sent unconditionally at start.
    extra: Vec<SocketAddrV4>,

    replies: Vec<Reply>,
    in_flight: usize,
    phase: Phase,
    commit_queue: Vec<CommitSend>,

    stream: mpsc::UnboundedSender<Reply>,
    finished_tx: Option<oneshot::Sender<QueryResult>>,
}

impl QueryState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        spec: QuerySpec,
        commit: Commit,
        socket: SocketSel,
        k: usize,
        alpha: usize,
        commit_concurrency: usize,
        skip: HashSet<SocketAddrV4>,
        local_id: Option<NodeId>,
        stream: mpsc::UnboundedSender<Reply>,
        finished_tx: Option<oneshot::Sender<QueryResult>>,
    ) -> Self {
        Self {
            id,
            target: spec.target,
            command: spec.command,
            value: spec.value,
            commit,
            socket,
            k,
            alpha,
            commit_concurrency,
            skip,
            local_id,
            seen: HashSet::new(),
            candidates: Vec::new(),
            extra: Vec::new(),
            replies: Vec::new(),
            in_flight: 0,
            phase: Phase::Lookup,
            commit_queue: Vec::new(),
            stream,
            finished_tx,
        }
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Seed an ID-bearing candidate.
    pub fn add_candidate(&mut self, entry: NodeEntry) {
        if self.skip.contains(&entry.addr)
            || self.seen.contains(&entry.addr)
            || Some(entry.id) == self.local_id
        {
            return;
        }
        self.seen.insert(entry.addr);
        let candidate = Candidate {
            id: entry.id,
            addr: entry.addr,
            status: CandidateStatus::Untried,
            token: None,
            reply: None,
        };
        let pos = self
            .candidates
            .partition_point(|c| self.closer(c, &candidate));
        self.candidates.insert(pos, candidate);
    }

    /// Seed an endpoint with no known ID (bootstrap node); visited
    /// unconditionally when the query starts.
    pub fn add_endpoint(&mut self, addr: SocketAddrV4) {
        if self.skip.contains(&addr) || !self.seen.insert(addr) {
            return;
        }
        self.extra.push(addr);
    }

    fn closer(&self, a: &Candidate, b: &Candidate) -> bool {
        a.id.distance(&self.target)
            .cmp(&b.id.distance(&self.target))
            .then_with(|| a.addr.ip().octets().cmp(&b.addr.ip().octets()))
            .then_with(|| a.addr.port().cmp(&b.addr.port()))
            .is_lt()
    }

    /// Kick off the query.
    pub fn start(&mut self) -> Vec<QueryAction> {
        let mut actions = Vec::new();
        for addr in std::mem::take(&mut self.extra) {
            self.in_flight += 1;
            actions.push(QueryAction::Send {
                to: addr,
                to_id: None,
                token: None,
                command: self.command,
                value: self.value.clone(),
                target: self.target,
            });
        }
        self.advance(&mut actions);
        actions
    }

    pub fn on_reply(&mut self, from: SocketAddrV4, reply: Reply) -> Vec<QueryAction> {
        self.in_flight = self.in_flight.saturating_sub(1);
        let mut actions = Vec::new();

        if self.phase == Phase::Commit {
            self.advance(&mut actions);
            return actions;
        }
        if self.phase == Phase::Done {
            return actions;
        }

        match self.candidates.iter_mut().find(|c| c.addr == from) {
            Some(candidate) => {
                candidate.status = CandidateStatus::Responded;
                candidate.token = reply.token;
                candidate.reply = Some(reply.clone());
            }
            None => {
                // An unconditionally-visited seed; it only becomes a
                // ranked candidate if it disclosed an ID.
                if let Some(id) = reply.from_id {
                    if Some(id) != self.local_id {
                        self.seen.insert(from);
                        let candidate = Candidate {
                            id,
                            addr: from,
                            status: CandidateStatus::Responded,
                            token: reply.token,
                            reply: Some(reply.clone()),
                        };
                        let pos = self
                            .candidates
                            .partition_point(|c| self.closer(c, &candidate));
                        self.candidates.insert(pos, candidate);
                    }
                }
            }
        }

        if reply.from_id.is_some() {
            self.record_closest_reply(reply.clone());
        }
        for entry in &reply.nodes {
            self.add_candidate(*entry);
        }
        let _ = self.stream.send(reply);

        self.advance(&mut actions);
        actions
    }

    pub fn on_failure(&mut self, from: SocketAddrV4) -> Vec<QueryAction> {
        self.in_flight = self.in_flight.saturating_sub(1);
        let mut actions = Vec::new();

        if self.phase == Phase::Lookup {
            if let Some(candidate) = self.candidates.iter_mut().find(|c| c.addr == from) {
                candidate.status = CandidateStatus::Failed;
                if let Some(peer) = self
                    .candidates
                    .iter()
                    .find(|c| c.status == CandidateStatus::Responded)
                {
                    actions.push(QueryAction::DownHint {
                        to: peer.addr,
                        about: from,
                    });
                }
            }
        }
        if self.phase != Phase::Done {
            self.advance(&mut actions);
        }
        actions
    }

    /// Stop issuing sends; in-flight requests are detached by the actor.
    pub fn cancel(&mut self) {
        self.phase = Phase::Done;
        self.finished_tx = None;
    }

    fn record_closest_reply(&mut self, reply: Reply) {
        let distance = |r: &Reply| r.from_id.map(|id| id.distance(&self.target));
        let key = distance(&reply);
        let pos = self.replies.partition_point(|r| distance(r) < key);
        self.replies.insert(pos, reply);
        self.replies.truncate(self.k);
    }

    fn next_untried(&self) -> Option<usize> {
        self.candidates
            .iter()
            .take(self.k)
            .position(|c| c.status == CandidateStatus::Untried)
    }

    fn lookup_settled(&self) -> bool {
        self.in_flight == 0 && self.next_untried().is_none()
    }

    fn advance(&mut self, actions: &mut Vec<QueryAction>) {
        match self.phase {
            Phase::Lookup => {
                while self.in_flight < self.alpha {
                    let Some(pos) = self.next_untried() else { break };
                    let candidate = &mut self.candidates[pos];
                    candidate.status = CandidateStatus::InFlight;
                    self.in_flight += 1;
                    actions.push(QueryAction::Send {
                        to: candidate.addr,
                        to_id: Some(candidate.id),
                        token: candidate.token,
                        command: self.command,
                        value: self.value.clone(),
                        target: self.target,
                    });
                }
                if self.lookup_settled() {
                    self.enter_commit(actions);
                }
            }
            Phase::Commit => {
                while self.in_flight < self.commit_concurrency && !self.commit_queue.is_empty() {
                    let send = self.commit_queue.remove(0);
                    self.in_flight += 1;
                    actions.push(QueryAction::Send {
                        to: send.to,
                        to_id: Some(send.to_id),
                        token: send.token,
                        command: send.command,
                        value: send.value,
                        target: self.target,
                    });
                }
                if self.in_flight == 0 && self.commit_queue.is_empty() {
                    self.finish(actions);
                }
            }
            Phase::Done => {}
        }
    }

    fn enter_commit(&mut self, actions: &mut Vec<QueryAction>) {
        let closest: Vec<&Candidate> = self
            .candidates
            .iter()
            .filter(|c| c.status == CandidateStatus::Responded)
            .take(self.k)
            .collect();

        self.commit_queue = match &self.commit {
            Commit::None => Vec::new(),
            Commit::Closest => closest
                .iter()
                .map(|c| CommitSend {
                    to: c.addr,
                    to_id: c.id,
                    token: c.token,
                    command: self.command,
                    value: self.value.clone(),
                })
                .collect(),
            Commit::Custom(hook) => closest
                .iter()
                .filter_map(|c| {
                    let reply = c.reply.as_ref()?;
                    let request = hook(reply)?;
                    Some(CommitSend {
                        to: c.addr,
                        to_id: c.id,
                        token: c.token,
                        command: request.command,
                        value: request.value,
                    })
                })
                .collect(),
        };

        if self.commit_queue.is_empty() {
            self.finish(actions);
        } else {
            debug!(
                query = self.id,
                sends = self.commit_queue.len(),
                "entering commit phase"
            );
            self.phase = Phase::Commit;
            self.advance(actions);
        }
    }

    fn finish(&mut self, actions: &mut Vec<QueryAction>) {
        self.phase = Phase::Done;
        let result = QueryResult {
            closest_nodes: self
                .candidates
                .iter()
                .filter(|c| c.status == CandidateStatus::Responded)
                .take(self.k)
                .map(|c| NodeEntry {
                    id: c.id,
                    addr: c.addr,
                })
                .collect(),
            closest_replies: self.replies.clone(),
        };
        debug!(
            query = self.id,
            closest = result.closest_nodes.len(),
            "query converged"
        );
        if let Some(tx) = self.finished_tx.take() {
            let _ = tx.send(result);
        }
        actions.push(QueryAction::Finished);
    }
}
