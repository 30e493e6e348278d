//! A small single-leader, term-based log-replication engine: leader
//! election, durable-after-majority-ack log append, ordered apply
//! callbacks to the FSM, and membership changes. `ConsensusHandle` is both
//! the engine and the binding over it; there is no separate client-facing
//! wrapper type, since nothing else in this crate needs to reach the engine
//! except through this handle.
//!
//! Peer transport is a trait (`Transport`) so the whole engine runs
//! in-process for tests; `registry-server` provides a real network
//! implementation.

use crate::error::{Error, Result};
use crate::fsm::Fsm;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

pub type NodeId = String;

const PROPOSE_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
const ELECTION_TIMEOUT_MIN_MS: u64 = 150;
const ELECTION_TIMEOUT_MAX_MS: u64 = 300;
/// How often a non-leader checks whether its election timeout has elapsed.
/// Must be well under `ELECTION_TIMEOUT_MIN_MS` so the timeout is observed
/// promptly rather than only on whichever multiple of this tick it falls on.
const ELECTION_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    term: u64,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Rpc {
    AppendEntries {
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntryWire>,
        leader_commit: u64,
        /// The leader's current voter set, piggy-backed on every heartbeat so
        /// followers learn membership without a separate replication path.
        /// `add_voter` only mutates the leader's own map; this is how that
        /// mutation reaches everyone else well enough to hold an election.
        voters: Vec<(NodeId, String)>,
    },
    AppendEntriesReply {
        term: u64,
        success: bool,
        match_index: u64,
    },
    RequestVote {
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteReply {
        term: u64,
        vote_granted: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntryWire {
    term: u64,
    data: Vec<u8>,
}

/// Peer transport: a request gets exactly one reply, or the call fails.
/// Implemented in-process for tests and over TCP by `registry-server`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &NodeId, rpc: Rpc) -> Result<Rpc>;
}

/// The minimal interface the state machine and the cleanup loop need to
/// submit commands back into the consensus log. Modeled as a trait injected
/// at construction rather than a back-pointer to the node, so the state
/// machine holds only a non-owning capability rather than cyclic ownership
/// (see `DESIGN.md`).
#[async_trait]
pub trait Proposer: Send + Sync {
    async fn propose(&self, command: Vec<u8>) -> Result<()>;
}

struct PendingCommit {
    index: u64,
    notify: oneshot::Sender<()>,
}

struct Shared {
    id: NodeId,
    role: RwLock<RaftRole>,
    term: AtomicU64,
    voted_for: RwLock<Option<NodeId>>,
    log: RwLock<Vec<LogEntry>>,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    leader_id: RwLock<Option<NodeId>>,
    voters: DashMap<NodeId, String>,
    pending: RwLock<Vec<PendingCommit>>,
    /// Last time a valid `AppendEntries` from a current-or-newer-term leader
    /// was observed. A follower that doesn't see this move within its
    /// election timeout starts a campaign.
    last_heartbeat: RwLock<Instant>,
}

impl Shared {
    fn role(&self) -> RaftRole {
        *self.role.read()
    }

    fn quorum_size(&self) -> usize {
        self.voters.len() / 2 + 1
    }
}

/// The consensus binding exposed to the rest of the core: `bootstrap`,
/// `add_voter`, `propose`, `state`.
pub struct ConsensusHandle {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    fsm: Arc<Fsm>,
    inbox: Arc<RwLock<Option<mpsc::UnboundedReceiver<Envelope>>>>,
}

struct Envelope {
    rpc: Rpc,
    reply: oneshot::Sender<Rpc>,
}

/// Registry the in-process `Transport` implementations share, so peers can
/// address each other by id without a real socket.
pub struct InProcessNetwork {
    inboxes: DashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inboxes: DashMap::new() })
    }

    fn register(&self, id: NodeId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(id, tx);
        rx
    }
}

pub struct InProcessTransport {
    network: Arc<InProcessNetwork>,
}

impl InProcessTransport {
    pub fn new(network: Arc<InProcessNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, target: &NodeId, rpc: Rpc) -> Result<Rpc> {
        let sender = self
            .network
            .inboxes
            .get(target)
            .ok_or_else(|| Error::Other(anyhow::anyhow!("unknown peer {target}")))?
            .clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Envelope { rpc, reply: reply_tx })
            .map_err(|_| Error::Other(anyhow::anyhow!("peer {target} inbox closed")))?;
        tokio::time::timeout(Duration::from_millis(750), reply_rx)
            .await
            .map_err(|_| Error::ProposeTimeout)?
            .map_err(|_| Error::Other(anyhow::anyhow!("peer {target} dropped the reply")))
    }
}

impl ConsensusHandle {
    /// Register `id` on `network` and build a handle that talks to the rest
    /// of the cluster through it.
    pub fn new_in_process(id: NodeId, network: &Arc<InProcessNetwork>, fsm: Arc<Fsm>) -> Self {
        let inbox = network.register(id.clone());
        let voters = DashMap::new();
        voters.insert(id.clone(), String::new());
        let shared = Arc::new(Shared {
            id,
            role: RwLock::new(RaftRole::Follower),
            term: AtomicU64::new(0),
            voted_for: RwLock::new(None),
            log: RwLock::new(Vec::new()),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            leader_id: RwLock::new(None),
            voters,
            pending: RwLock::new(Vec::new()),
            last_heartbeat: RwLock::new(Instant::now()),
        });
        Self {
            shared,
            transport: Arc::new(InProcessTransport::new(network.clone())),
            fsm,
            inbox: Arc::new(RwLock::new(Some(inbox))),
        }
    }

    /// Build a handle around a caller-supplied transport instead of the
    /// in-process network. `registry-server` uses this with a TCP transport;
    /// there is no in-process inbox to service, since that transport answers
    /// each inbound connection directly through `process_inbound`.
    pub fn new(id: NodeId, transport: Arc<dyn Transport>, fsm: Arc<Fsm>) -> Self {
        let voters = DashMap::new();
        voters.insert(id.clone(), String::new());
        let shared = Arc::new(Shared {
            id,
            role: RwLock::new(RaftRole::Follower),
            term: AtomicU64::new(0),
            voted_for: RwLock::new(None),
            log: RwLock::new(Vec::new()),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            leader_id: RwLock::new(None),
            voters,
            pending: RwLock::new(Vec::new()),
            last_heartbeat: RwLock::new(Instant::now()),
        });
        Self { shared, transport, fsm, inbox: Arc::new(RwLock::new(None)) }
    }

    pub fn id(&self) -> &NodeId {
        &self.shared.id
    }

    /// Process one inbound RPC received by an external transport (e.g. a
    /// TCP accept loop in `registry-server`) and produce the reply to send
    /// back over that same connection.
    pub fn process_inbound(&self, rpc: Rpc) -> Rpc {
        handle_rpc(&self.shared, &self.fsm, rpc)
    }

    /// Local role: `Leader`, `Follower`, or `Candidate`.
    pub fn state(&self) -> RaftRole {
        self.shared.role()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state(), RaftRole::Leader)
    }

    /// Initialize the local replica. If `is_leader`, start a single-node
    /// cluster with self as the sole voter (so later `add_voter` calls grow
    /// it); otherwise start empty and wait to be told about the cluster via
    /// `add_voter` on the real leader plus this node's own join flow.
    pub async fn bootstrap(&self, is_leader: bool) -> Result<()> {
        if is_leader {
            *self.shared.role.write() = RaftRole::Leader;
            *self.shared.leader_id.write() = Some(self.shared.id.clone());
            self.shared.term.store(1, Ordering::SeqCst);
        }
        self.spawn_inbox_loop();
        self.spawn_background_tasks();
        Ok(())
    }

    fn spawn_inbox_loop(&self) {
        let mut rx = match self.inbox.write().take() {
            Some(rx) => rx,
            None => return,
        };
        let shared = self.shared.clone();
        let fsm = self.fsm.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let reply = handle_rpc(&shared, &fsm, envelope.rpc);
                let _ = envelope.reply.send(reply);
            }
        });
    }

    fn spawn_background_tasks(&self) {
        let shared = self.shared.clone();
        let transport = self.transport.clone();
        let fsm = self.fsm.clone();
        tokio::spawn(async move {
            loop {
                if shared.role() == RaftRole::Leader {
                    replicate_to_followers(&shared, &transport, &fsm).await;
                    tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                } else {
                    let timeout = Duration::from_millis(rand::thread_rng().gen_range(ELECTION_TIMEOUT_MIN_MS..ELECTION_TIMEOUT_MAX_MS));
                    tokio::time::sleep(ELECTION_POLL_INTERVAL).await;
                    let elapsed = shared.last_heartbeat.read().elapsed();
                    if shared.role() != RaftRole::Leader && elapsed >= timeout {
                        run_election(&shared, &transport).await;
                    }
                }
            }
        });
    }

    /// Add a peer as a voting member. Only the leader may successfully
    /// invoke this. If a server with the same id or addr exists but the
    /// pair doesn't match, it's removed first; an exact match is a no-op.
    pub async fn add_voter(&self, id: NodeId, addr: String) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        if let Some(existing) = self.shared.voters.get(&id) {
            if *existing == addr {
                return Ok(());
            }
        }
        // A server with the same addr under a different id is a stale
        // registration; drop it before adding the new pair.
        let stale: Option<NodeId> = self
            .shared
            .voters
            .iter()
            .find(|e| *e.value() == addr && *e.key() != id)
            .map(|e| e.key().clone());
        if let Some(stale_id) = stale {
            self.shared.voters.remove(&stale_id);
        }
        self.shared.voters.insert(id, addr);
        Ok(())
    }

    /// Encode and submit a command. Blocks until committed and applied, or
    /// fails with `ProposeTimeout`, or fails fast with `NotLeader`.
    pub async fn propose(&self, command_bytes: Vec<u8>) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }

        let term = self.shared.term.load(Ordering::SeqCst);
        let index = {
            let mut log = self.shared.log.write();
            log.push(LogEntry { term, data: command_bytes });
            log.len() as u64
        };

        let (tx, rx) = oneshot::channel();
        self.shared.pending.write().push(PendingCommit { index, notify: tx });

        // A single-voter cluster (or one with no peers yet) commits locally.
        maybe_advance_commit(&self.shared, &self.fsm, index);
        // First pass replicates the entry and, once a majority has it,
        // advances this node's own commit index. That advance happened
        // after the AppendEntries for this round had already gone out, so
        // followers applied it with the *previous* leader_commit; a second
        // pass carries the now-current commit index to them without
        // waiting for the next heartbeat tick.
        replicate_to_followers(&self.shared, &self.transport, &self.fsm).await;
        replicate_to_followers(&self.shared, &self.transport, &self.fsm).await;

        tokio::time::timeout(PROPOSE_TIMEOUT, rx)
            .await
            .map_err(|_| Error::ProposeTimeout)?
            .map_err(|_| Error::ProposeTimeout)
    }
}

#[async_trait]
impl Proposer for ConsensusHandle {
    async fn propose(&self, command: Vec<u8>) -> Result<()> {
        ConsensusHandle::propose(self, command).await
    }
}

fn handle_rpc(shared: &Arc<Shared>, fsm: &Arc<Fsm>, rpc: Rpc) -> Rpc {
    match rpc {
        Rpc::AppendEntries { term, leader_id, prev_log_index, prev_log_term, entries, leader_commit, voters } => {
            handle_append_entries(shared, fsm, term, leader_id, prev_log_index, prev_log_term, entries, leader_commit, voters)
        }
        Rpc::RequestVote { term, candidate_id, last_log_index, last_log_term } => {
            handle_request_vote(shared, term, candidate_id, last_log_index, last_log_term)
        }
        other => other,
    }
}

fn handle_append_entries(
    shared: &Arc<Shared>,
    fsm: &Arc<Fsm>,
    term: u64,
    leader_id: NodeId,
    prev_log_index: u64,
    prev_log_term: u64,
    entries: Vec<LogEntryWire>,
    leader_commit: u64,
    voters: Vec<(NodeId, String)>,
) -> Rpc {
    let current_term = shared.term.load(Ordering::SeqCst);
    if term < current_term {
        return Rpc::AppendEntriesReply { term: current_term, success: false, match_index: 0 };
    }

    shared.term.store(term, Ordering::SeqCst);
    *shared.role.write() = RaftRole::Follower;
    *shared.leader_id.write() = Some(leader_id);
    *shared.last_heartbeat.write() = Instant::now();
    for (id, addr) in voters {
        shared.voters.insert(id, addr);
    }

    let mut log = shared.log.write();
    if prev_log_index > 0 {
        match log.get((prev_log_index - 1) as usize) {
            Some(e) if e.term == prev_log_term => {}
            _ => return Rpc::AppendEntriesReply { term, success: false, match_index: 0 },
        }
    }
    log.truncate(prev_log_index as usize);
    log.extend(entries.into_iter().map(|e| LogEntry { term: e.term, data: e.data }));
    let match_index = log.len() as u64;
    drop(log);

    let new_commit = leader_commit.min(match_index);
    apply_up_to(shared, fsm, new_commit);

    Rpc::AppendEntriesReply { term, success: true, match_index }
}

fn handle_request_vote(shared: &Arc<Shared>, term: u64, candidate_id: NodeId, _last_log_index: u64, _last_log_term: u64) -> Rpc {
    let current_term = shared.term.load(Ordering::SeqCst);
    if term < current_term {
        return Rpc::RequestVoteReply { term: current_term, vote_granted: false };
    }

    let mut voted_for = shared.voted_for.write();
    let already_voted = voted_for.as_deref().is_some_and(|v| v != candidate_id);
    if term > current_term {
        shared.term.store(term, Ordering::SeqCst);
        *voted_for = None;
    }
    if already_voted && term == current_term {
        return Rpc::RequestVoteReply { term, vote_granted: false };
    }

    *voted_for = Some(candidate_id);
    drop(voted_for);
    // Granting a vote counts as hearing from a live candidate: reset this
    // node's own timeout so it doesn't immediately start a competing
    // campaign against the one it just voted for.
    *shared.last_heartbeat.write() = Instant::now();
    Rpc::RequestVoteReply { term, vote_granted: true }
}

fn apply_up_to(shared: &Arc<Shared>, fsm: &Arc<Fsm>, commit_index: u64) {
    let prev_applied = shared.last_applied.load(Ordering::SeqCst);
    if commit_index <= prev_applied {
        return;
    }
    shared.commit_index.store(commit_index, Ordering::SeqCst);

    let entries: Vec<Vec<u8>> = {
        let log = shared.log.read();
        log[prev_applied as usize..commit_index as usize].iter().map(|e| e.data.clone()).collect()
    };
    for data in entries {
        fsm.apply(&data);
    }
    shared.last_applied.store(commit_index, Ordering::SeqCst);

    let mut pending = shared.pending.write();
    let (ready, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| p.index <= commit_index);
    *pending = rest;
    drop(pending);
    for p in ready {
        let _ = p.notify.send(());
    }
}

fn maybe_advance_commit(shared: &Arc<Shared>, fsm: &Arc<Fsm>, proposed_index: u64) {
    if shared.quorum_size() <= 1 {
        apply_up_to(shared, fsm, proposed_index);
    }
}

async fn replicate_to_followers(shared: &Arc<Shared>, transport: &Arc<dyn Transport>, fsm: &Arc<Fsm>) {
    if shared.role() != RaftRole::Leader {
        return;
    }
    let term = shared.term.load(Ordering::SeqCst);
    let leader_id = shared.id.clone();
    let leader_commit = shared.commit_index.load(Ordering::SeqCst);

    let peer_ids: HashSet<NodeId> = shared
        .voters
        .iter()
        .map(|e| e.key().clone())
        .filter(|id| id != &shared.id)
        .collect();
    if peer_ids.is_empty() {
        return;
    }

    let entries: Vec<LogEntryWire> = {
        let log = shared.log.read();
        log.iter().map(|e| LogEntryWire { term: e.term, data: e.data.clone() }).collect()
    };
    let voters: Vec<(NodeId, String)> = shared.voters.iter().map(|e| (e.key().clone(), e.value().clone())).collect();

    let mut acks = 1usize; // self
    for peer in &peer_ids {
        let rpc = Rpc::AppendEntries {
            term,
            leader_id: leader_id.clone(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: entries.clone(),
            leader_commit,
            voters: voters.clone(),
        };
        if let Ok(Rpc::AppendEntriesReply { success: true, .. }) = transport.send(peer, rpc).await {
            acks += 1;
        }
    }

    if acks >= shared.quorum_size() {
        let commit_index = entries.len() as u64;
        apply_up_to(shared, fsm, commit_index);
    }
}

/// Run one campaign: bump the term, vote for self, request votes from every
/// known peer concurrently, and become leader on a majority. A node that
/// learns of a newer term or a live leader along the way (via
/// `handle_append_entries`/`handle_request_vote`) naturally falls back to
/// `Follower` and this campaign's result is simply discarded.
async fn run_election(shared: &Arc<Shared>, transport: &Arc<dyn Transport>) {
    let term = shared.term.fetch_add(1, Ordering::SeqCst) + 1;
    *shared.role.write() = RaftRole::Candidate;
    *shared.voted_for.write() = Some(shared.id.clone());
    *shared.last_heartbeat.write() = Instant::now();

    let (last_log_index, last_log_term) = {
        let log = shared.log.read();
        (log.len() as u64, log.last().map(|e| e.term).unwrap_or(0))
    };

    let peer_ids: Vec<NodeId> =
        shared.voters.iter().map(|e| e.key().clone()).filter(|id| id != &shared.id).collect();

    let mut votes = 1usize; // self
    if peer_ids.is_empty() {
        if votes >= shared.quorum_size() {
            become_leader(shared, term);
        }
        return;
    }

    for peer in &peer_ids {
        let rpc = Rpc::RequestVote { term, candidate_id: shared.id.clone(), last_log_index, last_log_term };
        if let Ok(Rpc::RequestVoteReply { term: reply_term, vote_granted: true }) = transport.send(peer, rpc).await {
            if reply_term == term {
                votes += 1;
            }
        }
    }

    // Another node may have become leader (or a higher term arrived) while
    // these RPCs were in flight; only claim leadership if this campaign's
    // term and candidacy are still live.
    if shared.term.load(Ordering::SeqCst) == term
        && shared.role() == RaftRole::Candidate
        && votes >= shared.quorum_size()
    {
        become_leader(shared, term);
    }
}

fn become_leader(shared: &Arc<Shared>, term: u64) {
    if shared.term.load(Ordering::SeqCst) != term {
        return;
    }
    *shared.role.write() = RaftRole::Leader;
    *shared.leader_id.write() = Some(shared.id.clone());
}
