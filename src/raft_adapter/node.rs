//! Raft node adapter (C3) — channel/actor pattern.
//!
//! # Architecture: single-owner actor
//!
//! `raft::RawNode` is **not** thread-safe: every mutating call (`step`,
//! `propose`, `tick`, `ready`, `advance`) must happen sequentially from a
//! single owner. We enforce this at compile time the way the teacher's
//! Raft wrapper does: by splitting into a public, `Clone + Send + Sync`
//! **handle** (`RaftNode`) that only ever sends messages down an `mpsc`
//! channel, and a private **driver** (`RaftNodeDriver`) that exclusively
//! owns the `RawNode` and is driven by a single task's
//! `process_messages()` + `advance()` loop.
//!
//! `RawNode` must never be exposed outside this module; doing so defeats
//! the single-owner contract and risks the same "not leader but has new
//! msg after advance" class of panic the teacher's driver documents.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use raft::eraftpb::{ConfChange, ConfChangeType, ConfState, Entry, Message};
use raft::storage::MemStorage;
use raft::{Config, RawNode, SoftState};
use slog::{o, Logger};
use tokio::sync::{mpsc, oneshot, watch};

use crate::collaborators::RPC;
use crate::error::{OrdererError, Result};
use crate::storage::StorageFacade;

use super::ApplyEvent;

/// Options controlling the Raft node (subset of the crate's `Options`, per
/// §6 of SPEC_FULL.md).
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: u64,
    pub peers: Vec<u64>,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_size_per_msg: u64,
    pub max_inflight_msgs: usize,
    pub tick_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            id: 1,
            peers: vec![],
            election_tick: 10,
            heartbeat_tick: 3,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            tick_interval: Duration::from_millis(100),
        }
    }
}

impl RaftConfig {
    /// The adapter must disable proposal forwarding (followers do not
    /// forward client proposals to the leader) and enable pre-vote
    /// (reconnected members must not disturb a stable cluster). These are
    /// fixed, not configurable.
    fn to_raft_config(&self) -> Config {
        Config {
            id: self.id,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            max_size_per_msg: self.max_size_per_msg,
            max_inflight_msgs: self.max_inflight_msgs,
            pre_vote: true,
            disable_proposal_forwarding: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
    PreCandidate,
}

impl From<raft::StateRole> for NodeRole {
    fn from(role: raft::StateRole) -> Self {
        match role {
            raft::StateRole::Follower => NodeRole::Follower,
            raft::StateRole::Candidate => NodeRole::Candidate,
            raft::StateRole::Leader => NodeRole::Leader,
            raft::StateRole::PreCandidate => NodeRole::PreCandidate,
        }
    }
}

const ROLE_FOLLOWER: u8 = 0;
const ROLE_CANDIDATE: u8 = 1;
const ROLE_LEADER: u8 = 2;
const ROLE_PRE_CANDIDATE: u8 = 3;

impl NodeRole {
    fn to_u8(self) -> u8 {
        match self {
            NodeRole::Follower => ROLE_FOLLOWER,
            NodeRole::Candidate => ROLE_CANDIDATE,
            NodeRole::Leader => ROLE_LEADER,
            NodeRole::PreCandidate => ROLE_PRE_CANDIDATE,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            ROLE_CANDIDATE => NodeRole::Candidate,
            ROLE_LEADER => NodeRole::Leader,
            ROLE_PRE_CANDIDATE => NodeRole::PreCandidate,
            _ => NodeRole::Follower,
        }
    }
}

/// Messages sent from the [`RaftNode`] handle to the [`RaftNodeDriver`]
/// actor. Everything that touches `RawNode` funnels through here so it
/// executes sequentially on the single owning task.
pub enum RaftMsg {
    Step {
        msg: Message,
    },
    Propose {
        data: Vec<u8>,
        tx: oneshot::Sender<Result<()>>,
    },
    ProposeConfChange {
        change: ConfChange,
        tx: oneshot::Sender<Result<()>>,
    },
    /// Fold a committed ConfChange entry into Raft's view of the cluster.
    /// Called by the chain serializer (C4) as it walks delivered entries,
    /// per §4.4.2 — NOT performed implicitly inside the ready loop, since
    /// C4 owns the decision of when conf-state changes take effect.
    ApplyConfChange {
        change: ConfChange,
        tx: oneshot::Sender<Result<ConfState>>,
    },
    Campaign {
        tx: oneshot::Sender<Result<()>>,
    },
}

/// The public handle: `Clone + Send + Sync`, safe to share across
/// submission-path tasks and the chain serializer.
pub struct RaftNode {
    msg_tx: mpsc::UnboundedSender<RaftMsg>,
    id: u64,
    cached_role: Arc<AtomicU8>,
    cached_leader_id: Arc<AtomicU64>,
    cached_term: Arc<AtomicU64>,
    cached_last_index: Arc<AtomicU64>,
}

impl Clone for RaftNode {
    fn clone(&self) -> Self {
        Self {
            msg_tx: self.msg_tx.clone(),
            id: self.id,
            cached_role: self.cached_role.clone(),
            cached_leader_id: self.cached_leader_id.clone(),
            cached_term: self.cached_term.clone(),
            cached_last_index: self.cached_last_index.clone(),
        }
    }
}

const PROPOSAL_SEND_TIMEOUT_SECS: u64 = 10;

impl RaftNode {
    /// Create a new Raft node, returning a (handle, driver) pair.
    ///
    /// If `mem_storage` has no existing `ConfState` (a fresh cluster), the
    /// voter set is initialized with this node plus all configured peers.
    pub fn new(
        config: RaftConfig,
        storage: Arc<Mutex<StorageFacade>>,
        apply_tx: mpsc::UnboundedSender<ApplyEvent>,
        snapshot_tx: mpsc::UnboundedSender<raft::eraftpb::Snapshot>,
        rpc: Arc<dyn RPC>,
    ) -> Result<(Self, RaftNodeDriver)> {
        use raft::Storage;

        let mem_storage = storage.lock().mem_storage();

        let initial_state = mem_storage
            .initial_state()
            .map_err(|e| OrdererError::Storage(e.to_string()))?;

        if initial_state.conf_state.voters.is_empty() && !config.peers.is_empty() {
            let mut voters = vec![config.id];
            voters.extend(config.peers.iter());
            let cs = ConfState {
                voters: voters.clone(),
                ..Default::default()
            };
            mem_storage.wl().set_conf_state(cs);
            tracing::info!(?voters, "raft.bootstrap.conf_state");
        }

        let raft_config = config.to_raft_config();
        let logger = Logger::root(slog::Discard, o!());
        let raw_node = RawNode::new(&raft_config, mem_storage, &logger)
            .map_err(|e| OrdererError::Raft(e.to_string()))?;

        let cached_role = Arc::new(AtomicU8::new(ROLE_FOLLOWER));
        let cached_leader_id = Arc::new(AtomicU64::new(0));
        let cached_term = Arc::new(AtomicU64::new(0));
        let cached_last_index = Arc::new(AtomicU64::new(0));
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();

        let handle = RaftNode {
            msg_tx,
            id: config.id,
            cached_role: cached_role.clone(),
            cached_leader_id: cached_leader_id.clone(),
            cached_term: cached_term.clone(),
            cached_last_index: cached_last_index.clone(),
        };

        let driver = RaftNodeDriver {
            raw_node,
            config,
            msg_rx,
            storage,
            apply_tx,
            snapshot_tx,
            rpc,
            last_tick: Instant::now(),
            cached_role,
            cached_leader_id,
            cached_term,
            cached_last_index,
        };

        Ok((handle, driver))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> NodeRole {
        NodeRole::from_u8(self.cached_role.load(Ordering::Relaxed))
    }

    pub fn is_leader(&self) -> bool {
        self.role() == NodeRole::Leader
    }

    pub fn leader_id(&self) -> Option<u64> {
        match self.cached_leader_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn term(&self) -> u64 {
        self.cached_term.load(Ordering::Relaxed)
    }

    /// The last index in the local Raft log, per the most recent
    /// `advance()`. Used by the chain serializer to tell whether a
    /// newly elected leader still has entries from a prior term in
    /// flight before it resumes serving submissions.
    pub fn last_index(&self) -> u64 {
        self.cached_last_index.load(Ordering::Relaxed)
    }

    /// Inject a received peer message (fire-and-forget; the driver steps
    /// it on its next loop iteration).
    pub fn step(&self, msg: Message) -> Result<()> {
        self.msg_tx
            .send(RaftMsg::Step { msg })
            .map_err(|_| OrdererError::ChannelClosed)
    }

    /// Submit a normal proposal (a serialized block). Resolves once the
    /// driver has accepted (or rejected) the proposal into Raft — this
    /// does **not** wait for the entry to commit; commit notification
    /// arrives later via the apply channel to C4.
    pub async fn propose(&self, data: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.msg_tx
            .send(RaftMsg::Propose { data, tx })
            .map_err(|_| OrdererError::ChannelClosed)?;
        await_with_timeout(rx).await
    }

    /// Submit a membership change. Like `propose`, resolves on acceptance
    /// into Raft, not on commit.
    pub async fn propose_conf_change(
        &self,
        change_type: ConfChangeType,
        node_id: u64,
        context: Vec<u8>,
    ) -> Result<()> {
        let mut cc = ConfChange::default();
        cc.set_change_type(change_type);
        cc.node_id = node_id;
        cc.context = context.into();

        let (tx, rx) = oneshot::channel();
        self.msg_tx
            .send(RaftMsg::ProposeConfChange { change: cc, tx })
            .map_err(|_| OrdererError::ChannelClosed)?;
        await_with_timeout(rx).await
    }

    /// Fold a committed ConfChange entry into Raft's view of the cluster
    /// and return the resulting `ConfState`.
    pub async fn apply_conf_change(&self, change: ConfChange) -> Result<ConfState> {
        let (tx, rx) = oneshot::channel();
        self.msg_tx
            .send(RaftMsg::ApplyConfChange { change, tx })
            .map_err(|_| OrdererError::ChannelClosed)?;
        match tokio::time::timeout(Duration::from_secs(PROPOSAL_SEND_TIMEOUT_SECS), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OrdererError::ChannelClosed),
            Err(_) => Err(OrdererError::Fatal("apply_conf_change timed out".into())),
        }
    }

    pub async fn campaign(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.msg_tx
            .send(RaftMsg::Campaign { tx })
            .map_err(|_| OrdererError::ChannelClosed)?;
        await_with_timeout(rx).await
    }
}

async fn await_with_timeout(rx: oneshot::Receiver<Result<()>>) -> Result<()> {
    match tokio::time::timeout(Duration::from_secs(PROPOSAL_SEND_TIMEOUT_SECS), rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(OrdererError::ChannelClosed),
        Err(_) => Err(OrdererError::Fatal("raft message send timed out".into())),
    }
}

/// The private actor. Only the task spawned in [`RaftNodeDriver::run`] may
/// call its methods; `raw_node` must never leak out of this type.
pub struct RaftNodeDriver {
    raw_node: RawNode<MemStorage>,
    config: RaftConfig,
    msg_rx: mpsc::UnboundedReceiver<RaftMsg>,
    storage: Arc<Mutex<StorageFacade>>,
    apply_tx: mpsc::UnboundedSender<ApplyEvent>,
    snapshot_tx: mpsc::UnboundedSender<raft::eraftpb::Snapshot>,
    rpc: Arc<dyn RPC>,
    last_tick: Instant,
    cached_role: Arc<AtomicU8>,
    cached_leader_id: Arc<AtomicU64>,
    cached_term: Arc<AtomicU64>,
    cached_last_index: Arc<AtomicU64>,
}

impl RaftNodeDriver {
    /// Run the adapter's own event loop until `shutdown` fires. This is
    /// separate from the chain serializer's (C4's) loop — C3 drives its
    /// own tick/ready cadence and only hands C4 committed entries and
    /// snapshots through the channels it was built with.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            self.process_messages();
            if let Err(e) = self.advance().await {
                tracing::error!(error = %e, "raft.driver.advance_failed");
            }
        }
    }

    fn process_messages(&mut self) {
        while let Ok(msg) = self.msg_rx.try_recv() {
            match msg {
                RaftMsg::Step { msg } => {
                    tracing::trace!(from = msg.from, to = msg.to, "raft.driver.step");
                    if let Err(e) = self.raw_node.step(msg) {
                        tracing::warn!(error = %e, "raft.driver.step_failed");
                    }
                }
                RaftMsg::Propose { data, tx } => {
                    let result = self
                        .raw_node
                        .propose(vec![], data)
                        .map_err(|e| OrdererError::Raft(e.to_string()));
                    let _ = tx.send(result);
                }
                RaftMsg::ProposeConfChange { change, tx } => {
                    let result = self
                        .raw_node
                        .propose_conf_change(vec![], change)
                        .map_err(|e| OrdererError::Raft(e.to_string()));
                    let _ = tx.send(result);
                }
                RaftMsg::ApplyConfChange { change, tx } => {
                    let result = self
                        .raw_node
                        .apply_conf_change(&change)
                        .map_err(|e| OrdererError::Raft(e.to_string()));
                    let _ = tx.send(result);
                }
                RaftMsg::Campaign { tx } => {
                    let result = self
                        .raw_node
                        .campaign()
                        .map_err(|e| OrdererError::Raft(e.to_string()));
                    let _ = tx.send(result);
                }
            }
        }
    }

    /// Drain one `Ready`, in the order §4.3 requires: persist a received
    /// snapshot and hard state/entries via C1 (`self.storage`, the same
    /// facade whose WAL fsyncs before we acknowledge anything to the rest
    /// of Raft), send outgoing messages to peers via the RPC collaborator,
    /// deliver committed entries and soft-state to C4, then advance.
    async fn advance(&mut self) -> Result<()> {
        if self.last_tick.elapsed() >= self.config.tick_interval {
            self.raw_node.tick();
            self.last_tick = Instant::now();
        }

        if !self.raw_node.has_ready() {
            self.update_cached_status();
            return Ok(());
        }

        let mut ready = self.raw_node.ready();

        let mut outgoing = Vec::new();
        if !ready.messages().is_empty() {
            outgoing.extend(ready.take_messages());
        }
        if !ready.persisted_messages().is_empty() {
            outgoing.extend(ready.take_persisted_messages());
        }

        if !ready.snapshot().is_empty() {
            self.storage.lock().apply_snapshot(ready.snapshot().clone())?;
            let _ = self.snapshot_tx.send(ready.snapshot().clone());
        }

        if !ready.entries().is_empty() || ready.hs().is_some() {
            self.storage
                .lock()
                .save_entries(ready.hs().cloned(), ready.entries())?;
        }

        let committed = ready.take_committed_entries();
        if !committed.is_empty() {
            self.deliver(committed, None);
        }

        let soft_state = ready.ss().cloned();

        let mut light_rd = self.raw_node.advance(ready);

        if !light_rd.messages().is_empty() {
            outgoing.extend(light_rd.take_messages());
        }

        let light_committed = light_rd.take_committed_entries();
        if !light_committed.is_empty() || soft_state.is_some() {
            self.deliver(light_committed, soft_state);
        }

        self.raw_node.advance_apply();
        self.update_cached_status();
        self.send_outgoing(outgoing);

        Ok(())
    }

    fn deliver(&self, entries: Vec<Entry>, soft_state: Option<SoftState>) {
        let _ = self.apply_tx.send(ApplyEvent {
            entries,
            soft_state,
        });
    }

    fn send_outgoing(&self, messages: Vec<Message>) {
        for msg in messages {
            let dest = msg.to;
            match protobuf::Message::write_to_bytes(&msg) {
                Ok(payload) => {
                    if let Err(e) = self.rpc.step(dest, payload) {
                        tracing::warn!(dest, error = %e, "raft.driver.send_failed");
                    }
                }
                Err(e) => tracing::warn!(dest, error = %e, "raft.driver.encode_failed"),
            }
        }
    }

    fn update_cached_status(&self) {
        let role: NodeRole = self.raw_node.raft.state.into();
        self.cached_role.store(role.to_u8(), Ordering::Relaxed);
        self.cached_leader_id
            .store(self.raw_node.raft.leader_id, Ordering::Relaxed);
        self.cached_term
            .store(self.raw_node.raft.term, Ordering::Relaxed);
        self.cached_last_index
            .store(self.raw_node.raft.raft_log.last_index(), Ordering::Relaxed);
    }
}
