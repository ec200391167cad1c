//! Chain serializer (C4) — the heart of the ordering engine.
//!
//! A single task owns every piece of mutable chain state (`applied_index`,
//! `role`, `config_inflight`, the block creator, the batch timer, the
//! membership manager) and multiplexes five event sources with
//! `tokio::select!`: submissions, applied Raft entries, the batch timer,
//! snapshot catch-up signals, and halt. External callers only ever reach
//! this state through the channel-backed [`Chain`] handle.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use raft::eraftpb::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, Message as RaftMessage, Snapshot,
};
use raft::storage::MemStorage;
use raft::SoftState;
use tokio::sync::{mpsc, oneshot, watch};

use crate::block::BlockCreator;
use crate::collaborators::{BlockPuller, Configurator, ConsenterSupport, RemoteNode, RPC};
use crate::error::{OrdererError, Result};
use crate::raft_adapter::{ApplyEvent, NodeRole, RaftConfig, RaftNode};
use crate::storage::StorageFacade;
use crate::types::{Block, ConsenterInfo, Envelope, RaftMetadata, SubmitRequest};

use super::gate::{ConfigGate, ConfigUpdateInfo};
use super::membership::MembershipManager;

/// Injectable clock for the batch timer (and, indirectly, the Raft tick
/// interval passed through `ChainOptions`), so tests can drive scheduling
/// deterministically instead of sleeping on the wall clock.
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

pub struct WallClock;

impl Clock for WallClock {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Options controlling a chain instance (§6 of the expanded specification).
pub struct ChainOptions {
    pub raft_id: u64,
    pub clock: Arc<dyn Clock>,
    pub wal_dir: PathBuf,
    pub snap_dir: PathBuf,
    pub snap_interval: u64,
    pub snapshot_catch_up_entries: u64,
    pub tick_interval: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_size_per_msg: u64,
    pub max_inflight_msgs: usize,
    pub raft_metadata: RaftMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitKind {
    Normal,
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

impl From<NodeRole> for Role {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Leader => Role::Leader,
            NodeRole::Candidate | NodeRole::PreCandidate => Role::Candidate,
            NodeRole::Follower => Role::Follower,
        }
    }
}

struct SubmitMsg {
    kind: SubmitKind,
    /// `None` is the `WaitReady` sentinel.
    envelope: Option<Envelope>,
    config_seq: u64,
    reply: oneshot::Sender<Result<()>>,
}

/// Public handle: `Clone`, cheap, safe to share across RPC-handling tasks.
#[derive(Clone)]
pub struct Chain {
    submit_tx: mpsc::UnboundedSender<SubmitMsg>,
    halt_tx: mpsc::UnboundedSender<()>,
    done_rx: watch::Receiver<bool>,
    raft_node: RaftNode,
}

impl Chain {
    /// Build and start a chain: opens storage, constructs the Raft
    /// adapter, and spawns both its driver and this chain's serializer as
    /// background tasks. Returns the handle plus a leader-id observer
    /// (starts at `0`, meaning "no leader").
    pub fn start(
        options: ChainOptions,
        support: Arc<dyn ConsenterSupport>,
        configurator: Arc<dyn Configurator>,
        rpc: Arc<dyn RPC>,
        puller: Box<dyn BlockPuller>,
    ) -> Result<(Chain, watch::Receiver<u64>)> {
        let (facade, _fresh) = StorageFacade::create(
            &options.wal_dir,
            &options.snap_dir,
            MemStorage::new(),
            options.snapshot_catch_up_entries,
        )?;
        let initial_snapshot = facade.snapshot();
        let storage = Arc::new(Mutex::new(facade));

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();

        let peers: Vec<u64> = options
            .raft_metadata
            .consenters
            .keys()
            .copied()
            .filter(|id| *id != options.raft_id)
            .collect();

        let raft_config = RaftConfig {
            id: options.raft_id,
            peers,
            election_tick: options.election_tick,
            heartbeat_tick: options.heartbeat_tick,
            max_size_per_msg: options.max_size_per_msg,
            max_inflight_msgs: options.max_inflight_msgs,
            tick_interval: options.tick_interval,
        };

        let (raft_node, raft_driver) = RaftNode::new(
            raft_config,
            storage.clone(),
            apply_tx,
            snapshot_tx,
            rpc.clone(),
        )?;

        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (halt_tx, halt_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let (leader_tx, leader_rx) = watch::channel(0u64);

        let membership = MembershipManager::new(options.raft_metadata.clone());

        let last_block = if support.height() > 0 {
            support.block(support.height() - 1)
        } else {
            None
        };
        let block_creator = BlockCreator::from_previous(last_block.as_ref().map(|b| &b.header));

        let driver = ChainDriver {
            support,
            configurator,
            rpc,
            puller: Some(puller),
            storage,
            raft_node: raft_node.clone(),
            apply_rx,
            snapshot_rx,
            submit_rx,
            halt_rx,
            halt_tx: halt_tx.clone(),
            done_tx,
            leader_tx,
            membership,
            block_creator,
            conf_state: initial_snapshot.get_metadata().get_conf_state().clone(),
            applied_index: initial_snapshot.get_metadata().index,
            last_snap_block_num: 0,
            snap_interval: options.snap_interval,
            role: Role::Follower,
            config_inflight: false,
            just_elected: false,
            catching_up: false,
            clock: options.clock,
            timer_fut: None,
        };

        tokio::spawn(raft_driver.run(done_rx.clone()));
        tokio::spawn(driver.run());

        Ok((
            Chain {
                submit_tx,
                halt_tx,
                done_rx,
                raft_node,
            },
            leader_rx,
        ))
    }

    pub async fn order(&self, envelope: Envelope, config_seq: u64) -> Result<()> {
        self.submit(SubmitKind::Normal, Some(envelope), config_seq).await
    }

    pub async fn configure(
        &self,
        envelope: Envelope,
        config_seq: u64,
        update_info: Option<ConfigUpdateInfo>,
    ) -> Result<()> {
        ConfigGate::admit(envelope.channel_header.envelope_type, update_info.as_ref())?;
        self.submit(SubmitKind::Config, Some(envelope), config_seq).await
    }

    /// Returns once the chain is able to accept submissions (i.e. not
    /// catching up from a snapshot). Implemented as a sentinel `nil`
    /// submission, per §4.4.
    pub async fn wait_ready(&self) -> Result<()> {
        self.submit(SubmitKind::Normal, None, 0).await
    }

    /// Decode a serialized Raft message and hand it to the adapter.
    pub fn step(&self, payload: Vec<u8>) -> Result<()> {
        let msg: RaftMessage = protobuf::Message::parse_from_bytes(&payload)?;
        self.raft_node.step(msg)
    }

    /// A wait handle that completes when the chain halts.
    pub fn errored(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Idempotent stop; blocks until the serializer task exits.
    pub async fn halt(&self) {
        let _ = self.halt_tx.send(());
        let mut done_rx = self.done_rx.clone();
        let _ = done_rx.wait_for(|halted| *halted).await;
    }

    async fn submit(
        &self,
        kind: SubmitKind,
        envelope: Option<Envelope>,
        config_seq: u64,
    ) -> Result<()> {
        if *self.done_rx.borrow() {
            return Err(OrdererError::Stopped);
        }
        let (reply, reply_rx) = oneshot::channel();
        self.submit_tx
            .send(SubmitMsg {
                kind,
                envelope,
                config_seq,
                reply,
            })
            .map_err(|_| OrdererError::NotRunning)?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(OrdererError::Stopped),
        }
    }
}

/// The private single-threaded actor. Only its own `run` task ever touches
/// `applied_index`, `role`, `config_inflight`, the block creator, or the
/// batch timer.
struct ChainDriver {
    support: Arc<dyn ConsenterSupport>,
    configurator: Arc<dyn Configurator>,
    rpc: Arc<dyn RPC>,
    puller: Option<Box<dyn BlockPuller>>,
    storage: Arc<Mutex<StorageFacade>>,
    raft_node: RaftNode,
    apply_rx: mpsc::UnboundedReceiver<ApplyEvent>,
    snapshot_rx: mpsc::UnboundedReceiver<Snapshot>,
    submit_rx: mpsc::UnboundedReceiver<SubmitMsg>,
    halt_rx: mpsc::UnboundedReceiver<()>,
    halt_tx: mpsc::UnboundedSender<()>,
    done_tx: watch::Sender<bool>,
    leader_tx: watch::Sender<u64>,
    membership: MembershipManager,
    block_creator: BlockCreator,
    conf_state: ConfState,
    applied_index: u64,
    last_snap_block_num: u64,
    snap_interval: u64,
    role: Role,
    config_inflight: bool,
    just_elected: bool,
    catching_up: bool,
    clock: Arc<dyn Clock>,
    timer_fut: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl ChainDriver {
    async fn run(mut self) {
        loop {
            let timer_active = self.timer_fut.is_some();
            tokio::select! {
                maybe_msg = self.submit_rx.recv() => {
                    match maybe_msg {
                        Some(msg) => self.handle_submit(msg).await,
                        None => break,
                    }
                }
                Some(event) = self.apply_rx.recv() => {
                    self.handle_apply(event).await;
                }
                Some(snapshot) = self.snapshot_rx.recv() => {
                    self.handle_snapshot(snapshot).await;
                }
                _ = async {
                    match self.timer_fut.as_mut() {
                        Some(fut) => fut.await,
                        None => std::future::pending().await,
                    }
                }, if timer_active => {
                    self.timer_fut = None;
                    self.handle_batch_timeout().await;
                }
                Some(()) = self.halt_rx.recv() => {
                    break;
                }
            }
        }
        let _ = self.done_tx.send(true);
    }

    async fn handle_submit(&mut self, msg: SubmitMsg) {
        let SubmitMsg {
            kind,
            envelope,
            config_seq,
            reply,
        } = msg;

        let envelope = match envelope {
            Some(envelope) => envelope,
            None => {
                let result = if self.catching_up {
                    Err(OrdererError::NotRunning)
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
                return;
            }
        };

        let result = self.submit_envelope(kind, envelope, config_seq).await;
        let _ = reply.send(result);
    }

    async fn submit_envelope(
        &mut self,
        kind: SubmitKind,
        envelope: Envelope,
        config_seq: u64,
    ) -> Result<()> {
        if self.role != Role::Leader {
            let leader_id = self.raft_node.leader_id().ok_or(OrdererError::NoLeader)?;
            let req = SubmitRequest {
                envelope,
                last_validation_seq: config_seq,
                channel: self.support.chain_id().to_string(),
            };
            return self.rpc.send_submit(leader_id, req);
        }

        if self.just_elected {
            return Err(OrdererError::Validation(
                "this node was just elected leader and has not finished applying entries from the previous term, submission channel is detached".into(),
            ));
        }

        if self.config_inflight {
            return Err(OrdererError::Validation(
                "configuration change in flight, submission channel is detached".into(),
            ));
        }

        let mut envelope = envelope;
        let current_seq = self.support.sequence();
        if config_seq < current_seq {
            envelope = self.revalidate(kind, envelope)?;
        }

        let (batches, pending) = if envelope.is_config() {
            let cut = self.support.cut();
            let mut batches = Vec::new();
            if !cut.is_empty() {
                batches.push(cut);
            }
            batches.push(vec![envelope]);
            (batches, false)
        } else {
            self.support.ordered(envelope)
        };

        for batch in batches {
            let is_config = batch.len() == 1 && batch[0].is_config();
            let block = self.block_creator.create_next(batch);
            let encoded = bincode::serialize(&block).map_err(OrdererError::from)?;
            self.raft_node.propose(encoded).await?;
            if is_config {
                self.config_inflight = true;
            }
        }

        if pending {
            self.arm_batch_timer();
        } else {
            self.timer_fut = None;
        }

        Ok(())
    }

    fn revalidate(&self, kind: SubmitKind, envelope: Envelope) -> Result<Envelope> {
        match kind {
            SubmitKind::Normal => {
                self.support
                    .process_normal_msg(&envelope)
                    .map_err(|e| OrdererError::BadMessage(e.to_string()))?;
                Ok(envelope)
            }
            SubmitKind::Config => {
                let (reprocessed, _seq) = self
                    .support
                    .process_config_msg(&envelope)
                    .map_err(|e| OrdererError::BadMessage(e.to_string()))?;
                Ok(reprocessed)
            }
        }
    }

    fn arm_batch_timer(&mut self) {
        if self.timer_fut.is_none() {
            self.timer_fut = Some(self.clock.sleep(self.support.batch_timeout()));
        }
    }

    async fn handle_batch_timeout(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let cut = self.support.cut();
        if cut.is_empty() {
            tracing::warn!("chain.batch_timer.empty_cut");
            return;
        }
        let is_config = cut.len() == 1 && cut[0].is_config();
        match bincode::serialize(&self.block_creator.create_next(cut)) {
            Ok(encoded) => match self.raft_node.propose(encoded).await {
                Ok(()) => {
                    if is_config {
                        self.config_inflight = true;
                    }
                }
                Err(e) => tracing::error!(error = %e, "chain.batch_timer.propose_failed"),
            },
            Err(e) => tracing::error!(error = %e, "chain.batch_timer.encode_failed"),
        }
    }

    async fn handle_apply(&mut self, event: ApplyEvent) {
        if let Some(soft_state) = event.soft_state {
            self.handle_role_change(soft_state).await;
        }

        let mut wrote_normal_block = None;

        for entry in event.entries {
            if entry.index <= self.applied_index {
                continue;
            }

            if entry.index > self.applied_index + 1 {
                tracing::error!(
                    applied_index = self.applied_index,
                    entry_index = entry.index,
                    "chain.apply.out_of_order, halting"
                );
                let halt_tx = self.halt_tx.clone();
                tokio::spawn(async move {
                    let _ = halt_tx.send(());
                });
                return;
            }

            if entry.data.is_empty() && entry.get_entry_type() == EntryType::EntryNormal {
                self.applied_index = entry.index;
                continue;
            }

            match entry.get_entry_type() {
                EntryType::EntryNormal => match bincode::deserialize::<Block>(&entry.data) {
                    Ok(block) => {
                        let number = block.header.number;
                        if block.is_config_block() {
                            self.write_config_block(block, entry.index).await;
                        } else {
                            self.support.write_block(block, Vec::new());
                            wrote_normal_block = Some(number);
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "chain.apply.decode_failed"),
                },
                EntryType::EntryConfChange | EntryType::EntryConfChangeV2 => {
                    self.handle_conf_change_entry(&entry).await;
                }
            }

            self.applied_index = entry.index;
        }

        if self.snap_interval > 0 {
            if let Some(number) = wrote_normal_block {
                if number.saturating_sub(self.last_snap_block_num) >= self.snap_interval {
                    self.take_snapshot(number).await;
                }
            }
        }

        self.maybe_resume_after_election();
    }

    async fn handle_role_change(&mut self, soft_state: SoftState) {
        let new_role: Role = NodeRole::from(soft_state.raft_state).into();
        if new_role != self.role {
            tracing::info!(?new_role, leader = soft_state.leader_id, "chain.role_change");
            self.role = new_role;

            match new_role {
                Role::Leader => {
                    self.just_elected = true;
                    self.config_inflight = true;

                    let last_block = if self.support.height() > 0 {
                        self.support.block(self.support.height() - 1)
                    } else {
                        None
                    };
                    self.block_creator =
                        BlockCreator::from_previous(last_block.as_ref().map(|b| &b.header));

                    let last_block_metadata = last_block
                        .as_ref()
                        .and_then(|b| b.metadata.first())
                        .and_then(|bytes| bincode::deserialize::<RaftMetadata>(bytes).ok());

                    match self
                        .membership
                        .get_in_flight_conf_change(last_block_metadata.as_ref(), &self.conf_state)
                    {
                        Some(cc) => {
                            self.membership.set_in_progress(cc.clone());
                            if let Err(e) = self
                                .raft_node
                                .propose_conf_change(cc.get_change_type(), cc.node_id, Vec::new())
                                .await
                            {
                                tracing::error!(error = %e, "chain.leader.reconfchange_failed");
                            }
                        }
                        None => self.config_inflight = false,
                    }

                    self.maybe_resume_after_election();
                }
                Role::Follower | Role::Candidate => {
                    self.timer_fut = None;
                    self.config_inflight = false;
                    self.just_elected = false;
                }
            }
        }

        let _ = self.leader_tx.send(soft_state.leader_id);
    }

    /// A newly elected leader stays detached from submissions (`just_elected`)
    /// until every entry still in the local log — including any it inherits
    /// from the previous term — has been applied, and no config change is
    /// in flight. Checked once right after an election, and again after
    /// every subsequent apply batch.
    fn maybe_resume_after_election(&mut self) {
        if self.just_elected
            && !self.config_inflight
            && self.raft_node.last_index() <= self.applied_index
        {
            self.just_elected = false;
            tracing::info!("chain.leader.caught_up");
        }
    }

    /// The new consenter set a config block proposes. Decoding a real
    /// config-update write-set into membership changes is an external
    /// collaborator concern (out of scope); by convention within this
    /// crate a membership-changing config envelope's payload is the
    /// bincode-encoded `RaftMetadata` describing the desired consenter
    /// set, mirroring how `RaftMetadata` is already the block metadata
    /// encoding used elsewhere in this file.
    fn decode_proposed_consenters(&self, block: &Block) -> Option<BTreeMap<u64, ConsenterInfo>> {
        let envelope = block.data.first()?;
        bincode::deserialize::<RaftMetadata>(&envelope.payload)
            .ok()
            .map(|metadata| metadata.consenters)
    }

    async fn write_config_block(&mut self, mut block: Block, raft_index: u64) {
        let metadata = self.membership.raft_metadata();
        let encoded_metadata = match bincode::serialize(&metadata) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "chain.apply.metadata_encode_failed");
                return;
            }
        };
        block.metadata = vec![encoded_metadata.clone()];
        let proposed = self.decode_proposed_consenters(&block);
        self.support.write_config_block(block, encoded_metadata);
        self.config_inflight = false;

        let Some(proposed) = proposed else {
            return;
        };

        if let Some(cc) = self
            .membership
            .update_raft_metadata_and_conf_change(&proposed, raft_index)
        {
            self.membership.set_in_progress(cc.clone());
            self.config_inflight = true;
            if let Err(e) = self
                .raft_node
                .propose_conf_change(cc.get_change_type(), cc.node_id, Vec::new())
                .await
            {
                tracing::error!(error = %e, "chain.apply.propose_conf_change_failed");
            }
        }
    }

    async fn handle_conf_change_entry(&mut self, entry: &Entry) {
        let cc: ConfChange = match protobuf::Message::parse_from_bytes(&entry.data) {
            Ok(cc) => cc,
            Err(e) => {
                tracing::error!(error = %e, "chain.apply.conf_change_decode_failed");
                return;
            }
        };

        let conf_state = match self.raft_node.apply_conf_change(cc.clone()).await {
            Ok(cs) => cs,
            Err(e) => {
                tracing::error!(error = %e, "chain.apply.conf_change_apply_failed");
                return;
            }
        };
        self.conf_state = conf_state;

        if self.membership.clear_if_matches(&cc) {
            self.config_inflight = false;
            if let Err(e) = self.reconfigure_comm() {
                tracing::error!(error = %e, "chain.apply.comm_reconfigure_failed");
            }
        }

        if cc.get_change_type() == ConfChangeType::RemoveNode && cc.node_id == self.raft_node.id() {
            tracing::info!("chain.apply.self_removed, scheduling halt");
            let halt_tx = self.halt_tx.clone();
            tokio::spawn(async move {
                let _ = halt_tx.send(());
            });
        }
    }

    fn reconfigure_comm(&self) -> Result<()> {
        let metadata = self.membership.raft_metadata();
        let remote_nodes: Vec<RemoteNode> = metadata
            .consenters
            .iter()
            .filter(|(id, _)| **id != self.raft_node.id())
            .filter_map(|(id, info)| {
                RemoteNode::from_pem(
                    *id,
                    format!("{}:{}", info.host, info.port),
                    &info.server_tls_cert_pem,
                    &info.client_tls_cert_pem,
                )
                .ok()
            })
            .collect();
        self.configurator.configure(self.support.chain_id(), &remote_nodes)
    }

    async fn handle_snapshot(&mut self, snapshot: Snapshot) {
        let meta = snapshot.get_metadata().clone();
        if meta.index <= self.applied_index {
            return;
        }

        self.catching_up = true;

        let target_block: Block = match bincode::deserialize(&snapshot.data) {
            Ok(block) => block,
            Err(e) => {
                tracing::error!(error = %e, "chain.snapshot.decode_failed");
                self.catching_up = false;
                return;
            }
        };

        if let Some(mut puller) = self.puller.take() {
            let mut next = self.support.height();
            while next <= target_block.header.number {
                match puller.pull_block(next) {
                    Some(block) => {
                        if block.is_config_block() {
                            self.write_config_block(block, meta.index).await;
                        } else {
                            self.support.write_block(block, Vec::new());
                        }
                        next += 1;
                    }
                    None => {
                        tracing::error!(seq = next, "chain.snapshot.pull_failed");
                        break;
                    }
                }
            }
            puller.close();
            self.puller = Some(puller);
        } else {
            tracing::error!("chain.snapshot.no_puller");
        }

        self.applied_index = self.applied_index.max(meta.index);
        self.catching_up = false;
    }

    async fn take_snapshot(&mut self, applied_block_number: u64) {
        let Some(last_block) = self.support.block(applied_block_number) else {
            return;
        };
        let data = match bincode::serialize(&last_block) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "chain.snapshot.encode_failed");
                return;
            }
        };
        let result = self
            .storage
            .lock()
            .take_snapshot(self.applied_index, self.conf_state.clone(), data);
        match result {
            Ok(()) => self.last_snap_block_num = applied_block_number,
            Err(e) => tracing::error!(error = %e, "chain.snapshot.take_failed"),
        }
    }
}
