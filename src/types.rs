//! Data model shared across the ordering chain and the bundle validator.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Type tag on a transaction envelope's channel header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeType {
    Normal,
    Config,
    OrdererTransaction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelHeader {
    pub channel_id: String,
    pub envelope_type: EnvelopeType,
    pub tx_id: String,
}

/// Opaque transaction payload with a typed channel header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel_header: ChannelHeader,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn is_config(&self) -> bool {
        matches!(
            self.channel_header.envelope_type,
            EnvelopeType::Config | EnvelopeType::OrdererTransaction
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub previous_hash: Vec<u8>,
    pub data_hash: Vec<u8>,
}

/// Hash-chained unit of commitment to the ledger.
///
/// A config block carries exactly one config envelope; a normal block
/// carries one or more normal envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub data: Vec<Envelope>,
    pub metadata: Vec<Vec<u8>>,
}

impl Block {
    /// Mirrors `Envelope::is_config()`: both `CONFIG` and
    /// `ORDERER_TRANSACTION` envelopes take the config-block apply path.
    pub fn is_config_block(&self) -> bool {
        self.data.len() == 1 && self.data[0].is_config()
    }
}

/// A client submission: envelope plus the config sequence the client
/// validated against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub envelope: Envelope,
    pub last_validation_seq: u64,
    pub channel: String,
}

/// A single Raft consenter's network/identity descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsenterInfo {
    pub host: String,
    pub port: u16,
    pub server_tls_cert_pem: Vec<u8>,
    pub client_tls_cert_pem: Vec<u8>,
}

/// Persisted per channel: last applied Raft index and the current
/// consenter set. Consenter ids are unique and stable by construction
/// (the map key is the id).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaftMetadata {
    pub consenters: BTreeMap<u64, ConsenterInfo>,
    pub raft_index: u64,
}

/// Consensus-type migration state, per the migration FSM (§4.7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    None,
    Start,
    Commit,
    Context,
    Abort,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigrationState::None => "MIG_STATE_NONE",
            MigrationState::Start => "MIG_STATE_START",
            MigrationState::Commit => "MIG_STATE_COMMIT",
            MigrationState::Context => "MIG_STATE_CONTEXT",
            MigrationState::Abort => "MIG_STATE_ABORT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusType {
    pub consensus_type: String,
    pub migration_state: MigrationState,
    pub migration_context: u64,
}

/// Capability flags present in a section's protos. We only care whether a
/// given capability name is present, not its semantics.
pub type CapabilitySet = HashSet<String>;

#[derive(Debug, Clone, Default)]
pub struct OrgConfig {
    pub msp_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelSection {
    pub capabilities: CapabilitySet,
}

#[derive(Debug, Clone)]
pub struct OrdererSection {
    pub orgs: BTreeMap<String, OrgConfig>,
    pub consensus_type: ConsensusType,
    pub capabilities: CapabilitySet,
}

#[derive(Debug, Clone, Default)]
pub struct ApplicationSection {
    pub orgs: BTreeMap<String, OrgConfig>,
    pub capabilities: CapabilitySet,
}

#[derive(Debug, Clone, Default)]
pub struct ConsortiumConfig {
    pub orgs: BTreeMap<String, OrgConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct ConsortiumsSection {
    pub consortiums: BTreeMap<String, ConsortiumConfig>,
}

/// A channel-configuration bundle: the channel section is required, the
/// other three are optional.
#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub channel: ChannelSection,
    pub orderer: Option<OrdererSection>,
    pub application: Option<ApplicationSection>,
    pub consortiums: Option<ConsortiumsSection>,
}
