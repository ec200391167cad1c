//! Raft node adapter (C3).

mod node;

pub use node::{NodeRole, RaftConfig, RaftMsg, RaftNode, RaftNodeDriver};

/// A batch of committed entries plus the soft-state Raft reported for the
/// same `Ready`/light-`Ready` pair, delivered to the chain serializer (C4).
pub struct ApplyEvent {
    pub entries: Vec<raft::eraftpb::Entry>,
    pub soft_state: Option<raft::SoftState>,
}
