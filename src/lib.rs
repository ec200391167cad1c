//! Replicated Raft-backed ordering chain and channel-configuration bundle
//! validator.
//!
//! Two tightly coupled subsystems live here: the replicated ordering
//! engine (`storage`, `block`, `raft_adapter`, `chain`) and the pure
//! channel-configuration bundle validator (`validation`).

pub mod block;
pub mod chain;
pub mod collaborators;
pub mod error;
pub mod raft_adapter;
pub mod storage;
pub mod types;
pub mod validation;

pub use chain::{Chain, ChainOptions, Clock, SubmitKind, WallClock};
pub use error::{OrdererError, Result};
pub use raft_adapter::{NodeRole, RaftConfig, RaftNode};
pub use storage::StorageFacade;
