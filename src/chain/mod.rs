//! The ordering chain: C4 (serializer), C5 (membership), C6 (config gate).

mod gate;
mod membership;
mod serializer;

pub use gate::{ConfigGate, ConfigUpdateInfo};
pub use membership::{compute_membership_changes, MembershipChanges, MembershipManager};
pub use serializer::{Chain, ChainOptions, Clock, SubmitKind, WallClock};
