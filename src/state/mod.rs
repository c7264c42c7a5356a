//! State Management Module
//!
//! Handles the membership table, election bookkeeping and the
//! persistent hard state of a node.

mod tracker;
mod membership;
pub mod election;

pub use tracker::{HardState, StateTracker};
pub use membership::{MembershipTable, NodeRole, Peer, PeerHealth, PeerRole};
pub use election::{ElectionState, ElectionTimer, VoteTally};
