//! Replication Module
//!
//! Wire messages plus the leader and follower halves of log replication.

pub mod protocol;
mod leader;
mod follower;

pub use protocol::{Envelope, FrameHeader, Message};
pub use leader::{quorum_match_index, Progress, ProgressState};
pub use follower::{reconcile, rejection_hint, AppendOutcome};
