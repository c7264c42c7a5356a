//! Consensus Engine
//!
//! Leader election, log replication and membership changes. The
//! protocol logic lives in a synchronous core; the node driver runs it on
//! the tokio runtime.

mod core;
mod node;
mod stats;

pub use self::core::{CoreConfig, CoreEvent, Outbound, RaftCore, Storage};
pub use node::{NodeOptions, RaftNode};
pub use stats::{ClusterStats, PeerStats};
