//! Transport Log Module
//!
//! Append-only, durable log of consensus entries with prefix compaction
//! and suffix truncation.

pub mod entry;
mod log;
mod segment;

pub use entry::{ConfigChange, EntryPayload, LogEntry, LogIndex, MembershipOp, Term};
pub use log::RaftLog;
pub use segment::Segment;

use std::path::PathBuf;

/// WAL directory structure
pub struct WalPaths {
    pub base_dir: PathBuf,
}

impl WalPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Ensure WAL directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }
}
