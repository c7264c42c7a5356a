//! WolfCluster Error Types

use thiserror::Error;

/// Result type alias for WolfCluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification exposed to facade callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unavailable,
    AlreadyMember,
    NotMember,
    WouldBreakQuorum,
    CorruptSnapshot,
    StaleSnapshot,
    Timeout,
    Precondition,
    Internal,
}

/// WolfCluster error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Log errors
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("WAL entry corrupted at index {index}: {reason}")]
    WalCorrupted { index: u64, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Log index conflict: expected ({expected_index}, {expected_term}), log has term {actual_term:?}")]
    IndexConflict {
        expected_index: u64,
        expected_term: u64,
        actual_term: Option<u64>,
    },

    #[error("Log entries up to index {0} have been compacted")]
    Compacted(u64),

    // Consensus errors
    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    #[error("Not leader: current leader is {leader:?}")]
    NotLeader { leader: Option<String> },

    #[error("Timed out waiting for index {0} to apply")]
    Timeout(u64),

    // Membership errors
    #[error("Peer {0} is already a member")]
    AlreadyMember(String),

    #[error("Peer {0} is not a member")]
    NotMember(String),

    #[error("Removing {0} would leave the cluster without a voter")]
    WouldBreakQuorum(String),

    // Snapshot errors
    #[error("Snapshot corrupted: {0}")]
    CorruptSnapshot(String),

    #[error("Snapshot at index {snapshot_index} is behind commit index {commit_index}")]
    StaleSnapshot { snapshot_index: u64, commit_index: u64 },

    #[error("Restore rejected: {0}")]
    RestoreRejected(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // State errors
    #[error("State store error: {0}")]
    StateStore(#[from] rusqlite::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Map this error onto the facade error classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unavailable(_)
            | Error::NotLeader { .. }
            | Error::Network(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_)
            | Error::ShuttingDown => ErrorKind::Unavailable,
            Error::AlreadyMember(_) => ErrorKind::AlreadyMember,
            Error::NotMember(_) => ErrorKind::NotMember,
            Error::WouldBreakQuorum(_) => ErrorKind::WouldBreakQuorum,
            Error::CorruptSnapshot(_) => ErrorKind::CorruptSnapshot,
            Error::StaleSnapshot { .. } => ErrorKind::StaleSnapshot,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::RestoreRejected(_) | Error::Config(_) | Error::ConfigParse(_) => {
                ErrorKind::Precondition
            }
            _ => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Unavailable(_)
                | Error::NotLeader { .. }
                | Error::Timeout(_)
        )
    }
}
