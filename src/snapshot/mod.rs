//! Snapshot Module
//!
//! Point-in-time images of committed state, their on-disk files and
//! the self-contained backup stream built from them.

mod backup;
mod manager;

pub use backup::Backup;
pub use manager::SnapshotManager;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::MembershipTable;
use crate::wal::{LogIndex, Term};

/// Magic bytes for snapshot files
const SNAPSHOT_MAGIC: &[u8; 8] = b"WLFCSNAP";

/// Snapshot file format version
const SNAPSHOT_VERSION: u32 = 1;

/// Consistent image of committed state up to `last_included_index`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub membership: MembershipTable,
    /// Serialized application state
    pub state: Vec<u8>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub checksum: u32,
}

impl Snapshot {
    pub fn new(
        last_included_index: LogIndex,
        last_included_term: Term,
        membership: MembershipTable,
        state: Vec<u8>,
    ) -> Result<Self> {
        let mut snapshot = Self {
            last_included_index,
            last_included_term,
            membership,
            state,
            created_at: chrono::Utc::now(),
            checksum: 0,
        };
        snapshot.checksum = snapshot.compute_checksum()?;
        Ok(snapshot)
    }

    fn compute_checksum(&self) -> Result<u32> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.last_included_index.to_le_bytes());
        hasher.update(&self.last_included_term.to_le_bytes());
        hasher.update(&bincode::serialize(&self.membership)?);
        hasher.update(&self.state);
        Ok(hasher.finalize())
    }

    /// Check the checksum against the contents
    pub fn verify(&self) -> Result<()> {
        let expected = self
            .compute_checksum()
            .map_err(|e| Error::CorruptSnapshot(e.to_string()))?;
        if expected != self.checksum {
            return Err(Error::CorruptSnapshot(format!(
                "checksum mismatch at index {}: stored {:08x}, computed {:08x}",
                self.last_included_index, self.checksum, expected
            )));
        }
        Ok(())
    }

    /// Encode for a snapshot file: [magic][version][bincode body]
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(body.len() + 12);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode and verify a snapshot file
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 || &bytes[0..8] != SNAPSHOT_MAGIC {
            return Err(Error::CorruptSnapshot("invalid snapshot magic".into()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[8..12]);
        let version = u32::from_le_bytes(version);
        if version != SNAPSHOT_VERSION {
            return Err(Error::CorruptSnapshot(format!(
                "unsupported snapshot version {}",
                version
            )));
        }

        let snapshot: Snapshot = bincode::deserialize(&bytes[12..])
            .map_err(|e| Error::CorruptSnapshot(e.to_string()))?;
        snapshot.verify()?;
        Ok(snapshot)
    }
}
