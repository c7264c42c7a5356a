//! Backup Stream
//!
//! A backup is the latest snapshot plus every committed entry after it,
//! packed into one self-sufficient byte stream:
//! `[magic][version u32][crc32 u32][len u64][lz4(bincode(body))]`.

use serde::{Deserialize, Serialize};

use super::Snapshot;
use crate::error::{Error, Result};
use crate::wal::{LogEntry, LogIndex};

const BACKUP_MAGIC: &[u8; 8] = b"WLFCBKUP";
const BACKUP_VERSION: u32 = 1;
const HEADER_SIZE: usize = 8 + 4 + 4 + 8;

/// Snapshot plus trailing committed entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub snapshot: Snapshot,
    pub entries: Vec<LogEntry>,
}

impl Backup {
    pub fn new(snapshot: Snapshot, entries: Vec<LogEntry>) -> Self {
        Self { snapshot, entries }
    }

    /// Index of the last entry carried by the backup
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map_or(self.snapshot.last_included_index, |e| e.index)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = lz4_flex::compress_prepend_size(&bincode::serialize(self)?);
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(BACKUP_MAGIC);
        out.extend_from_slice(&BACKUP_VERSION.to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode and validate a backup stream
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE || &bytes[0..8] != BACKUP_MAGIC {
            return Err(Error::CorruptSnapshot("invalid backup magic".into()));
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[8..12]);
        let version = u32::from_le_bytes(word);
        if version != BACKUP_VERSION {
            return Err(Error::CorruptSnapshot(format!("unsupported backup version {}", version)));
        }
        word.copy_from_slice(&bytes[12..16]);
        let checksum = u32::from_le_bytes(word);
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[16..24]);
        let len = u64::from_le_bytes(len) as usize;

        let body = &bytes[HEADER_SIZE..];
        if body.len() != len {
            return Err(Error::CorruptSnapshot(format!(
                "backup body is {} bytes, header says {}",
                body.len(),
                len
            )));
        }
        if crc32fast::hash(body) != checksum {
            return Err(Error::CorruptSnapshot("backup checksum mismatch".into()));
        }

        let raw = lz4_flex::decompress_size_prepended(body)
            .map_err(|e| Error::CorruptSnapshot(format!("decompression failed: {}", e)))?;
        let backup: Backup =
            bincode::deserialize(&raw).map_err(|e| Error::CorruptSnapshot(e.to_string()))?;

        backup.snapshot.verify()?;
        let mut expected = backup.snapshot.last_included_index + 1;
        for entry in &backup.entries {
            if entry.index != expected {
                return Err(Error::CorruptSnapshot(format!(
                    "backup entries not contiguous: expected {}, found {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }

        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MembershipTable;
    use crate::wal::EntryPayload;

    fn backup() -> Backup {
        let snapshot = Snapshot::new(4, 2, MembershipTable::new(), b"kv".to_vec()).unwrap();
        let entries = (5..=7)
            .map(|i| LogEntry::new(i, 2, EntryPayload::Data(vec![i as u8])))
            .collect();
        Backup::new(snapshot, entries)
    }

    #[test]
    fn test_stream_round_trip() {
        let b = backup();
        let decoded = Backup::decode(&b.encode().unwrap()).unwrap();
        assert_eq!(decoded, b);
        assert_eq!(decoded.last_index(), 7);
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let bytes = backup().encode().unwrap();
        let err = Backup::decode(&bytes[..bytes.len() - 5]).unwrap_err();
        assert!(matches!(err, Error::CorruptSnapshot(_)));
    }

    #[test]
    fn test_gap_rejected() {
        let mut b = backup();
        b.entries.remove(1);
        let err = Backup::decode(&b.encode().unwrap()).unwrap_err();
        assert!(matches!(err, Error::CorruptSnapshot(_)));
    }
}
