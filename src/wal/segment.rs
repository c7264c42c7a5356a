//! WAL Segment Management
//!
//! Handles individual segment files of the transport log.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::entry::{LogEntry, LogIndex};
use crate::error::{Error, Result};

/// Magic bytes at the start of each segment file
const SEGMENT_MAGIC: &[u8; 8] = b"WLFCLSTR";

/// Segment file version
const SEGMENT_VERSION: u32 = 1;

/// Header size in bytes
pub(crate) const HEADER_SIZE: usize = 32;

/// Frame overhead: length, flags and checksum
const FRAME_OVERHEAD: u64 = 4 + 1 + 4;

/// Segment file header
#[derive(Debug, Clone)]
pub struct SegmentHeader {
    /// Index of the first entry this segment was created for
    pub first_index: LogIndex,
}

impl SegmentHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(SEGMENT_MAGIC);
        bytes[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.first_index.to_le_bytes());
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Wal("Segment header too short".into()));
        }

        if &bytes[0..8] != SEGMENT_MAGIC {
            return Err(Error::Wal("Invalid segment magic bytes".into()));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[8..12]);
        let version = u32::from_le_bytes(version);
        if version != SEGMENT_VERSION {
            return Err(Error::Wal(format!(
                "Unsupported segment version: {}",
                version
            )));
        }

        let mut first = [0u8; 8];
        first.copy_from_slice(&bytes[12..20]);
        Ok(Self {
            first_index: u64::from_le_bytes(first),
        })
    }
}

/// Outcome of scanning a segment from the start
pub struct SegmentScan {
    /// Entries with the file offset of each frame
    pub entries: Vec<(u64, LogEntry)>,
    /// Offset where the valid data ends
    pub valid_end: u64,
    /// Whether trailing bytes past `valid_end` failed to decode
    pub torn: bool,
}

/// A single WAL segment file
pub struct Segment {
    /// Segment ID (first index it was created for)
    pub id: LogIndex,
    /// File path
    pub path: PathBuf,
    file: File,
    write_pos: u64,
    max_size: u64,
    compression: bool,
}

impl Segment {
    /// Create a new segment file
    pub fn create(path: PathBuf, first_index: LogIndex, max_size_mb: u64, compression: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let header = SegmentHeader { first_index };
        file.write_all(&header.to_bytes())?;

        Ok(Self {
            id: first_index,
            path,
            file,
            write_pos: HEADER_SIZE as u64,
            max_size: max_size_mb.max(1) * 1024 * 1024,
            compression,
        })
    }

    /// Open an existing segment file
    pub fn open(path: PathBuf, max_size_mb: u64, compression: bool) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes)?;

        let write_pos = file.seek(SeekFrom::End(0))?;

        Ok(Self {
            id: header.first_index,
            path,
            file,
            write_pos,
            max_size: max_size_mb.max(1) * 1024 * 1024,
            compression,
        })
    }

    /// Encode an entry into a frame: [length: u32][compressed: u8][data][checksum: u32]
    fn encode(&self, entry: &LogEntry) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(entry)?;
        let data = if self.compression {
            lz4_flex::compress_prepend_size(&serialized)
        } else {
            serialized
        };

        let mut frame = Vec::with_capacity(data.len() + FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.push(self.compression as u8);
        frame.extend_from_slice(&data);
        frame.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
        Ok(frame)
    }

    /// Append an entry, returning the offset of its frame, or `None` when the
    /// segment is full and should be rotated
    pub fn append(&mut self, entry: &LogEntry) -> Result<Option<u64>> {
        let frame = self.encode(entry)?;

        // An empty segment always accepts one entry, however large
        if self.write_pos > HEADER_SIZE as u64 && self.write_pos + frame.len() as u64 > self.max_size {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(&frame)?;

        let pos = self.write_pos;
        self.write_pos += frame.len() as u64;
        Ok(Some(pos))
    }

    /// Read the frame at `pos`, returning the entry and the next frame offset
    pub fn read_at(&mut self, pos: u64) -> Result<(LogEntry, u64)> {
        self.file.seek(SeekFrom::Start(pos))?;

        let mut len_bytes = [0u8; 4];
        self.file.read_exact(&mut len_bytes)?;
        let entry_len = u32::from_le_bytes(len_bytes) as u64;

        if pos + FRAME_OVERHEAD + entry_len > self.write_pos {
            return Err(Error::WalCorrupted {
                index: 0,
                reason: "Frame extends past end of segment".into(),
            });
        }

        let mut compressed_flag = [0u8; 1];
        self.file.read_exact(&mut compressed_flag)?;
        let is_compressed = compressed_flag[0] != 0;

        let mut data = vec![0u8; entry_len as usize];
        self.file.read_exact(&mut data)?;

        let mut checksum_bytes = [0u8; 4];
        self.file.read_exact(&mut checksum_bytes)?;
        if u32::from_le_bytes(checksum_bytes) != crc32fast::hash(&data) {
            return Err(Error::WalCorrupted {
                index: 0,
                reason: "Checksum mismatch".into(),
            });
        }

        let serialized = if is_compressed {
            lz4_flex::decompress_size_prepended(&data)
                .map_err(|e| Error::Wal(format!("Decompression failed: {}", e)))?
        } else {
            data
        };

        let entry: LogEntry = bincode::deserialize(&serialized)?;
        Ok((entry, pos + FRAME_OVERHEAD + entry_len))
    }

    /// Read every valid frame, stopping at the first one that fails to decode
    pub fn scan(&mut self) -> SegmentScan {
        let mut entries = Vec::new();
        let mut pos = HEADER_SIZE as u64;

        while pos < self.write_pos {
            match self.read_at(pos) {
                Ok((entry, next)) => {
                    entries.push((pos, entry));
                    pos = next;
                }
                Err(_) => {
                    return SegmentScan {
                        entries,
                        valid_end: pos,
                        torn: true,
                    }
                }
            }
        }

        SegmentScan {
            entries,
            valid_end: pos,
            torn: false,
        }
    }

    /// Cut the file at `pos`, discarding every frame from there on
    pub fn truncate(&mut self, pos: u64) -> Result<()> {
        let pos = pos.max(HEADER_SIZE as u64);
        self.file.set_len(pos)?;
        self.write_pos = pos;
        Ok(())
    }

    /// Sync segment to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Whether any frame has been written
    pub fn is_empty(&self) -> bool {
        self.write_pos <= HEADER_SIZE as u64
    }

    /// Current size on disk
    pub fn size(&self) -> u64 {
        self.write_pos
    }
}

/// Segment file name for a segment starting at `first_index`
pub fn segment_file_name(first_index: LogIndex) -> String {
    format!("wal_{:020}.log", first_index)
}

/// List all segment files in a directory
pub fn list_segments(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "log")
            && path
                .file_stem()
                .and_then(|s| s.to_str())
                .map_or(false, |s| s.starts_with("wal_"))
        {
            segments.push(path);
        }
    }

    // Sort by segment ID (embedded in filename)
    segments.sort();
    Ok(segments)
}
