//! Transport Log
//!
//! The replicated log: an in-memory window of entries backed by segment
//! files. Entries before the window have been folded into a snapshot; the
//! log only remembers the index and term of the last folded entry.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::entry::{LogEntry, LogIndex, Term};
use super::segment::{list_segments, segment_file_name, Segment};
use super::WalPaths;
use crate::config::WalConfig;
use crate::error::{Error, Result};

/// Compaction point persisted next to the segments
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct WalMeta {
    snapshot_index: LogIndex,
    snapshot_term: Term,
}

/// Durable backing for the log
struct SegmentStore {
    paths: WalPaths,
    segments: Vec<Segment>,
    /// Entry index -> (segment id, frame offset)
    locations: BTreeMap<LogIndex, (LogIndex, u64)>,
    segment_size_mb: u64,
    compression: bool,
    fsync: bool,
}

impl SegmentStore {
    fn write_meta(&self, meta: WalMeta) -> Result<()> {
        let tmp = self.paths.base_dir.join("wal_meta.tmp");
        let bytes = bincode::serialize(&meta)?;
        std::fs::write(&tmp, &bytes)?;
        if self.fsync {
            std::fs::File::open(&tmp)?.sync_all()?;
        }
        std::fs::rename(&tmp, self.paths.meta_path())?;
        Ok(())
    }

    fn read_meta(paths: &WalPaths) -> Result<WalMeta> {
        let path = paths.meta_path();
        if !path.exists() {
            return Ok(WalMeta::default());
        }
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            let mut placed = None;
            if let Some(active) = self.segments.last_mut() {
                placed = active.append(entry)?.map(|pos| (active.id, pos));
            }

            let location = match placed {
                Some(loc) => loc,
                None => {
                    if let Some(full) = self.segments.last() {
                        full.sync()?;
                    }
                    let path = self.paths.segment_path(entry.index);
                    let mut segment =
                        Segment::create(path, entry.index, self.segment_size_mb, self.compression)?;
                    let pos = segment
                        .append(entry)?
                        .ok_or_else(|| Error::Wal("fresh segment rejected entry".into()))?;
                    tracing::debug!("Rotated to WAL segment {}", entry.index);
                    self.segments.push(segment);
                    (entry.index, pos)
                }
            };
            self.locations.insert(entry.index, location);
        }

        if self.fsync {
            if let Some(active) = self.segments.last() {
                active.sync()?;
            }
        }
        Ok(())
    }

    fn truncate_suffix(&mut self, from: LogIndex) -> Result<()> {
        let Some(&(segment_id, pos)) = self.locations.get(&from) else {
            return Ok(());
        };

        while let Some(last) = self.segments.last() {
            if last.id <= segment_id {
                break;
            }
            if let Some(segment) = self.segments.pop() {
                std::fs::remove_file(&segment.path)?;
            }
        }
        if let Some(segment) = self.segments.last_mut() {
            segment.truncate(pos)?;
            segment.sync()?;
        }
        self.locations.split_off(&from);
        Ok(())
    }

    fn truncate_prefix(&mut self, upto: LogIndex, meta: WalMeta) -> Result<()> {
        self.write_meta(meta)?;

        // A segment is removable once the next one starts at or before upto + 1
        let mut removable = 0;
        for pair in self.segments.windows(2) {
            if pair[1].id <= upto + 1 {
                removable += 1;
            } else {
                break;
            }
        }
        for segment in self.segments.drain(..removable) {
            std::fs::remove_file(&segment.path)?;
        }
        let keep = self.locations.split_off(&(upto + 1));
        self.locations = keep;
        Ok(())
    }

    fn reset(&mut self, meta: WalMeta) -> Result<()> {
        for segment in self.segments.drain(..) {
            std::fs::remove_file(&segment.path)?;
        }
        self.locations.clear();
        self.write_meta(meta)
    }
}

/// The transport log
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    store: Option<SegmentStore>,
}

impl RaftLog {
    /// Volatile log, used by simulations and tests
    pub fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            snapshot_index: 0,
            snapshot_term: 0,
            store: None,
        }
    }

    /// Open (or create) the durable log in `dir`
    pub fn open(dir: PathBuf, config: &WalConfig) -> Result<Self> {
        let paths = WalPaths::new(dir);
        paths.ensure_dirs()?;
        let meta = SegmentStore::read_meta(&paths)?;

        let mut store = SegmentStore {
            paths,
            segments: Vec::new(),
            locations: BTreeMap::new(),
            segment_size_mb: config.segment_size_mb,
            compression: config.compression,
            fsync: config.fsync,
        };
        let mut entries: VecDeque<LogEntry> = VecDeque::new();
        let mut next_expected: Option<LogIndex> = None;
        let mut damaged = false;

        for path in list_segments(&store.paths.base_dir)? {
            if damaged {
                tracing::warn!("Discarding WAL segment {:?} after damaged tail", path);
                std::fs::remove_file(&path)?;
                continue;
            }

            let mut segment = Segment::open(path.clone(), config.segment_size_mb, config.compression)?;
            let scan = segment.scan();
            let mut cut = None;

            for (pos, entry) in scan.entries {
                if let Some(expected) = next_expected {
                    if entry.index != expected {
                        tracing::warn!(
                            "WAL gap in {:?}: expected index {}, found {}",
                            path,
                            expected,
                            entry.index
                        );
                        cut = Some(pos);
                        break;
                    }
                }
                next_expected = Some(entry.index + 1);
                store.locations.insert(entry.index, (segment.id, pos));
                if entry.index > meta.snapshot_index {
                    entries.push_back(entry);
                }
            }

            if scan.torn && cut.is_none() {
                tracing::warn!("Truncating torn WAL tail in {:?} at offset {}", path, scan.valid_end);
                cut = Some(scan.valid_end);
            }
            if let Some(pos) = cut {
                segment.truncate(pos)?;
                segment.sync()?;
                damaged = true;
            }
            store.segments.push(segment);
        }

        if let Some(first) = entries.front() {
            if first.index != meta.snapshot_index + 1 {
                return Err(Error::WalCorrupted {
                    index: first.index,
                    reason: format!("log resumes after compaction point {}", meta.snapshot_index),
                });
            }
        }

        store.locations = store.locations.split_off(&(meta.snapshot_index + 1));

        tracing::info!(
            "Opened WAL: snapshot index {}, {} entries, {} segments",
            meta.snapshot_index,
            entries.len(),
            store.segments.len()
        );

        Ok(Self {
            entries,
            snapshot_index: meta.snapshot_index,
            snapshot_term: meta.snapshot_term,
            store: Some(store),
        })
    }

    /// First index still held by the log
    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> LogIndex {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    /// Index of the last entry folded into a snapshot
    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`, if known
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Entries in `[from, to]`, clamped to the end of the log
    pub fn entries(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>> {
        if from <= self.snapshot_index {
            return Err(Error::Compacted(self.snapshot_index));
        }
        let to = to.min(self.last_index());
        if from > to {
            return Ok(Vec::new());
        }
        let start = (from - self.snapshot_index - 1) as usize;
        let end = (to - self.snapshot_index) as usize;
        Ok(self.entries.range(start..end).cloned().collect())
    }

    /// Up to `max` entries starting at `from`, cut short once `max_bytes` is exceeded
    pub fn batch(&self, from: LogIndex, max: usize, max_bytes: usize) -> Result<Vec<LogEntry>> {
        if from <= self.snapshot_index {
            return Err(Error::Compacted(self.snapshot_index));
        }
        let mut out = Vec::new();
        let mut bytes = 0;
        let mut index = from;
        while out.len() < max {
            let Some(entry) = self.entry(index) else { break };
            bytes += entry.size_hint();
            if !out.is_empty() && bytes > max_bytes {
                break;
            }
            out.push(entry.clone());
            index += 1;
        }
        Ok(out)
    }

    /// Append `entries` after `prev`, which must be the current tail
    pub fn append(&mut self, prev: (LogIndex, Term), entries: Vec<LogEntry>) -> Result<LogIndex> {
        let (prev_index, prev_term) = prev;
        let tail_term = self.term_at(prev_index);
        if prev_index != self.last_index() || tail_term != Some(prev_term) {
            return Err(Error::IndexConflict {
                expected_index: prev_index,
                expected_term: prev_term,
                actual_term: tail_term,
            });
        }

        let mut expected = prev_index + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(Error::Wal(format!(
                    "non-contiguous append: expected index {}, got {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }

        if let Some(store) = self.store.as_mut() {
            store.append(&entries)?;
        }
        self.entries.extend(entries);
        Ok(self.last_index())
    }

    /// Discard every entry at or after `from`
    pub fn truncate_suffix(&mut self, from: LogIndex) -> Result<()> {
        if from <= self.snapshot_index {
            return Err(Error::Compacted(self.snapshot_index));
        }
        if from > self.last_index() {
            return Ok(());
        }
        if let Some(store) = self.store.as_mut() {
            store.truncate_suffix(from)?;
        }
        self.entries.truncate((from - self.snapshot_index - 1) as usize);
        tracing::debug!("Truncated log suffix from index {}", from);
        Ok(())
    }

    /// Discard every entry up to and including `upto`
    pub fn truncate_prefix(&mut self, upto: LogIndex) -> Result<()> {
        if upto <= self.snapshot_index {
            return Ok(());
        }
        let term = self.term_at(upto).ok_or_else(|| {
            Error::Wal(format!("cannot compact to {}: beyond last index {}", upto, self.last_index()))
        })?;

        let meta = WalMeta {
            snapshot_index: upto,
            snapshot_term: term,
        };
        if let Some(store) = self.store.as_mut() {
            store.truncate_prefix(upto, meta)?;
        }
        let drop = (upto - self.snapshot_index) as usize;
        self.entries.drain(..drop);
        self.snapshot_index = upto;
        self.snapshot_term = term;
        tracing::debug!("Compacted log through index {}", upto);
        Ok(())
    }

    /// Empty the log so it resumes after `(index, term)`
    pub fn reset(&mut self, index: LogIndex, term: Term) -> Result<()> {
        let meta = WalMeta {
            snapshot_index: index,
            snapshot_term: term,
        };
        if let Some(store) = self.store.as_mut() {
            store.reset(meta)?;
        }
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
        tracing::info!("Log reset to start after index {} (term {})", index, term);
        Ok(())
    }
}

impl WalPaths {
    /// Get path for a specific segment file
    pub fn segment_path(&self, first_index: LogIndex) -> PathBuf {
        self.base_dir.join(segment_file_name(first_index))
    }

    /// Get path for the compaction metadata
    pub fn meta_path(&self) -> PathBuf {
        self.base_dir.join("wal_meta")
    }
}
