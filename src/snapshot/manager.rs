//! Snapshot Manager
//!
//! Writes snapshot files, keeps the newest few and loads the newest
//! valid one at startup.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::Snapshot;
use crate::error::Result;
use crate::wal::{LogIndex, Term};

/// Manager for snapshot files
pub struct SnapshotManager {
    /// Directory for snapshot files (None keeps snapshots in memory only)
    directory: Option<PathBuf>,
    /// Number of files kept on disk
    retain: usize,
    latest: Option<Snapshot>,
}

impl SnapshotManager {
    /// Open the snapshot directory and load the newest valid snapshot
    pub fn open(directory: PathBuf, retain: usize) -> Result<Self> {
        fs::create_dir_all(&directory)?;

        let mut latest = None;
        for (_, _, path) in list_snapshots(&directory)?.into_iter().rev() {
            match fs::read(&path).map_err(Into::into).and_then(|b| Snapshot::decode(&b)) {
                Ok(snapshot) => {
                    tracing::info!(
                        "Loaded snapshot at index {} (term {}) from {:?}",
                        snapshot.last_included_index,
                        snapshot.last_included_term,
                        path
                    );
                    latest = Some(snapshot);
                    break;
                }
                Err(e) => tracing::warn!("Skipping unreadable snapshot {:?}: {}", path, e),
            }
        }

        Ok(Self {
            directory: Some(directory),
            retain: retain.max(1),
            latest,
        })
    }

    /// Manager that never touches disk
    pub fn in_memory() -> Self {
        Self {
            directory: None,
            retain: 1,
            latest: None,
        }
    }

    /// Most recent snapshot, if any
    pub fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    pub fn latest_index(&self) -> LogIndex {
        self.latest.as_ref().map_or(0, |s| s.last_included_index)
    }

    /// Persist `snapshot` and make it the latest
    pub fn save(&mut self, snapshot: Snapshot) -> Result<()> {
        if let Some(dir) = &self.directory {
            write_snapshot(dir, &snapshot)?;
            self.cleanup_old_snapshots()?;
        }
        tracing::info!(
            "Saved snapshot at index {} (term {}, {} bytes of state)",
            snapshot.last_included_index,
            snapshot.last_included_term,
            snapshot.state.len()
        );
        self.latest = Some(snapshot);
        Ok(())
    }

    /// Persist `snapshot` and discard every other snapshot file. The old
    /// files stay in place if writing the new one fails.
    pub fn replace_all(&mut self, snapshot: Snapshot) -> Result<()> {
        if let Some(dir) = &self.directory {
            write_snapshot(dir, &snapshot)?;
            let keep = snapshot_path(dir, snapshot.last_included_term, snapshot.last_included_index);
            for (_, _, path) in list_snapshots(dir)? {
                if path != keep {
                    fs::remove_file(path)?;
                }
            }
        }
        tracing::info!(
            "Replaced snapshots with index {} (term {})",
            snapshot.last_included_index,
            snapshot.last_included_term
        );
        self.latest = Some(snapshot);
        Ok(())
    }

    /// Go back to `previous` as the only snapshot, or to none at all
    pub fn revert(&mut self, previous: Option<Snapshot>) -> Result<()> {
        match previous {
            Some(snapshot) => self.replace_all(snapshot),
            None => {
                if let Some(dir) = &self.directory {
                    for (_, _, path) in list_snapshots(dir)? {
                        fs::remove_file(path)?;
                    }
                }
                self.latest = None;
                Ok(())
            }
        }
    }

    fn cleanup_old_snapshots(&self) -> Result<()> {
        let Some(dir) = &self.directory else {
            return Ok(());
        };
        let files = list_snapshots(dir)?;
        if files.len() <= self.retain {
            return Ok(());
        }
        let excess = files.len() - self.retain;
        for (index, term, path) in files.into_iter().take(excess) {
            tracing::debug!("Removing old snapshot {} (term {})", index, term);
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn snapshot_path(dir: &Path, term: Term, index: LogIndex) -> PathBuf {
    dir.join(format!("snapshot_{:020}_{:020}.snap", term, index))
}

fn write_snapshot(dir: &Path, snapshot: &Snapshot) -> Result<()> {
    let path = snapshot_path(dir, snapshot.last_included_term, snapshot.last_included_index);
    let temp_path = path.with_extension("snap.tmp");

    let bytes = snapshot.encode()?;
    let mut file = File::create(&temp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, &path)?;
    Ok(())
}

/// Snapshot files as (index, term, path), oldest first
fn list_snapshots(dir: &Path) -> Result<Vec<(LogIndex, Term, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name
            .strip_prefix("snapshot_")
            .and_then(|s| s.strip_suffix(".snap"))
        else {
            continue;
        };
        let Some((term, index)) = stem.split_once('_') else {
            continue;
        };
        if let (Ok(term), Ok(index)) = (term.parse::<Term>(), index.parse::<LogIndex>()) {
            found.push((index, term, path));
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MembershipTable;
    use tempfile::tempdir;

    fn snap(index: LogIndex, term: Term) -> Snapshot {
        Snapshot::new(index, term, MembershipTable::new(), vec![index as u8]).unwrap()
    }

    #[test]
    fn test_save_retain_and_reload() {
        let dir = tempdir().unwrap();
        let mut manager = SnapshotManager::open(dir.path().to_path_buf(), 2).unwrap();
        assert!(manager.latest().is_none());

        for (i, t) in [(10, 1), (20, 1), (30, 2)] {
            manager.save(snap(i, t)).unwrap();
        }
        assert_eq!(list_snapshots(dir.path()).unwrap().len(), 2);

        let reopened = SnapshotManager::open(dir.path().to_path_buf(), 2).unwrap();
        assert_eq!(reopened.latest_index(), 30);
    }

    #[test]
    fn test_corrupt_newest_falls_back() {
        let dir = tempdir().unwrap();
        let mut manager = SnapshotManager::open(dir.path().to_path_buf(), 3).unwrap();
        manager.save(snap(5, 1)).unwrap();
        manager.save(snap(9, 1)).unwrap();

        std::fs::write(snapshot_path(dir.path(), 1, 9), b"not a snapshot").unwrap();
        let reopened = SnapshotManager::open(dir.path().to_path_buf(), 3).unwrap();
        assert_eq!(reopened.latest_index(), 5);
    }

    #[test]
    fn test_replace_all() {
        let dir = tempdir().unwrap();
        let mut manager = SnapshotManager::open(dir.path().to_path_buf(), 3).unwrap();
        manager.save(snap(50, 4)).unwrap();
        manager.replace_all(snap(7, 1)).unwrap();

        let reopened = SnapshotManager::open(dir.path().to_path_buf(), 3).unwrap();
        assert_eq!(reopened.latest_index(), 7);
    }

    #[test]
    fn test_revert_after_replace() {
        let dir = tempdir().unwrap();
        let mut manager = SnapshotManager::open(dir.path().to_path_buf(), 3).unwrap();
        manager.save(snap(50, 4)).unwrap();
        let previous = manager.latest().cloned();

        manager.replace_all(snap(7, 1)).unwrap();
        manager.revert(previous).unwrap();
        assert_eq!(manager.latest_index(), 50);
        assert_eq!(list_snapshots(dir.path()).unwrap().len(), 1);

        manager.revert(None).unwrap();
        assert!(manager.latest().is_none());
        assert!(list_snapshots(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_failed_replace_keeps_latest() {
        let dir = tempdir().unwrap();
        let snapshots = dir.path().join("snapshots");
        let mut manager = SnapshotManager::open(snapshots.clone(), 3).unwrap();
        manager.save(snap(5, 1)).unwrap();

        std::fs::remove_dir_all(&snapshots).unwrap();
        assert!(manager.replace_all(snap(9, 2)).is_err());
        assert_eq!(manager.latest_index(), 5);
    }

}
