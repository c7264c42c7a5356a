//! Follower-side log reconciliation
//!
//! Brings the local log in line with an AppendEntries request: checks
//! the previous entry, drops a divergent suffix and appends what is new.

use crate::error::{Error, Result};
use crate::wal::{LogEntry, LogIndex, RaftLog, Term};

/// Result of reconciling an AppendEntries request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Log matches the leader through `match_index`
    Accepted { match_index: LogIndex },
    /// Previous entry did not match; retry from `hint_index + 1`
    Rejected { hint_index: LogIndex },
}

/// Reconcile `entries` (following `prev_index`/`prev_term`) against `log`.
/// Entries at or below `commit_index` are never truncated.
pub fn reconcile(
    log: &mut RaftLog,
    prev_index: LogIndex,
    prev_term: Term,
    mut entries: Vec<LogEntry>,
    commit_index: LogIndex,
) -> Result<AppendOutcome> {
    let claimed_match = prev_index + entries.len() as u64;
    let mut prev = (prev_index, prev_term);

    // Everything up to the local compaction point is committed and therefore matches
    let floor = log.snapshot_index();
    if prev.0 < floor {
        if claimed_match <= floor {
            return Ok(AppendOutcome::Accepted { match_index: floor });
        }
        entries.retain(|e| e.index > floor);
        prev = (floor, log.snapshot_term());
    }

    if log.term_at(prev.0) != Some(prev.1) {
        return Ok(AppendOutcome::Rejected {
            hint_index: rejection_hint(log, prev.0, commit_index),
        });
    }

    let mut new_from = entries.len();
    for (i, entry) in entries.iter().enumerate() {
        match log.term_at(entry.index) {
            Some(term) if term == entry.term => continue,
            Some(_) => {
                if entry.index <= commit_index {
                    return Err(Error::Internal(format!(
                        "leader overwrote committed entry {} (commit index {})",
                        entry.index, commit_index
                    )));
                }
                tracing::info!("Discarding divergent log suffix from index {}", entry.index);
                log.truncate_suffix(entry.index)?;
                new_from = i;
                break;
            }
            None => {
                new_from = i;
                break;
            }
        }
    }

    if new_from < entries.len() {
        let tail = entries.split_off(new_from);
        let anchor = (log.last_index(), log.last_term());
        log.append(anchor, tail)?;
    }

    Ok(AppendOutcome::Accepted {
        match_index: claimed_match.max(floor),
    })
}

/// Index the leader should retry after, skipping a whole conflicting term at once
pub fn rejection_hint(log: &RaftLog, prev_index: LogIndex, commit_index: LogIndex) -> LogIndex {
    let last = log.last_index();
    if prev_index > last {
        return last;
    }

    let mut hint = prev_index.saturating_sub(1);
    if let Some(conflict_term) = log.term_at(prev_index) {
        while hint > commit_index && hint > log.snapshot_index() && log.term_at(hint) == Some(conflict_term) {
            hint -= 1;
        }
    }
    hint
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::EntryPayload;

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry::new(index, term, EntryPayload::NoOp)
    }

    fn log_with(terms: &[Term]) -> RaftLog {
        let mut log = RaftLog::in_memory();
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, t)| entry(i as u64 + 1, *t))
            .collect();
        log.append((0, 0), entries).unwrap();
        log
    }

    #[test]
    fn test_append_to_matching_log() {
        let mut log = log_with(&[1, 1]);
        let out = reconcile(&mut log, 2, 1, vec![entry(3, 2), entry(4, 2)], 0).unwrap();
        assert_eq!(out, AppendOutcome::Accepted { match_index: 4 });
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut log = log_with(&[1, 1, 2]);
        let out = reconcile(&mut log, 1, 1, vec![entry(2, 1)], 0).unwrap();
        assert_eq!(out, AppendOutcome::Accepted { match_index: 2 });
        // Older request must not truncate entry 3
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn test_divergent_suffix_replaced() {
        let mut log = log_with(&[1, 1, 2, 2]);
        let out = reconcile(&mut log, 2, 1, vec![entry(3, 3)], 2).unwrap();
        assert_eq!(out, AppendOutcome::Accepted { match_index: 3 });
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(3));
    }

    #[test]
    fn test_missing_prev_rejected_with_hint() {
        let mut log = log_with(&[1, 1]);
        let out = reconcile(&mut log, 6, 3, vec![entry(7, 3)], 0).unwrap();
        assert_eq!(out, AppendOutcome::Rejected { hint_index: 2 });
    }

    #[test]
    fn test_conflicting_term_skipped_in_hint() {
        let mut log = log_with(&[1, 2, 2, 2]);
        let out = reconcile(&mut log, 4, 3, vec![], 0).unwrap();
        assert_eq!(out, AppendOutcome::Rejected { hint_index: 1 });
    }

    #[test]
    fn test_committed_entries_are_protected() {
        let mut log = log_with(&[1, 1, 1]);
        assert!(reconcile(&mut log, 1, 1, vec![entry(2, 5)], 2).is_err());
    }

    #[test]
    fn test_entries_below_compaction_point() {
        let mut log = log_with(&[1, 1, 1, 1]);
        log.truncate_prefix(3).unwrap();
        let out = reconcile(&mut log, 1, 1, vec![entry(2, 1), entry(3, 1)], 3).unwrap();
        assert_eq!(out, AppendOutcome::Accepted { match_index: 3 });

        let out = reconcile(&mut log, 2, 1, vec![entry(3, 1), entry(4, 1), entry(5, 1)], 3).unwrap();
        assert_eq!(out, AppendOutcome::Accepted { match_index: 5 });
        assert_eq!(log.last_index(), 5);
    }
}
