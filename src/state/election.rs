//! Leader Election
//!
//! Randomized election timers and vote tallying. Time is measured in
//! logical ticks so the consensus core stays deterministic under test.

use std::collections::BTreeSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::state::MembershipTable;
use crate::wal::Term;

/// Outcome of a vote count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Not enough responses yet
    Pending,
    /// A majority of voters granted
    Won,
    /// A majority of voters refused
    Lost,
}

/// Election timer with a randomized timeout in `[min_ticks, max_ticks]`
pub struct ElectionTimer {
    min_ticks: u64,
    max_ticks: u64,
    elapsed: u64,
    timeout: u64,
    rng: StdRng,
}

impl ElectionTimer {
    pub fn new(min_ticks: u64, max_ticks: u64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut timer = Self {
            min_ticks,
            max_ticks: max_ticks.max(min_ticks),
            elapsed: 0,
            timeout: min_ticks,
            rng,
        };
        timer.reset();
        timer
    }

    /// Restart the countdown with a fresh random timeout
    pub fn reset(&mut self) {
        self.elapsed = 0;
        self.timeout = self.rng.gen_range(self.min_ticks..=self.max_ticks);
    }

    /// Advance one tick, returning true once the timeout has expired
    pub fn tick(&mut self) -> bool {
        self.elapsed += 1;
        self.elapsed >= self.timeout
    }

    /// Ticks since the last reset
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn min_ticks(&self) -> u64 {
        self.min_ticks
    }

    pub fn max_ticks(&self) -> u64 {
        self.max_ticks
    }
}

/// Votes collected by a candidate for one term
#[derive(Debug, Clone)]
pub struct VoteTally {
    pub term: Term,
    granted: BTreeSet<String>,
    rejected: BTreeSet<String>,
}

impl VoteTally {
    pub fn new(term: Term) -> Self {
        Self {
            term,
            granted: BTreeSet::new(),
            rejected: BTreeSet::new(),
        }
    }

    /// Record a response; repeated responses from the same voter are ignored
    pub fn record(&mut self, from: &str, granted: bool) {
        if self.granted.contains(from) || self.rejected.contains(from) {
            return;
        }
        if granted {
            self.granted.insert(from.to_string());
        } else {
            self.rejected.insert(from.to_string());
        }
    }

    /// Count against the voters of `membership`
    pub fn result(&self, membership: &MembershipTable) -> ElectionState {
        let quorum = membership.quorum_size();
        let granted = self.granted.iter().filter(|id| membership.is_voter(id)).count();
        let rejected = self.rejected.iter().filter(|id| membership.is_voter(id)).count();

        if membership.voter_count() > 0 && granted >= quorum {
            ElectionState::Won
        } else if rejected >= quorum {
            ElectionState::Lost
        } else {
            ElectionState::Pending
        }
    }

    pub fn granted(&self) -> usize {
        self.granted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Peer, PeerRole};

    fn members(ids: &[&str]) -> MembershipTable {
        MembershipTable::from_peers(
            ids.iter().map(|id| Peer::new(*id, *id, PeerRole::Voter, 1)).collect(),
            1,
        )
    }

    #[test]
    fn test_timer_range() {
        let mut timer = ElectionTimer::new(10, 20, Some(7));
        for _ in 0..100 {
            timer.reset();
            assert!((10..=20).contains(&timer.timeout()));
        }
    }

    #[test]
    fn test_timer_expires() {
        let mut timer = ElectionTimer::new(3, 3, Some(1));
        assert!(!timer.tick());
        assert!(!timer.tick());
        assert!(timer.tick());
        timer.reset();
        assert_eq!(timer.elapsed(), 0);
    }

    #[test]
    fn test_vote_tally() {
        let m = members(&["a", "b", "c"]);
        let mut tally = VoteTally::new(2);
        tally.record("a", true);
        assert_eq!(tally.result(&m), ElectionState::Pending);
        tally.record("a", true);
        assert_eq!(tally.granted(), 1);
        tally.record("stranger", true);
        assert_eq!(tally.result(&m), ElectionState::Pending);
        tally.record("b", true);
        assert_eq!(tally.result(&m), ElectionState::Won);

        let mut tally = VoteTally::new(3);
        tally.record("a", true);
        tally.record("b", false);
        tally.record("c", false);
        assert_eq!(tally.result(&m), ElectionState::Lost);
    }
}
