//! Change sequence numbers and per-origin server states.
//!
//! A [`Csn`] identifies one replicated update and orders it causally against
//! every other update of the topology. A [`ServerState`] records, for each
//! originating server, the newest CSN seen from it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a directory server or replication server.
pub type ServerId = i32;

/// Change Sequence Number: `(timestamp, sequence, originating server id)`.
///
/// Ordering compares the timestamp first, then the sequence counter, then the
/// server id, which gives a total order across the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Csn {
    /// Milliseconds since the Unix epoch on the originating server.
    pub timestamp_ms: u64,
    /// Per-origin sequence counter.
    pub seq: u32,
    /// Originating server.
    pub server_id: ServerId,
}

impl Csn {
    /// Create a new CSN.
    pub fn new(timestamp_ms: u64, seq: u32, server_id: ServerId) -> Self {
        Self {
            timestamp_ms,
            seq,
            server_id,
        }
    }

    /// True when `self` is strictly newer than `other`.
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }

    /// Number of changes between `older` and `newer` from the same origin.
    ///
    /// Returns 0 when `newer` is absent or not actually newer. A missing
    /// `older` counts every change up to `newer`. Sequence wrap-around is
    /// accounted for when the timestamps still move forward.
    pub fn diff_seq_num(newer: Option<&Csn>, older: Option<&Csn>) -> u64 {
        let Some(newer) = newer else {
            return 0;
        };
        let Some(older) = older else {
            return newer.seq as u64;
        };
        if older >= newer {
            return 0;
        }
        if older.timestamp_ms <= newer.timestamp_ms {
            if older.seq <= newer.seq {
                return (newer.seq - older.seq) as u64;
            }
            return (u32::MAX - (older.seq - newer.seq)) as u64 + 1;
        }
        0
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:08x}{:04x}",
            self.timestamp_ms, self.seq, self.server_id as u32 & 0xffff
        )
    }
}

/// Newest CSN seen per originating server.
///
/// Entries never regress: [`ServerState::update`] ignores a CSN older than
/// the one already recorded for its origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    csns: BTreeMap<ServerId, Csn>,
}

impl ServerState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `csn` for its origin. Returns true if the state moved forward.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.csns.get(&csn.server_id) {
            Some(current) if current >= &csn => false,
            _ => {
                self.csns.insert(csn.server_id, csn);
                true
            }
        }
    }

    /// Merge every entry of `other`, keeping the newest CSN per origin.
    pub fn update_all(&mut self, other: &ServerState) -> bool {
        let mut changed = false;
        for csn in other.csns.values() {
            changed |= self.update(*csn);
        }
        changed
    }

    /// Newest CSN recorded for `server_id`.
    pub fn get(&self, server_id: ServerId) -> Option<&Csn> {
        self.csns.get(&server_id)
    }

    /// True when `csn` is already included (not newer than the recorded CSN).
    pub fn cover(&self, csn: &Csn) -> bool {
        self.csns
            .get(&csn.server_id)
            .map(|current| current >= csn)
            .unwrap_or(false)
    }

    /// Origins present in this state.
    pub fn server_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.csns.keys().copied()
    }

    /// All recorded CSNs, ordered by origin.
    pub fn csns(&self) -> impl Iterator<Item = &Csn> {
        self.csns.values()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }

    /// Number of origins.
    pub fn len(&self) -> usize {
        self.csns.len()
    }
}

impl FromIterator<Csn> for ServerState {
    fn from_iter<I: IntoIterator<Item = Csn>>(iter: I) -> Self {
        let mut state = ServerState::new();
        for csn in iter {
            state.update(csn);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod csn_ordering {
        use super::*;

        #[test]
        fn test_timestamp_dominates() {
            let a = Csn::new(100, 9, 3);
            let b = Csn::new(101, 0, 1);
            assert!(b.is_newer_than(&a));
            assert!(a < b);
        }

        #[test]
        fn test_seq_then_server_id() {
            let a = Csn::new(100, 1, 5);
            let b = Csn::new(100, 2, 1);
            let c = Csn::new(100, 2, 2);
            assert!(a < b);
            assert!(b < c);
        }

        #[test]
        fn test_display_is_fixed_width() {
            let csn = Csn::new(0x1234, 7, 42);
            assert_eq!(csn.to_string().len(), 28);
        }
    }

    mod diff_seq_num {
        use super::*;

        #[test]
        fn test_missing_newer_is_zero() {
            assert_eq!(Csn::diff_seq_num(None, Some(&Csn::new(1, 1, 1))), 0);
        }

        #[test]
        fn test_missing_older_counts_all() {
            assert_eq!(Csn::diff_seq_num(Some(&Csn::new(10, 12, 1)), None), 12);
        }

        #[test]
        fn test_plain_difference() {
            let newer = Csn::new(20, 15, 1);
            let older = Csn::new(10, 5, 1);
            assert_eq!(Csn::diff_seq_num(Some(&newer), Some(&older)), 10);
        }

        #[test]
        fn test_older_not_behind() {
            let a = Csn::new(20, 15, 1);
            assert_eq!(Csn::diff_seq_num(Some(&a), Some(&a)), 0);
        }

        #[test]
        fn test_wrap_around() {
            let older = Csn::new(10, u32::MAX - 1, 1);
            let newer = Csn::new(11, 1, 1);
            assert_eq!(Csn::diff_seq_num(Some(&newer), Some(&older)), 3);
        }
    }

    mod server_state {
        use super::*;

        #[test]
        fn test_update_never_regresses() {
            let mut state = ServerState::new();
            assert!(state.update(Csn::new(10, 1, 1)));
            assert!(!state.update(Csn::new(9, 5, 1)));
            assert_eq!(state.get(1), Some(&Csn::new(10, 1, 1)));
        }

        #[test]
        fn test_cover() {
            let mut state = ServerState::new();
            state.update(Csn::new(10, 3, 1));
            assert!(state.cover(&Csn::new(10, 2, 1)));
            assert!(state.cover(&Csn::new(10, 3, 1)));
            assert!(!state.cover(&Csn::new(10, 4, 1)));
            assert!(!state.cover(&Csn::new(1, 1, 2)));
        }

        #[test]
        fn test_update_all_merges_newest() {
            let mut a: ServerState = [Csn::new(5, 1, 1), Csn::new(9, 1, 2)].into_iter().collect();
            let b: ServerState = [Csn::new(7, 1, 1), Csn::new(3, 1, 2), Csn::new(1, 1, 3)]
                .into_iter()
                .collect();
            assert!(a.update_all(&b));
            assert_eq!(a.get(1), Some(&Csn::new(7, 1, 1)));
            assert_eq!(a.get(2), Some(&Csn::new(9, 1, 2)));
            assert_eq!(a.len(), 3);
        }
    }
}
