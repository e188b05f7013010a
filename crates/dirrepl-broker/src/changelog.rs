//! Durable change log of replicated updates, per domain.
//!
//! The broker only relies on [`ChangelogDb`]: append, replay from a server
//! state, newest/oldest states and domain wipe. [`InMemoryChangelog`] keeps
//! everything in memory and is what tests and the standalone binary use.

use crate::csn::{Csn, ServerState};
use crate::error::{BrokerError, Result};
use crate::message::UpdateMsg;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Ordered, finite replay of the updates a server is missing.
pub trait ChangelogCursor: Send {
    /// Next update in CSN order, or `None` when the replay is complete.
    fn next(&mut self) -> Option<Arc<UpdateMsg>>;
}

/// Storage collaborator holding the update history of every domain.
pub trait ChangelogDb: Send + Sync {
    /// Append an update to the history of `base_dn`.
    fn append(&self, base_dn: &str, update: &UpdateMsg) -> Result<()>;

    /// Replay every stored update not covered by `from`.
    ///
    /// The cursor only returns updates present when it was created; open a
    /// new cursor to pick up later appends.
    fn cursor_from(&self, base_dn: &str, from: &ServerState) -> Result<Box<dyn ChangelogCursor>>;

    /// Newest CSN stored per origin.
    fn newest_state(&self, base_dn: &str) -> ServerState;

    /// Oldest CSN stored per origin.
    fn oldest_state(&self, base_dn: &str) -> ServerState;

    /// Drop the whole history of `base_dn`.
    fn remove_all(&self, base_dn: &str) -> Result<()>;

    /// Record that the origin of `csn` produced nothing newer up to `csn`.
    fn replica_heartbeat(&self, base_dn: &str, csn: Csn) -> Result<()>;
}

#[derive(Debug, Default)]
struct DomainLog {
    updates: BTreeMap<Csn, Arc<UpdateMsg>>,
    heartbeats: ServerState,
}

/// In-memory [`ChangelogDb`].
#[derive(Debug, Default)]
pub struct InMemoryChangelog {
    domains: RwLock<HashMap<String, Arc<RwLock<DomainLog>>>>,
    fail_appends: AtomicBool,
}

impl InMemoryChangelog {
    /// Create an empty change log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following append fail, to exercise storage failures.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::Release);
    }

    /// Number of updates stored for `base_dn`.
    pub fn len(&self, base_dn: &str) -> usize {
        self.domain(base_dn)
            .map(|log| log.read().updates.len())
            .unwrap_or(0)
    }

    /// CSNs stored for `base_dn`, in order.
    pub fn csns(&self, base_dn: &str) -> Vec<Csn> {
        self.domain(base_dn)
            .map(|log| log.read().updates.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Newest heartbeat per origin for `base_dn`.
    pub fn heartbeat_state(&self, base_dn: &str) -> ServerState {
        self.domain(base_dn)
            .map(|log| log.read().heartbeats.clone())
            .unwrap_or_default()
    }

    fn domain(&self, base_dn: &str) -> Option<Arc<RwLock<DomainLog>>> {
        self.domains.read().get(base_dn).cloned()
    }

    fn domain_or_create(&self, base_dn: &str) -> Arc<RwLock<DomainLog>> {
        if let Some(log) = self.domain(base_dn) {
            return log;
        }
        Arc::clone(self.domains.write().entry(base_dn.to_string()).or_default())
    }
}

impl ChangelogDb for InMemoryChangelog {
    fn append(&self, base_dn: &str, update: &UpdateMsg) -> Result<()> {
        if self.fail_appends.load(Ordering::Acquire) {
            return Err(BrokerError::Changelog {
                base_dn: base_dn.to_string(),
                msg: format!("cannot store update {}", update.csn),
            });
        }
        let log = self.domain_or_create(base_dn);
        log.write()
            .updates
            .entry(update.csn)
            .or_insert_with(|| Arc::new(update.clone()));
        Ok(())
    }

    fn cursor_from(&self, base_dn: &str, from: &ServerState) -> Result<Box<dyn ChangelogCursor>> {
        let log = self.domain_or_create(base_dn);
        let until = log.read().updates.keys().next_back().copied();
        Ok(Box::new(InMemoryCursor {
            log,
            from: from.clone(),
            last: None,
            until,
        }))
    }

    fn newest_state(&self, base_dn: &str) -> ServerState {
        self.domain(base_dn)
            .map(|log| log.read().updates.keys().copied().collect())
            .unwrap_or_default()
    }

    fn oldest_state(&self, base_dn: &str) -> ServerState {
        let Some(log) = self.domain(base_dn) else {
            return ServerState::new();
        };
        let log = log.read();
        let mut oldest = BTreeMap::new();
        for csn in log.updates.keys() {
            oldest.entry(csn.server_id).or_insert(*csn);
        }
        oldest.into_values().collect()
    }

    fn remove_all(&self, base_dn: &str) -> Result<()> {
        if let Some(log) = self.domains.write().remove(base_dn) {
            let removed = log.read().updates.len();
            debug!(base_dn, removed, "cleared change log");
        }
        Ok(())
    }

    fn replica_heartbeat(&self, base_dn: &str, csn: Csn) -> Result<()> {
        self.domain_or_create(base_dn).write().heartbeats.update(csn);
        Ok(())
    }
}

struct InMemoryCursor {
    log: Arc<RwLock<DomainLog>>,
    from: ServerState,
    last: Option<Csn>,
    until: Option<Csn>,
}

impl ChangelogCursor for InMemoryCursor {
    fn next(&mut self) -> Option<Arc<UpdateMsg>> {
        let until = self.until?;
        let lower = match self.last {
            Some(last) => Bound::Excluded(last),
            None => Bound::Unbounded,
        };
        let log = self.log.read();
        let found = log
            .updates
            .range((lower, Bound::Included(until)))
            .find(|(csn, _)| !self.from.cover(csn))
            .map(|(csn, update)| (*csn, Arc::clone(update)));
        drop(log);

        match found {
            Some((csn, update)) => {
                self.last = Some(csn);
                Some(update)
            }
            None => {
                self.until = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DN: &str = "dc=example,dc=com";

    fn update(ts: u64, seq: u32, server_id: i32) -> UpdateMsg {
        UpdateMsg::new(Csn::new(ts, seq, server_id), vec![seq as u8])
    }

    fn drain(mut cursor: Box<dyn ChangelogCursor>) -> Vec<Csn> {
        let mut out = Vec::new();
        while let Some(update) = cursor.next() {
            out.push(update.csn);
        }
        out
    }

    mod append {
        use super::*;

        #[test]
        fn test_append_and_states() {
            let log = InMemoryChangelog::new();
            log.append(DN, &update(10, 1, 1)).unwrap();
            log.append(DN, &update(11, 2, 1)).unwrap();
            log.append(DN, &update(12, 1, 2)).unwrap();

            let newest = log.newest_state(DN);
            assert_eq!(newest.get(1), Some(&Csn::new(11, 2, 1)));
            assert_eq!(newest.get(2), Some(&Csn::new(12, 1, 2)));

            let oldest = log.oldest_state(DN);
            assert_eq!(oldest.get(1), Some(&Csn::new(10, 1, 1)));
            assert_eq!(log.len(DN), 3);
        }

        #[test]
        fn test_duplicate_append_is_idempotent() {
            let log = InMemoryChangelog::new();
            log.append(DN, &update(10, 1, 1)).unwrap();
            log.append(DN, &update(10, 1, 1)).unwrap();
            assert_eq!(log.len(DN), 1);
        }

        #[test]
        fn test_injected_failure() {
            let log = InMemoryChangelog::new();
            log.set_fail_appends(true);
            let err = log.append(DN, &update(10, 1, 1)).unwrap_err();
            assert!(matches!(err, BrokerError::Changelog { .. }));
            assert_eq!(log.len(DN), 0);
        }

        #[test]
        fn test_remove_all() {
            let log = InMemoryChangelog::new();
            log.append(DN, &update(10, 1, 1)).unwrap();
            log.append("dc=other", &update(10, 1, 1)).unwrap();
            log.remove_all(DN).unwrap();
            assert_eq!(log.len(DN), 0);
            assert!(log.newest_state(DN).is_empty());
            assert_eq!(log.len("dc=other"), 1);
        }
    }

    mod cursor {
        use super::*;

        #[test]
        fn test_cursor_skips_covered() {
            let log = InMemoryChangelog::new();
            for seq in 1..=4 {
                log.append(DN, &update(10 + seq as u64, seq, 1)).unwrap();
            }
            log.append(DN, &update(12, 9, 2)).unwrap();

            let from: ServerState = [Csn::new(12, 2, 1)].into_iter().collect();
            let csns = drain(log.cursor_from(DN, &from).unwrap());
            assert_eq!(
                csns,
                vec![Csn::new(12, 9, 2), Csn::new(13, 3, 1), Csn::new(14, 4, 1)]
            );
        }

        #[test]
        fn test_cursor_is_finite() {
            let log = InMemoryChangelog::new();
            log.append(DN, &update(10, 1, 1)).unwrap();
            let mut cursor = log.cursor_from(DN, &ServerState::new()).unwrap();
            log.append(DN, &update(11, 2, 1)).unwrap();

            assert_eq!(cursor.next().map(|u| u.csn), Some(Csn::new(10, 1, 1)));
            assert!(cursor.next().is_none());
            assert!(cursor.next().is_none());
        }

        #[test]
        fn test_cursor_on_unknown_domain() {
            let log = InMemoryChangelog::new();
            assert!(drain(log.cursor_from("dc=none", &ServerState::new()).unwrap()).is_empty());
        }
    }

    #[test]
    fn test_replica_heartbeat() {
        let log = InMemoryChangelog::new();
        log.replica_heartbeat(DN, Csn::new(50, 0, 3)).unwrap();
        log.replica_heartbeat(DN, Csn::new(40, 0, 3)).unwrap();
        assert_eq!(log.heartbeat_state(DN).get(3), Some(&Csn::new(50, 0, 3)));
        assert_eq!(log.len(DN), 0);
    }
}
