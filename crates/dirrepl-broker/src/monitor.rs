//! Domain-wide monitoring: who is missing how many changes.
//!
//! Every replication server knows the server states of its own peers. The
//! latest [`MonitorMsg`] received from each relay peer adds the view of the
//! rest of the topology; [`DomainMonitor::compute`] merges the two into a
//! [`MonitorData`] snapshot.

use crate::csn::{Csn, ServerId, ServerState};
use crate::message::{MonitorMsg, PeerMonitorState};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

/// Monitoring snapshot of one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorData {
    /// Newest CSN known anywhere in the topology, per origin.
    pub max_csns: ServerState,
    /// Missing changes per directory server.
    pub ds_missing_changes: BTreeMap<ServerId, u64>,
    /// Missing changes per replication server.
    pub rs_missing_changes: BTreeMap<ServerId, u64>,
    /// Approximate date (ms) of the oldest change a directory server misses.
    pub ds_first_missing_ms: BTreeMap<ServerId, u64>,
    /// Approximate date (ms) of the oldest change a replication server misses.
    pub rs_first_missing_ms: BTreeMap<ServerId, u64>,
    /// When the snapshot was computed (ms since the epoch).
    pub computed_at_ms: u64,
}

impl MonitorData {
    /// Missing changes of a server, if it is known.
    pub fn missing_changes(&self, server_id: ServerId) -> Option<u64> {
        self.ds_missing_changes
            .get(&server_id)
            .or_else(|| self.rs_missing_changes.get(&server_id))
            .copied()
    }
}

/// Latest remote monitoring messages plus the last computed snapshot.
#[derive(Debug, Default)]
pub struct DomainMonitor {
    remote: Mutex<HashMap<ServerId, MonitorMsg>>,
    latest: Mutex<MonitorData>,
}

impl DomainMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the monitoring message received from relay peer `from`.
    pub fn receive(&self, from: ServerId, msg: MonitorMsg) {
        self.remote.lock().insert(from, msg);
    }

    /// Forget a relay peer that disconnected.
    pub fn forget(&self, server_id: ServerId) {
        self.remote.lock().remove(&server_id);
    }

    /// Last computed snapshot.
    pub fn latest(&self) -> MonitorData {
        self.latest.lock().clone()
    }

    /// Merge `local` (this server's own view) with the remote views.
    ///
    /// The result is both returned and kept as the latest snapshot. Counts
    /// below `floor` are reported as 0.
    pub fn compute(&self, local: &MonitorMsg, floor: u64) -> MonitorData {
        let merged = self.merged_view(local);

        let mut data = MonitorData {
            computed_at_ms: now_ms(),
            ..Default::default()
        };
        data.max_csns.update_all(&merged.rs_db_state);
        for peer in merged.ds_states.values().chain(merged.rs_states.values()) {
            data.max_csns.update_all(&peer.state);
        }

        for (server_id, peer) in &merged.ds_states {
            let missing = missing_changes(&data.max_csns, &peer.state, Some(*server_id));
            data.ds_missing_changes
                .insert(*server_id, apply_floor(missing, floor));
            data.ds_first_missing_ms
                .insert(*server_id, peer.approx_first_missing_ms);
        }
        for (server_id, peer) in &merged.rs_states {
            let missing = missing_changes(&data.max_csns, &peer.state, None);
            data.rs_missing_changes
                .insert(*server_id, apply_floor(missing, floor));
            data.rs_first_missing_ms
                .insert(*server_id, peer.approx_first_missing_ms);
        }

        *self.latest.lock() = data.clone();
        data
    }

    /// Topology-wide view: `local` completed with what relay peers reported.
    ///
    /// Local entries win; a relay peer's own change log state describes that
    /// relay peer.
    pub fn merged_view(&self, local: &MonitorMsg) -> MonitorMsg {
        let mut merged = local.clone();
        merged.rs_states.insert(
            local.sender,
            PeerMonitorState {
                state: local.rs_db_state.clone(),
                approx_first_missing_ms: 0,
            },
        );

        let remote = self.remote.lock();
        for (rs_id, msg) in remote.iter() {
            merged.rs_states.insert(
                *rs_id,
                PeerMonitorState {
                    state: msg.rs_db_state.clone(),
                    approx_first_missing_ms: 0,
                },
            );
            for (ds_id, peer) in &msg.ds_states {
                merged
                    .ds_states
                    .entry(*ds_id)
                    .or_insert_with(|| peer.clone());
            }
            for (other_rs, peer) in &msg.rs_states {
                merged
                    .rs_states
                    .entry(*other_rs)
                    .or_insert_with(|| peer.clone());
            }
        }
        merged
    }
}

fn missing_changes(max_csns: &ServerState, state: &ServerState, own_id: Option<ServerId>) -> u64 {
    max_csns
        .csns()
        .filter(|csn| Some(csn.server_id) != own_id)
        .map(|csn| Csn::diff_seq_num(Some(csn), state.get(csn.server_id)))
        .sum()
}

fn apply_floor(missing: u64, floor: u64) -> u64 {
    if missing < floor {
        0
    } else {
        missing
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(csns: &[(u64, u32, ServerId)]) -> ServerState {
        csns.iter().map(|(t, s, id)| Csn::new(*t, *s, *id)).collect()
    }

    fn peer_state(csns: &[(u64, u32, ServerId)]) -> PeerMonitorState {
        PeerMonitorState {
            state: state(csns),
            approx_first_missing_ms: 0,
        }
    }

    #[test]
    fn test_local_only() {
        let monitor = DomainMonitor::new();
        let mut local = MonitorMsg {
            sender: 100,
            rs_db_state: state(&[(50, 20, 1), (50, 10, 2)]),
            ..Default::default()
        };
        local.ds_states.insert(1, peer_state(&[(50, 20, 1), (40, 2, 2)]));
        local.ds_states.insert(2, peer_state(&[(50, 10, 2)]));

        let data = monitor.compute(&local, 0);
        assert_eq!(data.ds_missing_changes[&1], 8);
        assert_eq!(data.ds_missing_changes[&2], 20);
        assert_eq!(data.rs_missing_changes[&100], 0);
        assert_eq!(monitor.latest(), data);
    }

    #[test]
    fn test_floor_hides_noise() {
        let monitor = DomainMonitor::new();
        let mut local = MonitorMsg {
            sender: 100,
            rs_db_state: state(&[(50, 12, 1)]),
            ..Default::default()
        };
        local.ds_states.insert(2, peer_state(&[(50, 9, 1)]));
        let data = monitor.compute(&local, 5);
        assert_eq!(data.missing_changes(2), Some(0));

        let data = monitor.compute(&local, 3);
        assert_eq!(data.missing_changes(2), Some(3));
    }

    #[test]
    fn test_remote_view_extends_topology() {
        let monitor = DomainMonitor::new();
        let mut remote = MonitorMsg {
            sender: 200,
            rs_db_state: state(&[(60, 30, 7)]),
            ..Default::default()
        };
        remote.ds_states.insert(7, peer_state(&[(60, 30, 7)]));
        monitor.receive(200, remote);

        let mut local = MonitorMsg {
            sender: 100,
            rs_db_state: state(&[(60, 25, 7)]),
            ..Default::default()
        };
        local.ds_states.insert(1, peer_state(&[(60, 25, 7)]));

        let data = monitor.compute(&local, 0);
        assert_eq!(data.ds_missing_changes[&1], 5);
        assert_eq!(data.ds_missing_changes[&7], 0);
        assert_eq!(data.rs_missing_changes[&100], 5);
        assert_eq!(data.rs_missing_changes[&200], 0);

        monitor.forget(200);
        let data = monitor.compute(&local, 0);
        assert!(!data.ds_missing_changes.contains_key(&7));
    }
}
