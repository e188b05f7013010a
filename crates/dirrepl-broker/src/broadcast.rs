//! Coalescing of periodic and event-driven broadcasts.
//!
//! Topology changes, heartbeats and monitoring answers are not sent inline:
//! callers record the intent in a [`PendingBroadcastBatch`] and the
//! broadcaster task sends the whole batch at most once per cycle. Repeated
//! intents collapse (one topology message per peer, one heartbeat per origin,
//! one monitoring message per destination).

use crate::csn::ServerId;
use crate::message::{HeartbeatMsg, MonitorMsg};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::Notify;

/// Broadcast intents accumulated since the last drain.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingBroadcastBatch {
    /// Newest heartbeat per origin server, for relay peers.
    pub heartbeats: BTreeMap<ServerId, HeartbeatMsg>,
    /// Monitoring answers per destination data peer.
    pub ds_monitor_msgs: BTreeMap<ServerId, MonitorMsg>,
    /// Monitoring answers per destination relay peer.
    pub rs_monitor_msgs: BTreeMap<ServerId, MonitorMsg>,
    /// Send a topology message to the data peers.
    pub send_topology_to_ds: bool,
    /// Data peer left out of the topology send, if only one was requested.
    pub excluded_ds: Option<ServerId>,
    /// Send a topology message to the relay peers.
    pub send_topology_to_rs: bool,
}

impl PendingBroadcastBatch {
    /// True when there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.heartbeats.is_empty()
            && self.ds_monitor_msgs.is_empty()
            && self.rs_monitor_msgs.is_empty()
            && !self.send_topology_to_ds
            && !self.send_topology_to_rs
    }

    fn topology_to_data_peers_except(&mut self, excluded: Option<ServerId>) {
        if self.send_topology_to_ds {
            if self.excluded_ds != excluded {
                self.excluded_ds = None;
            }
        } else {
            self.send_topology_to_ds = true;
            self.excluded_ds = excluded;
        }
    }
}

/// Shared pending batch plus the wake-up of the broadcaster task.
#[derive(Debug, Default)]
pub struct CoalescingBroadcaster {
    batch: Mutex<PendingBroadcastBatch>,
    notify: Notify,
}

impl CoalescingBroadcaster {
    /// Create an empty broadcaster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay a heartbeat; only the newest one per origin is kept.
    pub fn enqueue_heartbeat(&self, heartbeat: HeartbeatMsg) {
        {
            let mut batch = self.batch.lock();
            let origin = heartbeat.csn.server_id;
            match batch.heartbeats.get(&origin) {
                Some(current) if current.csn >= heartbeat.csn => {}
                _ => {
                    batch.heartbeats.insert(origin, heartbeat);
                }
            }
        }
        self.notify.notify_one();
    }

    /// Answer a data peer's monitoring request.
    pub fn enqueue_ds_monitor(&self, destination: ServerId, msg: MonitorMsg) {
        self.batch.lock().ds_monitor_msgs.insert(destination, msg);
        self.notify.notify_one();
    }

    /// Answer a relay peer's monitoring request.
    pub fn enqueue_rs_monitor(&self, destination: ServerId, msg: MonitorMsg) {
        self.batch.lock().rs_monitor_msgs.insert(destination, msg);
        self.notify.notify_one();
    }

    /// Send topology to every data peer except `excluded`.
    ///
    /// Two requests excluding different peers in the same cycle exclude none.
    pub fn enqueue_topology_to_data_peers(&self, excluded: Option<ServerId>) {
        self.batch.lock().topology_to_data_peers_except(excluded);
        self.notify.notify_one();
    }

    /// Send topology to everyone except the data peer `excluded`.
    pub fn enqueue_topology_to_all(&self, excluded: Option<ServerId>) {
        {
            let mut batch = self.batch.lock();
            batch.topology_to_data_peers_except(excluded);
            batch.send_topology_to_rs = true;
        }
        self.notify.notify_one();
    }

    /// Take the pending batch, leaving an empty one.
    pub fn drain(&self) -> PendingBroadcastBatch {
        std::mem::take(&mut *self.batch.lock())
    }

    /// Wait until something is enqueued.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::Csn;

    #[test]
    fn test_drain_resets() {
        let broadcaster = CoalescingBroadcaster::new();
        broadcaster.enqueue_topology_to_all(None);
        let batch = broadcaster.drain();
        assert!(batch.send_topology_to_rs);
        assert!(batch.send_topology_to_ds);
        assert!(broadcaster.drain().is_empty());
    }

    #[test]
    fn test_heartbeats_keep_newest_per_origin() {
        let broadcaster = CoalescingBroadcaster::new();
        broadcaster.enqueue_heartbeat(HeartbeatMsg { csn: Csn::new(20, 0, 1) });
        broadcaster.enqueue_heartbeat(HeartbeatMsg { csn: Csn::new(10, 0, 1) });
        broadcaster.enqueue_heartbeat(HeartbeatMsg { csn: Csn::new(15, 0, 2) });
        let batch = broadcaster.drain();
        assert_eq!(batch.heartbeats.len(), 2);
        assert_eq!(batch.heartbeats[&1].csn, Csn::new(20, 0, 1));
    }

    #[test]
    fn test_exclusion_merging() {
        let broadcaster = CoalescingBroadcaster::new();
        broadcaster.enqueue_topology_to_data_peers(Some(3));
        broadcaster.enqueue_topology_to_data_peers(Some(3));
        assert_eq!(broadcaster.drain().excluded_ds, Some(3));

        broadcaster.enqueue_topology_to_data_peers(Some(3));
        broadcaster.enqueue_topology_to_data_peers(Some(4));
        let batch = broadcaster.drain();
        assert!(batch.send_topology_to_ds);
        assert_eq!(batch.excluded_ds, None);

        broadcaster.enqueue_topology_to_all(None);
        broadcaster.enqueue_topology_to_data_peers(Some(5));
        assert_eq!(broadcaster.drain().excluded_ds, None);
    }

    #[test]
    fn test_monitor_msgs_per_destination() {
        let broadcaster = CoalescingBroadcaster::new();
        broadcaster.enqueue_ds_monitor(5, MonitorMsg { sender: 1, destination: 5, ..Default::default() });
        broadcaster.enqueue_ds_monitor(5, MonitorMsg { sender: 2, destination: 5, ..Default::default() });
        broadcaster.enqueue_rs_monitor(9, MonitorMsg::default());
        let batch = broadcaster.drain();
        assert_eq!(batch.ds_monitor_msgs.len(), 1);
        assert_eq!(batch.ds_monitor_msgs[&5].sender, 2);
        assert_eq!(batch.rs_monitor_msgs.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_enqueue() {
        let broadcaster = std::sync::Arc::new(CoalescingBroadcaster::new());
        broadcaster.enqueue_topology_to_all(Some(1));
        tokio::time::timeout(std::time::Duration::from_secs(1), broadcaster.wait())
            .await
            .unwrap();
    }
}
