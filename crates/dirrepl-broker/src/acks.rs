//! Assured replication: aggregation of acknowledgments per update.
//!
//! For every assured update that needs acks from other servers the hub
//! registers an [`AssuredPlan`]. The aggregator keeps one record per CSN,
//! collects acks from the expected peers and sends exactly one [`AckMsg`] back
//! to the requester: either when the expectation is met or when the record's
//! timer fires, whichever comes first.

use crate::csn::{Csn, ServerId};
use crate::error::{BrokerError, Result};
use crate::message::{AckMsg, AssuredMode, ReplMessage};
use crate::peer::{AssuredCounter, PeerHandle};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// What an assured update waits for.
#[derive(Debug, Clone)]
pub struct AssuredPlan {
    /// CSN of the update.
    pub csn: Csn,
    /// Assured sub-mode.
    pub mode: AssuredMode,
    /// Peers whose ack counts.
    pub expected: Vec<Arc<PeerHandle>>,
    /// Acks needed to complete (safe-data); ignored in safe-read mode.
    pub required: usize,
    /// Peers skipped because they were not in normal status (safe-read).
    pub wrong_status: Vec<ServerId>,
}

#[derive(Debug)]
struct AckRecord {
    completed: bool,
    expected: HashMap<ServerId, Weak<PeerHandle>>,
    received: BTreeSet<ServerId>,
    required: usize,
    wrong_status: Vec<ServerId>,
    failed: BTreeSet<ServerId>,
    has_replay_error: bool,
}

impl AckRecord {
    fn is_complete(&self, mode: AssuredMode) -> bool {
        match mode {
            AssuredMode::SafeData => self.received.len() >= self.required,
            AssuredMode::SafeRead => self.received.len() >= self.expected.len(),
        }
    }

    fn to_ack(&self, csn: Csn, mode: AssuredMode, timed_out: bool) -> AckMsg {
        let mut failed = self.failed.clone();
        let mut has_timeout = false;
        if timed_out {
            for server_id in self.expected.keys() {
                if !self.received.contains(server_id) {
                    failed.insert(*server_id);
                    has_timeout = true;
                }
            }
        }
        let has_wrong_status = mode == AssuredMode::SafeRead && !self.wrong_status.is_empty();
        if has_wrong_status {
            failed.extend(self.wrong_status.iter().copied());
        }
        AckMsg {
            csn,
            has_timeout,
            has_wrong_status,
            has_replay_error: self.has_replay_error,
            failed_servers: failed.into_iter().collect(),
        }
    }
}

#[derive(Debug)]
struct AckEntry {
    csn: Csn,
    mode: AssuredMode,
    requester: Weak<PeerHandle>,
    record: Mutex<AckRecord>,
    timer: Mutex<Option<AbortHandle>>,
}

impl AckEntry {
    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

/// Waiting-acks table of one domain.
#[derive(Debug)]
pub struct AckAggregator {
    base_dn: String,
    timeout: Duration,
    waiting: Mutex<HashMap<Csn, Arc<AckEntry>>>,
}

impl AckAggregator {
    /// Create an aggregator whose records expire after `timeout`.
    pub fn new(base_dn: impl Into<String>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            base_dn: base_dn.into(),
            timeout,
            waiting: Mutex::new(HashMap::new()),
        })
    }

    /// Start waiting for the acks described by `plan` on behalf of `requester`.
    ///
    /// Fails when a record for the same CSN is still live.
    pub fn register(self: &Arc<Self>, requester: &Arc<PeerHandle>, plan: AssuredPlan) -> Result<()> {
        let csn = plan.csn;
        let entry = {
            let mut waiting = self.waiting.lock();
            if waiting.contains_key(&csn) {
                return Err(BrokerError::DuplicateAssuredCsn { csn });
            }
            for peer in &plan.expected {
                peer.incr_assured(plan.mode, AssuredCounter::SentUpdate);
            }
            let entry = Arc::new(AckEntry {
                csn,
                mode: plan.mode,
                requester: Arc::downgrade(requester),
                record: Mutex::new(AckRecord {
                    completed: false,
                    expected: plan
                        .expected
                        .iter()
                        .map(|peer| (peer.server_id(), Arc::downgrade(peer)))
                        .collect(),
                    received: BTreeSet::new(),
                    required: plan.required,
                    wrong_status: plan.wrong_status,
                    failed: BTreeSet::new(),
                    has_replay_error: false,
                }),
                timer: Mutex::new(None),
            });
            waiting.insert(csn, Arc::clone(&entry));
            entry
        };

        let aggregator = Arc::downgrade(self);
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(aggregator) = aggregator.upgrade() {
                aggregator.expire(csn);
            }
        });
        *entry.timer.lock() = Some(timer.abort_handle());
        debug!(base_dn = %self.base_dn, %csn, mode = ?plan.mode, "waiting for assured acks");
        Ok(())
    }

    /// Account for an ack received from `from`.
    pub fn process_ack(&self, from: &PeerHandle, ack: &AckMsg) {
        let Some(entry) = self.waiting.lock().get(&ack.csn).cloned() else {
            debug!(base_dn = %self.base_dn, csn = %ack.csn, server_id = from.server_id(), "ack for unknown or completed update");
            return;
        };

        let reply = {
            let mut record = entry.record.lock();
            if record.completed {
                return;
            }
            if !record.expected.contains_key(&from.server_id()) {
                warn!(base_dn = %self.base_dn, csn = %ack.csn, server_id = from.server_id(), "ack from a server that was not expected");
                return;
            }
            if !record.received.insert(from.server_id()) {
                return;
            }
            if entry.mode == AssuredMode::SafeRead && !ack.is_success() {
                record.has_replay_error |= ack.has_replay_error;
                record.failed.extend(ack.failed_servers.iter().copied());
                if ack.failed_servers.is_empty() {
                    record.failed.insert(from.server_id());
                }
            }
            if !record.is_complete(entry.mode) {
                return;
            }
            record.completed = true;
            record.to_ack(entry.csn, entry.mode, false)
        };

        self.finish(&entry, reply);
    }

    fn expire(&self, csn: Csn) {
        let Some(entry) = self.waiting.lock().get(&csn).cloned() else {
            return;
        };

        let (reply, late) = {
            let mut record = entry.record.lock();
            if record.completed {
                return;
            }
            record.completed = true;
            let late: Vec<Arc<PeerHandle>> = record
                .expected
                .iter()
                .filter(|(server_id, _)| !record.received.contains(*server_id))
                .filter_map(|(_, peer)| peer.upgrade())
                .collect();
            (record.to_ack(entry.csn, entry.mode, true), late)
        };

        if let Some(requester) = entry.requester.upgrade() {
            requester.incr_assured(entry.mode, AssuredCounter::ReceivedTimeout);
        }
        for peer in &late {
            if entry.mode == AssuredMode::SafeRead || peer.is_relay_peer() {
                peer.incr_assured(entry.mode, AssuredCounter::SentTimeout);
            }
        }
        warn!(
            base_dn = %self.base_dn,
            %csn,
            failed = ?reply.failed_servers,
            "assured update timed out waiting for acks"
        );
        self.finish(&entry, reply);
    }

    fn finish(&self, entry: &Arc<AckEntry>, reply: AckMsg) {
        self.waiting.lock().remove(&entry.csn);
        entry.cancel_timer();
        match entry.requester.upgrade() {
            Some(requester) => {
                if let Err(e) = requester.send_control(ReplMessage::Ack(reply)) {
                    debug!(base_dn = %self.base_dn, csn = %entry.csn, error = %e, "could not return ack");
                }
            }
            None => debug!(base_dn = %self.base_dn, csn = %entry.csn, "requester gone before ack"),
        }
    }

    /// Number of live records.
    pub fn pending(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Drop every record and stop their timers without replying.
    pub fn cancel_all(&self) {
        let entries: Vec<Arc<AckEntry>> = self.waiting.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.record.lock().completed = true;
            entry.cancel_timer();
        }
    }
}

/// Reply to an assured update that needs no other server's ack.
pub fn send_immediate_ack(requester: &PeerHandle, csn: Csn) {
    if let Err(e) = requester.send_control(ReplMessage::Ack(AckMsg::success(csn))) {
        debug!(%csn, server_id = requester.server_id(), error = %e, "could not send immediate ack");
    }
}
