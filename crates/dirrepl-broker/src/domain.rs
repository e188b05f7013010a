//! The per-domain hub: one instance per replicated base DN.
//!
//! The hub owns the set of connected peers and the domain generation id. It
//! fans updates out, drives assured replication, keeps the topology
//! consistent and routes directed messages. Shared state lives in
//! [`HubState`] behind the domain lock (`tokio::sync::Mutex`). That lock is
//! not reentrant, so operations that may run while the caller already holds
//! it come in a `*_locked` form taking `&mut HubState`.

use crate::acks::{send_immediate_ack, AckAggregator, AssuredPlan};
use crate::broadcast::{CoalescingBroadcaster, PendingBroadcastBatch};
use crate::changelog::{ChangelogCursor, ChangelogDb};
use crate::config::BrokerConfig;
use crate::csn::{ServerId, ServerState};
use crate::error::{BrokerError, Result};
use crate::message::{
    AckMsg, AssuredMode, ChangeStatusMsg, Destination, DsInfo, HeartbeatMsg, MonitorMsg,
    MonitorRequestMsg, PeerKind, ReplMessage, ResetGenerationIdMsg, RoutableMsg,
    RoutablePayload, RsInfo, TopologyMsg, UpdateMsg, UpdateView, REPLICATION_PROTOCOL_V2,
    REPLICATION_PROTOCOL_V3,
};
use crate::monitor::{DomainMonitor, MonitorData};
use crate::peer::{is_different_generation_id, AssuredCounter, PeerHandle};
use crate::server::ServerShutdown;
use crate::status::{compute_new_status, status_to_event, ServerStatus, StatusEvent};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before retrying a failed topology send.
const TOPOLOGY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Shared state of a domain, guarded by the domain lock.
#[derive(Debug)]
pub struct HubState {
    generation_id: i64,
    generation_id_pinned: bool,
    data_peers: BTreeMap<ServerId, Arc<PeerHandle>>,
    relay_peers: BTreeMap<ServerId, Arc<PeerHandle>>,
}

impl HubState {
    fn new() -> Self {
        Self {
            generation_id: -1,
            generation_id_pinned: false,
            data_peers: BTreeMap::new(),
            relay_peers: BTreeMap::new(),
        }
    }

    /// Domain generation id, -1 when unset.
    pub fn generation_id(&self) -> i64 {
        self.generation_id
    }

    /// True once an update was stored under the current generation id.
    pub fn is_generation_id_pinned(&self) -> bool {
        self.generation_id_pinned
    }

    /// Connected directory servers.
    pub fn data_peers(&self) -> impl Iterator<Item = &Arc<PeerHandle>> {
        self.data_peers.values()
    }

    /// Connected replication servers.
    pub fn relay_peers(&self) -> impl Iterator<Item = &Arc<PeerHandle>> {
        self.relay_peers.values()
    }

    fn peers_of(&self, kind: PeerKind) -> &BTreeMap<ServerId, Arc<PeerHandle>> {
        match kind {
            PeerKind::DataPeer => &self.data_peers,
            PeerKind::RelayPeer => &self.relay_peers,
        }
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The peer is now part of the domain.
    Registered,
    /// Same server already connected over the same link; drop the new one.
    DuplicateLink,
}

/// How a generation id seen on a peer was reconciled with the domain's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Nothing to do: same id, or the peer has none.
    Unchanged,
    /// The domain had no generation id and adopted the peer's.
    Adopted,
    /// The domain had no stored update; the id was replaced and history cleared.
    Replaced,
    /// The domain id is pinned; the peer was flagged.
    Mismatch,
}

/// Monitoring summary of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    /// Domain base DN.
    pub base_dn: String,
    /// Local replication server id.
    pub server_id: ServerId,
    /// Domain generation id.
    pub generation_id: i64,
    /// Whether the generation id is pinned.
    pub generation_id_pinned: bool,
    /// Connected directory servers and their status.
    pub data_peers: BTreeMap<ServerId, ServerStatus>,
    /// Connected replication servers.
    pub relay_peers: Vec<ServerId>,
    /// Missing changes per known server.
    pub missing_changes: BTreeMap<ServerId, u64>,
    /// Assured updates waiting for acks.
    pub pending_acks: usize,
}

/// Broker for one replicated domain.
pub struct DomainHub {
    base_dn: String,
    config: Arc<BrokerConfig>,
    changelog: Arc<dyn ChangelogDb>,
    state: Mutex<HubState>,
    generation_mirror: Arc<AtomicI64>,
    acks: Arc<AckAggregator>,
    broadcaster: CoalescingBroadcaster,
    monitor: DomainMonitor,
    server_shutdown: ServerShutdown,
    stopped: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for DomainHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainHub")
            .field("base_dn", &self.base_dn)
            .field("server_id", &self.config.server_id)
            .field("generation_id", &self.generation_mirror.load(Ordering::Acquire))
            .finish()
    }
}

impl DomainHub {
    /// Create the hub of `base_dn`. Background tasks start with [`DomainHub::start`].
    pub fn new(
        base_dn: impl Into<String>,
        config: Arc<BrokerConfig>,
        changelog: Arc<dyn ChangelogDb>,
        server_shutdown: ServerShutdown,
    ) -> Arc<Self> {
        let base_dn = base_dn.into();
        Arc::new(Self {
            acks: AckAggregator::new(base_dn.clone(), config.assured_timeout()),
            base_dn,
            config,
            changelog,
            state: Mutex::new(HubState::new()),
            generation_mirror: Arc::new(AtomicI64::new(-1)),
            broadcaster: CoalescingBroadcaster::new(),
            monitor: DomainMonitor::new(),
            server_shutdown,
            stopped: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Spawn the broadcaster, status evaluator and monitoring publisher.
    pub fn start(self: &Arc<Self>) {
        let handles = crate::tasks::spawn_domain_tasks(self);
        self.tasks.lock().extend(handles);
        info!(base_dn = %self.base_dn, server_id = self.config.server_id, "replication domain started");
    }

    /// Base DN of the domain.
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Configuration of the local server.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Id of the local replication server.
    pub fn local_server_id(&self) -> ServerId {
        self.config.server_id
    }

    /// The change log collaborator.
    pub fn changelog(&self) -> &Arc<dyn ChangelogDb> {
        &self.changelog
    }

    /// The waiting-acks table.
    pub fn acks(&self) -> &AckAggregator {
        &self.acks
    }

    /// The pending broadcast batch.
    pub fn broadcaster(&self) -> &CoalescingBroadcaster {
        &self.broadcaster
    }

    /// Monitoring state.
    pub fn monitor(&self) -> &DomainMonitor {
        &self.monitor
    }

    /// Process-level shutdown handle.
    pub fn server_shutdown(&self) -> &ServerShutdown {
        &self.server_shutdown
    }

    /// True once [`DomainHub::shutdown`] was called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Take the domain lock.
    pub async fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().await
    }

    /// Take the domain lock, giving up after `timeout`.
    pub async fn lock_with_timeout(&self, timeout: Duration) -> Result<MutexGuard<'_, HubState>> {
        tokio::time::timeout(timeout, self.state.lock())
            .await
            .map_err(|_| BrokerError::LockTimeout {
                base_dn: self.base_dn.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    /// Domain generation id.
    pub async fn generation_id(&self) -> i64 {
        self.state.lock().await.generation_id
    }

    /// Connected peer with this id, if any.
    pub async fn peer(&self, server_id: ServerId) -> Option<Arc<PeerHandle>> {
        let state = self.state.lock().await;
        state
            .data_peers
            .get(&server_id)
            .or_else(|| state.relay_peers.get(&server_id))
            .cloned()
    }

    /// Ids of the connected directory servers.
    pub async fn data_peer_ids(&self) -> Vec<ServerId> {
        self.state.lock().await.data_peers.keys().copied().collect()
    }

    /// Ids of the connected replication servers.
    pub async fn relay_peer_ids(&self) -> Vec<ServerId> {
        self.state.lock().await.relay_peers.keys().copied().collect()
    }

    /// Replay the stored updates not covered by `from`.
    pub fn cursor_from(&self, from: &ServerState) -> Result<Box<dyn ChangelogCursor>> {
        self.changelog.cursor_from(&self.base_dn, from)
    }

    /// Newest stored CSN per origin.
    pub fn latest_server_state(&self) -> ServerState {
        self.changelog.newest_state(&self.base_dn)
    }

    /// Oldest stored CSN per origin.
    pub fn oldest_server_state(&self) -> ServerState {
        self.changelog.oldest_state(&self.base_dn)
    }

    fn local_rs_info(&self, state: &HubState) -> RsInfo {
        RsInfo {
            server_id: self.config.server_id,
            server_url: self.config.server_url.clone(),
            generation_id: state.generation_id,
            group_id: self.config.group_id,
            weight: self.config.weight,
        }
    }

    // ------------------------------------------------------------------
    // Peer set
    // ------------------------------------------------------------------

    /// Add an established peer to the domain.
    pub async fn register_peer(&self, peer: &Arc<PeerHandle>) -> Result<RegisterOutcome> {
        let mut state = self.state.lock().await;
        self.register_peer_locked(&mut state, peer)
    }

    /// [`DomainHub::register_peer`] with the domain lock already held.
    pub fn register_peer_locked(
        &self,
        state: &mut HubState,
        peer: &Arc<PeerHandle>,
    ) -> Result<RegisterOutcome> {
        if self.check_admission_locked(state, peer)? == RegisterOutcome::DuplicateLink {
            return Ok(RegisterOutcome::DuplicateLink);
        }

        let server_id = peer.server_id();
        match peer.kind() {
            PeerKind::DataPeer => {
                state.data_peers.insert(server_id, Arc::clone(peer));
                self.broadcaster.enqueue_topology_to_all(Some(server_id));
            }
            PeerKind::RelayPeer => {
                state.relay_peers.insert(server_id, Arc::clone(peer));
                self.broadcaster.enqueue_topology_to_data_peers(None);
            }
        }
        info!(base_dn = %self.base_dn, server_id, kind = ?peer.kind(), "peer registered");
        Ok(RegisterOutcome::Registered)
    }

    /// Whether `peer` may join without touching the domain.
    ///
    /// `Registered` means the server id is free; a second link from the same
    /// server yields `DuplicateLink`, the same id from elsewhere an error.
    pub fn check_admission_locked(
        &self,
        state: &HubState,
        peer: &Arc<PeerHandle>,
    ) -> Result<RegisterOutcome> {
        let server_id = peer.server_id();
        if let Some(existing) = state.peers_of(peer.kind()).get(&server_id) {
            let same_link = match peer.kind() {
                PeerKind::DataPeer => existing.remote_addr() == peer.remote_addr(),
                PeerKind::RelayPeer => existing.server_url() == peer.server_url(),
            };
            if same_link {
                debug!(
                    base_dn = %self.base_dn,
                    server_id,
                    addr = %peer.remote_addr(),
                    "duplicate link to an already connected server, dropping the new one"
                );
                return Ok(RegisterOutcome::DuplicateLink);
            }
            warn!(
                base_dn = %self.base_dn,
                server_id,
                existing = %existing.remote_addr(),
                rejected = %peer.remote_addr(),
                "server id already connected, rejecting new connection"
            );
            return Err(BrokerError::DuplicateServerId {
                server_id,
                existing_addr: existing.remote_addr().to_string(),
                rejected_addr: peer.remote_addr().to_string(),
            });
        }
        Ok(RegisterOutcome::Registered)
    }

    /// Remove `peer` from the peer set; a newer handle with the same id stays.
    pub fn unregister_peer_locked(&self, state: &mut HubState, peer: &Arc<PeerHandle>) -> bool {
        let peers = match peer.kind() {
            PeerKind::DataPeer => &mut state.data_peers,
            PeerKind::RelayPeer => &mut state.relay_peers,
        };
        match peers.get(&peer.server_id()) {
            Some(current) if Arc::ptr_eq(current, peer) => {
                peers.remove(&peer.server_id());
                true
            }
            _ => false,
        }
    }

    /// Spawn the reader and writer tasks of a registered peer.
    pub fn start_peer(self: &Arc<Self>, peer: &Arc<PeerHandle>) {
        tokio::spawn(Arc::clone(peer).run_writer(
            Arc::clone(&self.changelog),
            Arc::clone(&self.generation_mirror),
        ));
        tokio::spawn(Arc::clone(self).run_reader(Arc::clone(peer)));
    }

    /// Disconnect a peer and tell the rest of the topology.
    ///
    /// Only the first caller for a given peer does anything.
    pub async fn stop_peer(&self, peer: &Arc<PeerHandle>) {
        if !peer.engage_shutdown() {
            return;
        }
        let mut state = self.state.lock().await;
        self.stop_peer_locked(&mut state, peer).await;
    }

    /// [`DomainHub::stop_peer`] with the domain lock held and shutdown engaged.
    pub async fn stop_peer_locked(&self, state: &mut HubState, peer: &Arc<PeerHandle>) {
        let removed = self.unregister_peer_locked(state, peer);
        peer.set_status(compute_or_keep(peer.status(), StatusEvent::ToNotConnected));
        peer.close().await;
        if peer.is_relay_peer() {
            self.monitor.forget(peer.server_id());
        }
        if !removed {
            return;
        }
        info!(base_dn = %self.base_dn, server_id = peer.server_id(), kind = ?peer.kind(), "peer stopped");

        self.reset_generation_id_if_eligible_locked(state);
        if !self.is_stopped() {
            if peer.is_data_peer() {
                self.broadcaster.enqueue_topology_to_all(None);
            } else {
                self.broadcaster.enqueue_topology_to_data_peers(None);
            }
        }
    }

    /// Stop every peer, pending ack timers and background tasks.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let mut state = self.state.lock().await;
        let peers: Vec<Arc<PeerHandle>> = state
            .data_peers
            .values()
            .chain(state.relay_peers.values())
            .cloned()
            .collect();
        for peer in peers {
            if peer.engage_shutdown() {
                self.stop_peer_locked(&mut state, &peer).await;
            }
        }
        self.acks.cancel_all();
        info!(base_dn = %self.base_dn, "replication domain stopped");
    }

    // ------------------------------------------------------------------
    // Generation id
    // ------------------------------------------------------------------

    fn set_generation_id_locked(&self, state: &mut HubState, generation_id: i64) {
        state.generation_id = generation_id;
        self.generation_mirror.store(generation_id, Ordering::Release);
    }

    /// Adopt `generation_id` when the domain has none.
    pub fn set_generation_id_if_unset_locked(&self, state: &mut HubState, generation_id: i64) -> bool {
        if state.generation_id < 0 && generation_id >= 0 {
            self.set_generation_id_locked(state, generation_id);
            info!(base_dn = %self.base_dn, generation_id, "generation id set");
            return true;
        }
        false
    }

    /// Switch to `generation_id`, dropping the stored history when it differs.
    pub fn change_generation_id_locked(&self, state: &mut HubState, generation_id: i64) {
        if state.generation_id == generation_id {
            return;
        }
        if let Err(e) = self.changelog.remove_all(&self.base_dn) {
            error!(base_dn = %self.base_dn, error = %e, "could not clear change log");
        }
        info!(
            base_dn = %self.base_dn,
            old = state.generation_id,
            new = generation_id,
            "generation id changed, history cleared"
        );
        self.set_generation_id_locked(state, generation_id);
        state.generation_id_pinned = false;
    }

    /// Reconcile the generation id of a connecting or reporting peer.
    pub fn reconcile_generation_id_locked(
        &self,
        state: &mut HubState,
        new_id: i64,
        from_peer: Option<&Arc<PeerHandle>>,
    ) -> GenerationOutcome {
        if new_id < 0 || state.generation_id == new_id {
            return GenerationOutcome::Unchanged;
        }
        if state.generation_id < 0 {
            self.set_generation_id_locked(state, new_id);
            info!(base_dn = %self.base_dn, generation_id = new_id, "generation id adopted");
            return GenerationOutcome::Adopted;
        }
        if !state.generation_id_pinned {
            self.change_generation_id_locked(state, new_id);
            return GenerationOutcome::Replaced;
        }

        let server_id = from_peer.map(|p| p.server_id()).unwrap_or(-1);
        warn!(
            base_dn = %self.base_dn,
            server_id,
            domain_generation_id = state.generation_id,
            peer_generation_id = new_id,
            "generation id mismatch"
        );
        if let Some(peer) = from_peer.filter(|p| p.is_data_peer()) {
            self.change_status_locked(state, peer, ServerStatus::BadGenerationId);
        }
        GenerationOutcome::Mismatch
    }

    /// Forget the generation id when nothing can vouch for it anymore.
    pub fn reset_generation_id_if_eligible_locked(&self, state: &mut HubState) -> bool {
        if state.generation_id_pinned || state.generation_id == -1 || !state.data_peers.is_empty() {
            return false;
        }
        let generation_id = state.generation_id;
        let remote_data_peer = state.relay_peers.values().any(|rs| {
            !is_different_generation_id(generation_id, rs.generation_id()) && rs.has_remote_data_peers()
        });
        if remote_data_peer {
            return false;
        }
        self.change_generation_id_locked(state, -1);
        true
    }

    /// Apply an administrative generation id reset sent by `sender`.
    pub async fn reset_generation_id(&self, sender: &Arc<PeerHandle>, msg: ResetGenerationIdMsg) {
        let mut state = self.state.lock().await;
        let new_id = msg.generation_id;
        info!(base_dn = %self.base_dn, server_id = sender.server_id(), generation_id = new_id, "generation id reset requested");

        if new_id != state.generation_id {
            self.change_generation_id_locked(&mut state, new_id);
        }

        let relays: Vec<Arc<PeerHandle>> = state.relay_peers.values().cloned().collect();
        for rs in relays {
            rs.set_generation_id(new_id);
            if sender.is_data_peer() {
                if let Err(e) = rs.send_control(ReplMessage::ResetGenerationId(msg)) {
                    debug!(base_dn = %self.base_dn, server_id = rs.server_id(), error = %e, "could not forward generation id reset");
                }
            }
        }

        let data_peers: Vec<Arc<PeerHandle>> = state.data_peers.values().cloned().collect();
        for ds in data_peers {
            self.change_status_for_reset_gen_id_locked(&mut state, &ds, new_id).await;
        }

        self.broadcaster.enqueue_topology_to_all(None);
    }

    async fn change_status_for_reset_gen_id_locked(
        &self,
        state: &mut HubState,
        ds: &Arc<PeerHandle>,
        new_id: i64,
    ) {
        let event = if new_id == -1 {
            StatusEvent::ToBadGenerationId
        } else if ds.generation_id() == new_id {
            if ds.status() == ServerStatus::BadGenerationId {
                info!(
                    base_dn = %self.base_dn,
                    server_id = ds.server_id(),
                    "generation id matches again, forcing reconnection"
                );
                if ds.engage_shutdown() {
                    self.stop_peer_locked(state, ds).await;
                }
            }
            return;
        } else {
            StatusEvent::ToBadGenerationId
        };

        if ds.status() == ServerStatus::FullUpdate {
            info!(
                base_dn = %self.base_dn,
                server_id = ds.server_id(),
                "ignoring bad generation id while in full update"
            );
            return;
        }
        let new_status = compute_new_status(ds.status(), event);
        if new_status == ServerStatus::Invalid {
            warn!(base_dn = %self.base_dn, server_id = ds.server_id(), status = %ds.status(), ?event, "cannot apply status event");
            return;
        }
        self.notify_status_change(ds, new_status);
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    fn notify_status_change(&self, ds: &PeerHandle, new_status: ServerStatus) {
        let msg = ChangeStatusMsg {
            requested_status: Some(new_status),
            new_status: None,
        };
        if let Err(e) = ds.send_control(ReplMessage::ChangeStatus(msg)) {
            debug!(base_dn = %self.base_dn, server_id = ds.server_id(), error = %e, "could not send status change");
        }
        let old = ds.status();
        ds.set_status(new_status);
        info!(base_dn = %self.base_dn, server_id = ds.server_id(), %old, new = %new_status, "status changed");
    }

    /// Move a data peer to `new_status` on the local server's initiative.
    ///
    /// Returns false when the transition is illegal or a no-op.
    pub async fn change_status(&self, ds: &Arc<PeerHandle>, new_status: ServerStatus) -> bool {
        let mut state = self.state.lock().await;
        self.change_status_locked(&mut state, ds, new_status)
    }

    /// [`DomainHub::change_status`] with the domain lock held.
    pub fn change_status_locked(
        &self,
        _state: &mut HubState,
        ds: &Arc<PeerHandle>,
        new_status: ServerStatus,
    ) -> bool {
        let Some(event) = status_to_event(new_status) else {
            return false;
        };
        let current = ds.status();
        let computed = compute_new_status(current, event);
        if computed == ServerStatus::Invalid {
            warn!(base_dn = %self.base_dn, server_id = ds.server_id(), %current, ?event, "illegal status transition");
            return false;
        }
        if computed == current {
            return false;
        }
        self.notify_status_change(ds, computed);
        self.broadcaster.enqueue_topology_to_all(Some(ds.server_id()));
        true
    }

    /// A data peer announced a status change.
    pub async fn process_new_status(&self, ds: &Arc<PeerHandle>, msg: ChangeStatusMsg) -> ServerStatus {
        let _state = self.state.lock().await;
        let Some(requested) = msg.new_status else {
            warn!(base_dn = %self.base_dn, server_id = ds.server_id(), "status message without a new status");
            return ServerStatus::Invalid;
        };
        let Some(event) = status_to_event(requested) else {
            return ServerStatus::Invalid;
        };
        let current = ds.status();
        let new_status = compute_new_status(current, event);
        if new_status == ServerStatus::Invalid {
            warn!(base_dn = %self.base_dn, server_id = ds.server_id(), %current, %requested, "illegal status change requested by directory server");
            return ServerStatus::Invalid;
        }
        ds.set_status(new_status);
        info!(base_dn = %self.base_dn, server_id = ds.server_id(), old = %current, new = %new_status, "directory server changed status");
        self.broadcaster.enqueue_topology_to_all(Some(ds.server_id()));
        new_status
    }

    /// One pass of the status evaluator.
    ///
    /// Returns the number of status changes made.
    pub async fn check_degraded_status(&self) -> usize {
        let threshold = self.config.degraded_status_threshold;
        if threshold == 0 {
            return 0;
        }
        let mut state = self.state.lock().await;
        let newest = self.changelog.newest_state(&self.base_dn);
        let data_peers: Vec<Arc<PeerHandle>> = state.data_peers.values().cloned().collect();
        let mut changed = 0;
        for ds in data_peers {
            let backlog = ds.backlog(&newest);
            let target = match ds.status() {
                ServerStatus::Normal if backlog >= threshold => ServerStatus::Degraded,
                ServerStatus::Degraded if backlog < threshold => ServerStatus::Normal,
                _ => continue,
            };
            debug!(base_dn = %self.base_dn, server_id = ds.server_id(), backlog, threshold, "status evaluator");
            if self.change_status_locked(&mut state, &ds, target) {
                changed += 1;
            }
        }
        changed
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Store an update received from `source` and fan it out.
    pub async fn accept_update(&self, update: UpdateMsg, source: &Arc<PeerHandle>) -> Result<()> {
        let update = Arc::new(update);
        let csn = update.csn;
        source.update_server_state(csn);
        if update.assured {
            source.incr_assured(update.assured_mode, AssuredCounter::ReceivedUpdate);
        }

        let mut state = self.state.lock().await;
        self.set_generation_id_if_unset_locked(&mut state, source.generation_id());

        let expected = if update.assured {
            self.prepare_assured_locked(&state, &update, source)?
        } else {
            None
        };

        if let Err(e) = self.changelog.append(&self.base_dn, &update) {
            error!(base_dn = %self.base_dn, %csn, error = %e, "cannot store update, shutting down");
            self.server_shutdown
                .trigger(format!("change log failure on {}: {}", self.base_dn, e));
            return Err(e);
        }
        if state.generation_id >= 0 {
            state.generation_id_pinned = true;
        }

        let view_for = |peer: &PeerHandle| match &expected {
            Some(ids) if !ids.contains(&peer.server_id()) => UpdateView::NotAssured(Arc::clone(&update)),
            _ => UpdateView::Assured(Arc::clone(&update)),
        };

        if source.is_data_peer() {
            for rs in state.relay_peers.values() {
                if is_different_generation_id(state.generation_id, rs.generation_id()) {
                    debug!(base_dn = %self.base_dn, server_id = rs.server_id(), %csn, "skipping relay peer with another generation id");
                    continue;
                }
                rs.push_update(view_for(rs));
            }
        }
        for ds in state.data_peers.values() {
            if ds.server_id() == source.server_id() {
                continue;
            }
            match ds.status() {
                ServerStatus::BadGenerationId => {
                    debug!(base_dn = %self.base_dn, server_id = ds.server_id(), %csn, "skipping directory server with bad generation id");
                    continue;
                }
                ServerStatus::FullUpdate => continue,
                _ => {}
            }
            ds.push_update(view_for(ds));
        }
        Ok(())
    }

    /// Work out who must ack `update` and register it with the aggregator.
    ///
    /// Returns `None` when the update goes out unchanged, or the ids of the
    /// peers that keep the assured flag.
    fn prepare_assured_locked(
        &self,
        state: &HubState,
        update: &Arc<UpdateMsg>,
        source: &Arc<PeerHandle>,
    ) -> Result<Option<HashSet<ServerId>>> {
        if source.protocol_version() < REPLICATION_PROTOCOL_V2 {
            return Ok(None);
        }
        let plan = match update.assured_mode {
            AssuredMode::SafeRead => self.plan_safe_read(state, update, source),
            AssuredMode::SafeData => self.plan_safe_data(state, update, source),
        };
        let Some(plan) = plan else {
            return Ok(Some(HashSet::new()));
        };
        let ids = plan.expected.iter().map(|p| p.server_id()).collect();
        match self.acks.register(source, plan) {
            Ok(()) => Ok(Some(ids)),
            Err(BrokerError::DuplicateAssuredCsn { csn }) => {
                warn!(
                    base_dn = %self.base_dn,
                    %csn,
                    server_id = source.server_id(),
                    "assured update already pending, forwarding it unassured"
                );
                Ok(Some(HashSet::new()))
            }
            Err(e) => Err(e),
        }
    }

    fn plan_safe_read(
        &self,
        state: &HubState,
        update: &UpdateMsg,
        source: &Arc<PeerHandle>,
    ) -> Option<AssuredPlan> {
        let group_id = self.config.group_id;
        if source.group_id() != group_id {
            debug!(base_dn = %self.base_dn, csn = %update.csn, "safe-read update from another group");
            return None;
        }

        let mut expected = Vec::new();
        let mut wrong_status = Vec::new();
        if source.is_data_peer() {
            expected.extend(
                state
                    .relay_peers
                    .values()
                    .filter(|rs| rs.group_id() == group_id && rs.generation_id() == state.generation_id)
                    .cloned(),
            );
        }
        for ds in state.data_peers.values() {
            if ds.server_id() == source.server_id() || ds.group_id() != group_id {
                continue;
            }
            match ds.status() {
                ServerStatus::Normal => expected.push(Arc::clone(ds)),
                ServerStatus::Degraded => wrong_status.push(ds.server_id()),
                _ => {}
            }
        }

        if expected.is_empty() {
            let mut ack = AckMsg::success(update.csn);
            if !wrong_status.is_empty() {
                ack.has_wrong_status = true;
                ack.failed_servers = wrong_status;
            }
            if let Err(e) = source.send_control(ReplMessage::Ack(ack)) {
                debug!(base_dn = %self.base_dn, csn = %update.csn, error = %e, "could not send safe-read ack");
            }
            return None;
        }
        Some(AssuredPlan {
            csn: update.csn,
            mode: AssuredMode::SafeRead,
            expected,
            required: 0,
            wrong_status,
        })
    }

    fn plan_safe_data(
        &self,
        state: &HubState,
        update: &UpdateMsg,
        source: &Arc<PeerHandle>,
    ) -> Option<AssuredPlan> {
        let level = update.safe_data_level;
        if level < 1 {
            error!(base_dn = %self.base_dn, csn = %update.csn, server_id = source.server_id(), "invalid safe-data level 0");
            return None;
        }
        let group_id = self.config.group_id;
        if source.group_id() != group_id
            || is_different_generation_id(state.generation_id, source.generation_id())
        {
            return None;
        }

        if source.is_relay_peer() {
            // the remote replication server already waited for its level
            if level > 1 {
                send_immediate_ack(source, update.csn);
            }
            return None;
        }
        if level == 1 {
            send_immediate_ack(source, update.csn);
            return None;
        }

        let eligible: Vec<Arc<PeerHandle>> = state
            .relay_peers
            .values()
            .filter(|rs| rs.group_id() == group_id && rs.generation_id() == state.generation_id)
            .cloned()
            .collect();
        if eligible.is_empty() {
            send_immediate_ack(source, update.csn);
            return None;
        }
        let needed = level as usize - 1;
        let required = needed.min(eligible.len());
        if required < needed {
            debug!(
                base_dn = %self.base_dn,
                csn = %update.csn,
                level,
                effective = required + 1,
                "safe-data level lowered to the number of eligible servers"
            );
        }
        Some(AssuredPlan {
            csn: update.csn,
            mode: AssuredMode::SafeData,
            expected: eligible,
            required,
            wrong_status: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Directed messages
    // ------------------------------------------------------------------

    fn destination_servers(
        &self,
        state: &HubState,
        msg: &RoutableMsg,
        sender: &PeerHandle,
    ) -> Vec<Arc<PeerHandle>> {
        let mut servers = Vec::new();
        match msg.destination {
            Destination::AllServers => {
                if !sender.is_relay_peer() {
                    servers.extend(
                        state
                            .relay_peers
                            .values()
                            .filter(|rs| rs.has_remote_data_peers())
                            .cloned(),
                    );
                }
                servers.extend(
                    state
                        .data_peers
                        .values()
                        .filter(|ds| ds.server_id() != sender.server_id())
                        .cloned(),
                );
            }
            Destination::Server(target) => {
                if let Some(ds) = state.data_peers.get(&target) {
                    servers.push(Arc::clone(ds));
                } else if sender.is_data_peer() {
                    servers.extend(
                        state
                            .relay_peers
                            .values()
                            .filter(|rs| rs.hosts_data_peer(target))
                            .cloned(),
                    );
                }
            }
        }
        servers
    }

    /// Route a directed message from `sender`.
    pub async fn route_directed(&self, msg: RoutableMsg, sender: &Arc<PeerHandle>) {
        let local_id = self.config.server_id;
        if msg.destination == Destination::Server(local_id) {
            match &msg.payload {
                RoutablePayload::Error { details } => {
                    warn!(base_dn = %self.base_dn, server_id = msg.sender, %details, "error message received");
                }
                _ => {
                    let reply = RoutableMsg::error(
                        local_id,
                        msg.sender,
                        format!("{} cannot be handled by replication server {}", msg.kind_name(), local_id),
                    );
                    self.send_error(sender, reply);
                }
            }
            return;
        }

        let servers = {
            let state = self.state.lock().await;
            self.destination_servers(&state, &msg, sender)
        };

        if servers.is_empty() {
            let target = match msg.destination {
                Destination::AllServers => "all servers".to_string(),
                Destination::Server(id) => id.to_string(),
            };
            warn!(base_dn = %self.base_dn, server_id = msg.sender, %target, kind = msg.kind_name(), "no route for directed message");
            let reply = RoutableMsg::error(
                local_id,
                msg.sender,
                format!("replication server {} cannot reach {} for {}", local_id, target, msg.kind_name()),
            );
            self.send_error(sender, reply);
            return;
        }

        for target in servers {
            if let Err(e) = target.send_control(ReplMessage::Routable(msg.clone())) {
                warn!(base_dn = %self.base_dn, server_id = target.server_id(), error = %e, "could not forward directed message");
                let reply = RoutableMsg::error(
                    local_id,
                    msg.sender,
                    format!("replication server {} failed to forward {} to {}", local_id, msg.kind_name(), target.server_id()),
                );
                if sender.send_control(ReplMessage::Routable(reply)).is_err() {
                    self.stop_peer(sender).await;
                    self.stop_peer(&target).await;
                }
            }
        }
    }

    fn send_error(&self, to: &PeerHandle, reply: RoutableMsg) {
        if let Err(e) = to.send_control(ReplMessage::Routable(reply)) {
            debug!(base_dn = %self.base_dn, server_id = to.server_id(), error = %e, "could not send error message");
        }
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    /// Topology sent to a relay peer: our data peers plus ourselves.
    pub fn topology_for_relay_locked(&self, state: &HubState) -> TopologyMsg {
        let local_id = self.config.server_id;
        TopologyMsg {
            ds_infos: state.data_peers.values().map(|ds| ds.to_ds_info(local_id)).collect(),
            rs_infos: vec![self.local_rs_info(state)],
        }
    }

    /// Topology sent to data peer `destination`: everyone else we know about.
    pub fn topology_for_data_peer_locked(&self, state: &HubState, destination: ServerId) -> TopologyMsg {
        let local_id = self.config.server_id;
        let mut ds_infos: Vec<DsInfo> = state
            .data_peers
            .values()
            .filter(|ds| ds.server_id() != destination)
            .map(|ds| ds.to_ds_info(local_id))
            .collect();
        let mut rs_infos = vec![self.local_rs_info(state)];
        for rs in state.relay_peers.values() {
            rs_infos.push(rs.to_rs_info());
            ds_infos.extend(
                rs.remote_data_peers()
                    .into_iter()
                    .filter(|ds| ds.server_id != destination),
            );
        }
        TopologyMsg { ds_infos, rs_infos }
    }

    /// Topology received from relay peer `rs`.
    pub async fn receive_topology_from_relay(
        &self,
        rs: &Arc<PeerHandle>,
        topology: TopologyMsg,
        allow_reset_generation_id: bool,
    ) {
        let mut state = self.state.lock().await;
        self.receive_topology_from_relay_locked(&mut state, rs, topology, allow_reset_generation_id);
    }

    /// [`DomainHub::receive_topology_from_relay`] with the domain lock held.
    pub fn receive_topology_from_relay_locked(
        &self,
        state: &mut HubState,
        rs: &Arc<PeerHandle>,
        topology: TopologyMsg,
        allow_reset_generation_id: bool,
    ) {
        if let Some(info) = topology.rs_infos.iter().find(|info| info.server_id == rs.server_id()) {
            rs.set_generation_id(info.generation_id);
        }
        rs.set_remote_data_peers(topology.ds_infos);

        if allow_reset_generation_id {
            self.reset_generation_id_if_eligible_locked(state);
            self.set_generation_id_if_unset_locked(state, rs.generation_id());
        }

        if is_different_generation_id(state.generation_id, rs.generation_id()) {
            warn!(
                base_dn = %self.base_dn,
                server_id = rs.server_id(),
                domain_generation_id = state.generation_id,
                peer_generation_id = rs.generation_id(),
                "replication server has another generation id"
            );
            let reply = RoutableMsg::error(
                self.config.server_id,
                rs.server_id(),
                format!(
                    "generation id {} of replication server {} differs from {} on replication server {}",
                    rs.generation_id(),
                    rs.server_id(),
                    state.generation_id,
                    self.config.server_id
                ),
            );
            self.send_error(rs, reply);
        }

        self.broadcaster.enqueue_topology_to_data_peers(None);
    }

    /// Send everything the broadcaster accumulated.
    pub async fn send_pending_batch(&self) {
        let batch = self.broadcaster.drain();
        if batch.is_empty() {
            return;
        }
        let sends = {
            let state = self.state.lock().await;
            self.plan_batch_sends(&state, batch)
        };
        for (peer, msg) in sends {
            if matches!(msg, ReplMessage::Topology(_)) {
                self.send_topology(&peer, msg).await;
            } else if let Err(e) = peer.send_control(msg) {
                debug!(base_dn = %self.base_dn, server_id = peer.server_id(), error = %e, "could not send broadcast");
            }
        }
    }

    fn plan_batch_sends(
        &self,
        state: &HubState,
        batch: PendingBroadcastBatch,
    ) -> Vec<(Arc<PeerHandle>, ReplMessage)> {
        let mut sends = Vec::new();

        for heartbeat in batch.heartbeats.values() {
            for rs in state.relay_peers.values() {
                if rs.protocol_version() >= REPLICATION_PROTOCOL_V3 {
                    sends.push((Arc::clone(rs), ReplMessage::Heartbeat(*heartbeat)));
                }
            }
        }

        if batch.send_topology_to_ds {
            for ds in state.data_peers.values() {
                if Some(ds.server_id()) == batch.excluded_ds {
                    continue;
                }
                let topology = self.topology_for_data_peer_locked(state, ds.server_id());
                sends.push((Arc::clone(ds), ReplMessage::Topology(topology)));
            }
        }
        if batch.send_topology_to_rs && !state.relay_peers.is_empty() {
            let topology = self.topology_for_relay_locked(state);
            for rs in state.relay_peers.values() {
                sends.push((Arc::clone(rs), ReplMessage::Topology(topology.clone())));
            }
        }

        for (destination, msg) in batch.ds_monitor_msgs {
            if let Some(ds) = state.data_peers.get(&destination) {
                sends.push((Arc::clone(ds), ReplMessage::Monitor(msg)));
            }
        }
        for (destination, msg) in batch.rs_monitor_msgs {
            if let Some(rs) = state.relay_peers.get(&destination) {
                sends.push((Arc::clone(rs), ReplMessage::Monitor(msg)));
            }
        }
        sends
    }

    async fn send_topology(&self, peer: &PeerHandle, msg: ReplMessage) {
        for attempt in 0..2 {
            if peer.is_shutting_down() || peer.status() == ServerStatus::NotConnected {
                return;
            }
            match peer.send_control(msg.clone()) {
                Ok(()) => return,
                Err(e) if attempt == 0 => {
                    debug!(base_dn = %self.base_dn, server_id = peer.server_id(), error = %e, "topology send failed, retrying");
                    tokio::time::sleep(TOPOLOGY_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(base_dn = %self.base_dn, server_id = peer.server_id(), error = %e, "could not send topology");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Heartbeats and monitoring
    // ------------------------------------------------------------------

    /// Change-time heartbeat received from `peer`.
    pub fn process_heartbeat(&self, peer: &PeerHandle, heartbeat: HeartbeatMsg) {
        if let Err(e) = self.changelog.replica_heartbeat(&self.base_dn, heartbeat.csn) {
            warn!(base_dn = %self.base_dn, csn = %heartbeat.csn, error = %e, "could not record heartbeat");
        }
        if peer.is_data_peer() {
            self.broadcaster.enqueue_heartbeat(heartbeat);
        }
    }

    /// Monitoring view limited to this server and its peers.
    pub async fn local_monitor_msg(&self, destination: ServerId) -> MonitorMsg {
        let state = self.state.lock().await;
        self.local_monitor_msg_locked(&state, destination)
    }

    fn local_monitor_msg_locked(&self, state: &HubState, destination: ServerId) -> MonitorMsg {
        MonitorMsg {
            sender: self.config.server_id,
            destination,
            rs_db_state: self.changelog.newest_state(&self.base_dn),
            ds_states: state
                .data_peers
                .values()
                .map(|ds| (ds.server_id(), ds.monitor_state()))
                .collect(),
            rs_states: state
                .relay_peers
                .values()
                .map(|rs| (rs.server_id(), rs.monitor_state()))
                .collect(),
        }
    }

    /// A peer asked for monitoring data.
    pub async fn process_monitor_request(&self, peer: &PeerHandle, request: MonitorRequestMsg) {
        let local = self.local_monitor_msg(request.sender).await;
        if peer.is_data_peer() {
            let global = self.monitor.merged_view(&local);
            self.broadcaster.enqueue_ds_monitor(peer.server_id(), global);
        } else {
            self.broadcaster.enqueue_rs_monitor(peer.server_id(), local);
        }
    }

    /// Monitoring data received from `peer`.
    pub fn process_monitor(&self, peer: &PeerHandle, msg: MonitorMsg) {
        if peer.is_relay_peer() {
            self.monitor.receive(peer.server_id(), msg);
        } else {
            debug!(base_dn = %self.base_dn, server_id = peer.server_id(), "ignoring monitoring data from a directory server");
        }
    }

    /// Recompute the domain monitoring snapshot.
    pub async fn compute_monitor_data(&self) -> MonitorData {
        let local = self.local_monitor_msg(self.config.server_id).await;
        self.monitor.compute(&local, self.config.missing_changes_floor)
    }

    /// Ask every relay peer for fresh monitoring data.
    pub async fn request_remote_monitoring(&self) {
        let relays: Vec<Arc<PeerHandle>> = self.state.lock().await.relay_peers.values().cloned().collect();
        for rs in relays {
            let request = MonitorRequestMsg {
                sender: self.config.server_id,
                destination: rs.server_id(),
            };
            if let Err(e) = rs.send_control(ReplMessage::MonitorRequest(request)) {
                debug!(base_dn = %self.base_dn, server_id = rs.server_id(), error = %e, "could not request monitoring data");
            }
        }
    }

    /// Monitoring summary built from the latest snapshot.
    pub async fn monitor_report(&self) -> MonitorReport {
        let data = self.monitor.latest();
        let state = self.state.lock().await;
        let mut missing_changes = data.ds_missing_changes.clone();
        missing_changes.extend(data.rs_missing_changes.iter().map(|(k, v)| (*k, *v)));
        MonitorReport {
            base_dn: self.base_dn.clone(),
            server_id: self.config.server_id,
            generation_id: state.generation_id,
            generation_id_pinned: state.generation_id_pinned,
            data_peers: state
                .data_peers
                .values()
                .map(|ds| (ds.server_id(), ds.status()))
                .collect(),
            relay_peers: state.relay_peers.keys().copied().collect(),
            missing_changes,
            pending_acks: self.acks.pending(),
        }
    }

    // ------------------------------------------------------------------
    // Reader
    // ------------------------------------------------------------------

    /// Handle one message received from `peer`. Returns false to end the session.
    pub async fn handle_message(&self, peer: &Arc<PeerHandle>, msg: ReplMessage) -> Result<bool> {
        match msg {
            ReplMessage::Update(update) => {
                if let Some(credits) = peer.on_update_received() {
                    peer.send_control(ReplMessage::Window(crate::message::WindowMsg { credits }))?;
                }
                self.accept_update(update, peer).await?;
            }
            ReplMessage::Ack(ack) => self.acks.process_ack(peer, &ack),
            ReplMessage::Window(window) => peer.on_window_credit(window.credits),
            ReplMessage::ChangeStatus(msg) if peer.is_data_peer() => {
                self.process_new_status(peer, msg).await;
            }
            ReplMessage::ResetGenerationId(msg) => self.reset_generation_id(peer, msg).await,
            ReplMessage::Topology(topology) if peer.is_relay_peer() => {
                self.receive_topology_from_relay(peer, topology, true).await;
            }
            ReplMessage::Monitor(msg) => self.process_monitor(peer, msg),
            ReplMessage::MonitorRequest(request) => self.process_monitor_request(peer, request).await,
            ReplMessage::Heartbeat(heartbeat) => self.process_heartbeat(peer, heartbeat),
            ReplMessage::Routable(msg) => self.route_directed(msg, peer).await,
            ReplMessage::Stop => {
                debug!(base_dn = %self.base_dn, server_id = peer.server_id(), "peer sent stop");
                return Ok(false);
            }
            other => {
                return Err(BrokerError::protocol(
                    peer.server_id(),
                    format!("unexpected {} on an established session", other.kind_name()),
                ));
            }
        }
        Ok(true)
    }

    /// Reader task of an established peer.
    pub async fn run_reader(self: Arc<Self>, peer: Arc<PeerHandle>) {
        loop {
            let received = tokio::select! {
                received = peer.session().recv() => received,
                _ = peer.stopped() => break,
            };
            let msg = match received {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!(base_dn = %self.base_dn, server_id = peer.server_id(), "session closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(base_dn = %self.base_dn, server_id = peer.server_id(), error = %e, "session read failed");
                    break;
                }
            };
            match self.handle_message(&peer, msg).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(base_dn = %self.base_dn, server_id = peer.server_id(), error = %e, "closing session");
                    break;
                }
            }
        }
        self.stop_peer(&peer).await;
    }
}

fn compute_or_keep(current: ServerStatus, event: StatusEvent) -> ServerStatus {
    match compute_new_status(current, event) {
        ServerStatus::Invalid => current,
        status => status,
    }
}
