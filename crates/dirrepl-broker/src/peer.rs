//! Per-peer state held by a domain hub.
//!
//! A [`PeerHandle`] exists from the end of a successful handshake until the
//! peer is stopped. It owns the flow-control windows, the outbound update
//! queue, the control channel and the assured-replication counters of one
//! remote server. The hub is the only writer of its status and generation id.

use crate::changelog::{ChangelogCursor, ChangelogDb};
use crate::csn::{Csn, ServerId, ServerState};
use crate::error::{BrokerError, Result};
use crate::message::{
    AssuredMode, DsInfo, PeerKind, PeerMonitorState, PeerStart, ReplMessage, RsInfo, UpdateMsg,
    UpdateView,
};
use crate::session::PeerSession;
use crate::status::ServerStatus;
use crate::window::{RecvWindow, SendWindow};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

/// Static description of a peer, taken from its start message.
#[derive(Debug, Clone)]
pub struct PeerParams {
    /// Remote server id.
    pub server_id: ServerId,
    /// Data or relay peer.
    pub kind: PeerKind,
    /// Domain the peer belongs to.
    pub base_dn: String,
    /// Advertised address of the peer.
    pub server_url: String,
    /// Negotiated protocol version.
    pub protocol_version: u16,
    /// Peer group id.
    pub group_id: u8,
    /// Load-balancing weight (relay peers).
    pub weight: u32,
    /// Peer generation id.
    pub generation_id: i64,
    /// Status the peer starts in.
    pub initial_status: ServerStatus,
    /// What the peer already has.
    pub server_state: ServerState,
    /// Whether the peer publishes assured updates.
    pub assured: bool,
    /// Peer assured sub-mode.
    pub assured_mode: AssuredMode,
    /// Peer safe-data level.
    pub safe_data_level: u8,
    /// Credits the peer granted us.
    pub send_window: u32,
    /// Credits we grant the peer.
    pub recv_window: u32,
    /// Live queue capacity before falling back to log replay.
    pub queue_size: usize,
    /// Bounded wait slice while out of send credits.
    pub send_window_poll: Duration,
}

impl PeerParams {
    /// Describe a peer from its start message.
    pub fn from_start(start: &PeerStart, recv_window: u32, queue_size: usize) -> Self {
        let initial_status = match start.kind {
            PeerKind::DataPeer => start.initial_status.unwrap_or(ServerStatus::Normal),
            PeerKind::RelayPeer => ServerStatus::Normal,
        };
        Self {
            server_id: start.server_id,
            kind: start.kind,
            base_dn: start.base_dn.clone(),
            server_url: start.server_url.clone(),
            protocol_version: start.protocol_version,
            group_id: start.group_id,
            weight: start.weight,
            generation_id: start.generation_id,
            initial_status,
            server_state: start.server_state.clone(),
            assured: start.assured,
            assured_mode: start.assured_mode,
            safe_data_level: start.safe_data_level,
            send_window: start.window_size,
            recv_window,
            queue_size,
            send_window_poll: crate::window::DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct PeerStatsInner {
    updates_received: AtomicU64,
    updates_sent: AtomicU64,
    sr_received_updates: AtomicU64,
    sr_received_timeouts: AtomicU64,
    sr_sent_updates: AtomicU64,
    sr_sent_timeouts: AtomicU64,
    sd_received_updates: AtomicU64,
    sd_received_timeouts: AtomicU64,
    sd_sent_updates: AtomicU64,
    sd_sent_timeouts: AtomicU64,
    queue_overflows: AtomicU64,
}

/// Snapshot of a peer's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Updates received from the peer.
    pub updates_received: u64,
    /// Updates sent to the peer.
    pub updates_sent: u64,
    /// Safe-read updates received from the peer.
    pub sr_received_updates: u64,
    /// Safe-read updates from the peer that timed out.
    pub sr_received_timeouts: u64,
    /// Safe-read updates sent to the peer expecting an ack.
    pub sr_sent_updates: u64,
    /// Safe-read acks the peer failed to send in time.
    pub sr_sent_timeouts: u64,
    /// Safe-data updates received from the peer.
    pub sd_received_updates: u64,
    /// Safe-data updates from the peer that timed out.
    pub sd_received_timeouts: u64,
    /// Safe-data updates sent to the peer expecting an ack.
    pub sd_sent_updates: u64,
    /// Safe-data acks the peer failed to send in time.
    pub sd_sent_timeouts: u64,
    /// Times the live queue overflowed into log replay.
    pub queue_overflows: u64,
}

/// Which assured counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssuredCounter {
    /// An assured update arrived from this peer.
    ReceivedUpdate,
    /// An assured update from this peer timed out.
    ReceivedTimeout,
    /// An assured update was sent to this peer expecting its ack.
    SentUpdate,
    /// This peer did not ack in time.
    SentTimeout,
}

#[derive(Debug)]
struct OutboundQueue {
    updates: VecDeque<UpdateView>,
    capacity: usize,
    catching_up: bool,
    /// Assured views that arrived while replaying; the replay sends them in
    /// place of the stored copy.
    assured_backlog: BTreeMap<Csn, UpdateView>,
}

/// Handle on one connected directory server or replication server.
pub struct PeerHandle {
    params: PeerParams,
    session: Arc<dyn PeerSession>,
    generation_id: AtomicI64,
    status: Mutex<ServerStatus>,
    server_state: Mutex<ServerState>,
    remote_data_peers: Mutex<Vec<DsInfo>>,
    send_window: SendWindow,
    recv_window: RecvWindow,
    outbound: Mutex<OutboundQueue>,
    outbound_notify: Notify,
    control_tx: mpsc::UnboundedSender<ReplMessage>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ReplMessage>>>,
    shutting_down: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stats: PeerStatsInner,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("server_id", &self.params.server_id)
            .field("kind", &self.params.kind)
            .field("base_dn", &self.params.base_dn)
            .field("status", &self.status())
            .finish()
    }
}

impl PeerHandle {
    /// Create a handle for an established session.
    pub fn new(params: PeerParams, session: Arc<dyn PeerSession>) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        Self {
            generation_id: AtomicI64::new(params.generation_id),
            status: Mutex::new(params.initial_status),
            server_state: Mutex::new(params.server_state.clone()),
            remote_data_peers: Mutex::new(Vec::new()),
            send_window: SendWindow::new(params.send_window, params.send_window_poll),
            recv_window: RecvWindow::new(params.recv_window),
            outbound: Mutex::new(OutboundQueue {
                updates: VecDeque::new(),
                capacity: params.queue_size.max(1),
                catching_up: true,
                assured_backlog: BTreeMap::new(),
            }),
            outbound_notify: Notify::new(),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            shutting_down: AtomicBool::new(false),
            stop_tx,
            stats: PeerStatsInner::default(),
            session,
            params,
        }
    }

    /// Remote server id.
    pub fn server_id(&self) -> ServerId {
        self.params.server_id
    }

    /// Data or relay peer.
    pub fn kind(&self) -> PeerKind {
        self.params.kind
    }

    /// True for a directory server.
    pub fn is_data_peer(&self) -> bool {
        self.params.kind == PeerKind::DataPeer
    }

    /// True for a replication server.
    pub fn is_relay_peer(&self) -> bool {
        self.params.kind == PeerKind::RelayPeer
    }

    /// Domain of the peer.
    pub fn base_dn(&self) -> &str {
        &self.params.base_dn
    }

    /// Advertised address.
    pub fn server_url(&self) -> &str {
        &self.params.server_url
    }

    /// Physical address of the session.
    pub fn remote_addr(&self) -> &str {
        self.session.remote_addr()
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> u16 {
        self.params.protocol_version
    }

    /// Group id.
    pub fn group_id(&self) -> u8 {
        self.params.group_id
    }

    /// Load-balancing weight.
    pub fn weight(&self) -> u32 {
        self.params.weight
    }

    /// Current generation id.
    pub fn generation_id(&self) -> i64 {
        self.generation_id.load(Ordering::Acquire)
    }

    /// Set the generation id; reserved to the domain hub.
    pub fn set_generation_id(&self, generation_id: i64) {
        self.generation_id.store(generation_id, Ordering::Release);
    }

    /// Current status.
    pub fn status(&self) -> ServerStatus {
        *self.status.lock()
    }

    /// Set the status; reserved to the domain hub.
    pub fn set_status(&self, status: ServerStatus) {
        *self.status.lock() = status;
    }

    /// Whether the peer publishes assured updates.
    pub fn is_assured(&self) -> bool {
        self.params.assured
    }

    /// Copy of the peer's server state.
    pub fn server_state(&self) -> ServerState {
        self.server_state.lock().clone()
    }

    /// Record that the peer holds `csn`. Returns true if the state advanced.
    pub fn update_server_state(&self, csn: Csn) -> bool {
        self.server_state.lock().update(csn)
    }

    /// Directory servers a relay peer reported as connected to it.
    pub fn remote_data_peers(&self) -> Vec<DsInfo> {
        self.remote_data_peers.lock().clone()
    }

    /// Replace the list of directory servers behind a relay peer.
    pub fn set_remote_data_peers(&self, infos: Vec<DsInfo>) {
        *self.remote_data_peers.lock() = infos;
    }

    /// True when a relay peer has at least one directory server connected.
    pub fn has_remote_data_peers(&self) -> bool {
        !self.remote_data_peers.lock().is_empty()
    }

    /// True when a relay peer reports `server_id` among its directory servers.
    pub fn hosts_data_peer(&self, server_id: ServerId) -> bool {
        self.remote_data_peers
            .lock()
            .iter()
            .any(|ds| ds.server_id == server_id)
    }

    /// Whether this peer should receive updates under `domain_generation_id`.
    ///
    /// Relay peers need a matching generation id (or an unset one on either
    /// side); data peers must not be in bad-generation or full-update status.
    pub fn accepts_updates(&self, domain_generation_id: i64) -> bool {
        match self.params.kind {
            PeerKind::RelayPeer => !is_different_generation_id(domain_generation_id, self.generation_id()),
            PeerKind::DataPeer => !matches!(
                self.status(),
                ServerStatus::BadGenerationId | ServerStatus::FullUpdate
            ),
        }
    }

    /// Queue an update for the writer task.
    ///
    /// When the queue is full it is dropped and the writer switches to
    /// replaying the change log from the peer's server state. Assured views
    /// survive the switch so the peer still sees the flag and acks.
    pub fn push_update(&self, view: UpdateView) {
        {
            let mut outbound = self.outbound.lock();
            if outbound.catching_up {
                if view.is_assured() {
                    outbound.assured_backlog.insert(view.csn(), view);
                }
            } else if outbound.updates.len() >= outbound.capacity {
                let OutboundQueue {
                    updates,
                    assured_backlog,
                    ..
                } = &mut *outbound;
                assured_backlog.extend(
                    updates
                        .drain(..)
                        .chain(std::iter::once(view))
                        .filter(UpdateView::is_assured)
                        .map(|view| (view.csn(), view)),
                );
                outbound.catching_up = true;
                self.stats.queue_overflows.fetch_add(1, Ordering::Relaxed);
                debug!(
                    base_dn = %self.params.base_dn,
                    server_id = self.params.server_id,
                    "outbound queue overflow, switching to log replay"
                );
            } else {
                outbound.updates.push_back(view);
            }
        }
        self.outbound_notify.notify_one();
    }

    /// Queue a control message (ack, topology, status, window...).
    pub fn send_control(&self, msg: ReplMessage) -> Result<()> {
        if self.is_shutting_down() {
            return Err(BrokerError::Shutdown);
        }
        self.control_tx
            .send(msg)
            .map_err(|_| BrokerError::session("writer task is gone"))
    }

    /// Number of updates waiting for the writer, as far as the queue knows.
    pub fn queued_updates(&self) -> usize {
        self.outbound.lock().updates.len()
    }

    /// True while the writer replays the change log.
    pub fn is_catching_up(&self) -> bool {
        self.outbound.lock().catching_up
    }

    /// Number of updates the peer is missing.
    ///
    /// Counted from the queue, or from `newest` (the log's newest state)
    /// when the writer is replaying the log.
    pub fn backlog(&self, newest: &ServerState) -> u64 {
        if !self.is_catching_up() {
            return self.queued_updates() as u64;
        }
        let state = self.server_state.lock();
        newest
            .csns()
            .map(|csn| Csn::diff_seq_num(Some(csn), state.get(csn.server_id)))
            .sum()
    }

    /// Timestamp (ms) of the oldest update not yet sent, 0 when none.
    pub fn approx_first_missing_ms(&self) -> u64 {
        self.outbound
            .lock()
            .updates
            .front()
            .map(|view| view.csn().timestamp_ms)
            .unwrap_or(0)
    }

    /// Monitoring state of this peer.
    pub fn monitor_state(&self) -> PeerMonitorState {
        PeerMonitorState {
            state: self.server_state(),
            approx_first_missing_ms: self.approx_first_missing_ms(),
        }
    }

    /// Account for an update received from the peer.
    ///
    /// Returns the credit to send back when the receive window runs low.
    pub fn on_update_received(&self) -> Option<u32> {
        self.stats.updates_received.fetch_add(1, Ordering::Relaxed);
        self.recv_window.consume()
    }

    /// Credits granted by a window message.
    pub fn on_window_credit(&self, credits: u32) {
        self.send_window.replenish(credits);
    }

    /// Send credits currently available.
    pub fn send_credits(&self) -> u32 {
        self.send_window.available()
    }

    /// Bump one assured counter for `mode`.
    pub fn incr_assured(&self, mode: AssuredMode, counter: AssuredCounter) {
        let target = match (mode, counter) {
            (AssuredMode::SafeRead, AssuredCounter::ReceivedUpdate) => &self.stats.sr_received_updates,
            (AssuredMode::SafeRead, AssuredCounter::ReceivedTimeout) => &self.stats.sr_received_timeouts,
            (AssuredMode::SafeRead, AssuredCounter::SentUpdate) => &self.stats.sr_sent_updates,
            (AssuredMode::SafeRead, AssuredCounter::SentTimeout) => &self.stats.sr_sent_timeouts,
            (AssuredMode::SafeData, AssuredCounter::ReceivedUpdate) => &self.stats.sd_received_updates,
            (AssuredMode::SafeData, AssuredCounter::ReceivedTimeout) => &self.stats.sd_received_timeouts,
            (AssuredMode::SafeData, AssuredCounter::SentUpdate) => &self.stats.sd_sent_updates,
            (AssuredMode::SafeData, AssuredCounter::SentTimeout) => &self.stats.sd_sent_timeouts,
        };
        target.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PeerStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PeerStats {
            updates_received: load(&self.stats.updates_received),
            updates_sent: load(&self.stats.updates_sent),
            sr_received_updates: load(&self.stats.sr_received_updates),
            sr_received_timeouts: load(&self.stats.sr_received_timeouts),
            sr_sent_updates: load(&self.stats.sr_sent_updates),
            sr_sent_timeouts: load(&self.stats.sr_sent_timeouts),
            sd_received_updates: load(&self.stats.sd_received_updates),
            sd_received_timeouts: load(&self.stats.sd_received_timeouts),
            sd_sent_updates: load(&self.stats.sd_sent_updates),
            sd_sent_timeouts: load(&self.stats.sd_sent_timeouts),
            queue_overflows: load(&self.stats.queue_overflows),
        }
    }

    /// Topology entry of a data peer connected to replication server `rs_id`.
    pub fn to_ds_info(&self, rs_id: ServerId) -> DsInfo {
        DsInfo {
            server_id: self.params.server_id,
            rs_id,
            generation_id: self.generation_id(),
            status: self.status(),
            assured: self.params.assured,
            assured_mode: self.params.assured_mode,
            safe_data_level: self.params.safe_data_level,
            group_id: self.params.group_id,
        }
    }

    /// Topology entry of a relay peer.
    pub fn to_rs_info(&self) -> RsInfo {
        RsInfo {
            server_id: self.params.server_id,
            server_url: self.params.server_url.clone(),
            generation_id: self.generation_id(),
            group_id: self.params.group_id,
            weight: self.params.weight,
        }
    }

    /// Mark the peer as shutting down. Only the first caller gets `true`.
    pub fn engage_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::AcqRel)
    }

    /// True once [`PeerHandle::engage_shutdown`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop the reader and writer tasks and close the session.
    pub async fn close(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.send_window.close();
        self.stop_tx.send_replace(true);
        self.outbound_notify.notify_one();
        self.session.close().await;
    }

    /// Session of the peer.
    pub fn session(&self) -> &Arc<dyn PeerSession> {
        &self.session
    }

    /// Resolves once the peer is being stopped.
    pub async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    #[cfg(test)]
    pub(crate) fn take_control_receiver_for_test(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<ReplMessage>> {
        self.control_rx.lock().take()
    }

    #[cfg(test)]
    pub(crate) fn skip_catch_up_for_test(&self) {
        self.outbound.lock().catching_up = false;
    }

    #[cfg(test)]
    pub(crate) fn queued_for_test(&self) -> Vec<UpdateView> {
        self.outbound.lock().updates.iter().cloned().collect()
    }

    /// View to send for a replayed update.
    fn replay_view(&self, update: Arc<UpdateMsg>) -> UpdateView {
        match self.outbound.lock().assured_backlog.remove(&update.csn) {
            Some(view) => view,
            None => UpdateView::NotAssured(update),
        }
    }

    /// Forget assured views the peer has already been sent.
    fn prune_assured_backlog(&self) {
        let state = self.server_state();
        self.outbound
            .lock()
            .assured_backlog
            .retain(|csn, _| !state.cover(csn));
    }

    fn next_live_update(&self) -> NextUpdate {
        let mut outbound = self.outbound.lock();
        if outbound.catching_up {
            outbound.catching_up = false;
            outbound.updates.clear();
            return NextUpdate::CatchUp;
        }
        match outbound.updates.pop_front() {
            Some(view) => NextUpdate::Live(view),
            None => NextUpdate::Idle,
        }
    }

    /// Writer task: drains the control channel and sends updates, replaying
    /// the change log first and whenever the live queue overflowed.
    pub async fn run_writer(
        self: Arc<Self>,
        changelog: Arc<dyn ChangelogDb>,
        domain_generation_id: Arc<AtomicI64>,
    ) {
        let Some(mut control_rx) = self.control_rx.lock().take() else {
            warn!(server_id = self.server_id(), "writer already running");
            return;
        };
        let mut stop_rx = self.stop_tx.subscribe();
        let mut cursor: Option<Box<dyn ChangelogCursor>> = None;

        let result: Result<()> = async {
            loop {
                if *stop_rx.borrow() {
                    return Ok(());
                }
                while let Ok(msg) = control_rx.try_recv() {
                    self.session.send(msg).await?;
                }

                let next = match cursor.as_mut() {
                    Some(replay) => match replay.next() {
                        Some(update) => Some(self.replay_view(update)),
                        None => {
                            cursor = None;
                            self.prune_assured_backlog();
                            continue;
                        }
                    },
                    None => match self.next_live_update() {
                        NextUpdate::Live(view) => Some(view),
                        NextUpdate::CatchUp => {
                            cursor = Some(changelog.cursor_from(self.base_dn(), &self.server_state())?);
                            continue;
                        }
                        NextUpdate::Idle => None,
                    },
                };

                let Some(view) = next else {
                    tokio::select! {
                        msg = control_rx.recv() => match msg {
                            Some(msg) => self.session.send(msg).await?,
                            None => return Ok(()),
                        },
                        _ = self.outbound_notify.notified() => {}
                        _ = stop_rx.changed() => {}
                    }
                    continue;
                };

                if self.server_state.lock().cover(&view.csn()) {
                    continue;
                }
                if !self.accepts_updates(domain_generation_id.load(Ordering::Acquire)) {
                    continue;
                }

                loop {
                    tokio::select! {
                        biased;
                        msg = control_rx.recv() => match msg {
                            Some(msg) => self.session.send(msg).await?,
                            None => return Ok(()),
                        },
                        acquired = self.send_window.acquire() => {
                            acquired?;
                            break;
                        }
                    }
                }

                let csn = view.csn();
                self.session.send(ReplMessage::Update(view.to_msg())).await?;
                self.server_state.lock().update(csn);
                self.stats.updates_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        .await;

        match result {
            Ok(()) | Err(BrokerError::Shutdown) => {
                debug!(server_id = self.server_id(), base_dn = %self.base_dn(), "writer stopped");
            }
            Err(e) => {
                warn!(server_id = self.server_id(), base_dn = %self.base_dn(), error = %e, "writer failed");
            }
        }
        self.session.close().await;
    }
}

enum NextUpdate {
    Live(UpdateView),
    CatchUp,
    Idle,
}

/// True when both generation ids are set and differ.
pub fn is_different_generation_id(domain_generation_id: i64, peer_generation_id: i64) -> bool {
    domain_generation_id > 0 && peer_generation_id > 0 && domain_generation_id != peer_generation_id
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::message::CURRENT_PROTOCOL_VERSION;
    use crate::session::ChannelSession;

    /// Build params for a test peer.
    pub fn params(server_id: ServerId, kind: PeerKind, generation_id: i64) -> PeerParams {
        PeerParams {
            server_id,
            kind,
            base_dn: "dc=example,dc=com".to_string(),
            server_url: format!("host{}:8989", server_id),
            protocol_version: CURRENT_PROTOCOL_VERSION,
            group_id: 1,
            weight: 1,
            generation_id,
            initial_status: ServerStatus::Normal,
            server_state: ServerState::new(),
            assured: false,
            assured_mode: AssuredMode::SafeData,
            safe_data_level: 1,
            send_window: 100,
            recv_window: 100,
            queue_size: 100,
            send_window_poll: Duration::from_millis(10),
        }
    }

    /// Build a peer handle and the remote end of its session.
    pub fn peer(params: PeerParams) -> (Arc<PeerHandle>, Arc<ChannelSession>) {
        let remote = format!("10.0.0.{}:40000", params.server_id);
        let (local, far) = ChannelSession::pair("10.0.0.254:8989", &remote, 64);
        let handle = Arc::new(PeerHandle::new(params, Arc::new(local)));
        (handle, Arc::new(far))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{params, peer};
    use super::*;
    use crate::changelog::InMemoryChangelog;
    use crate::message::UpdateMsg;
    use bytes::Bytes;

    fn view(ts: u64, seq: u32, origin: ServerId) -> UpdateView {
        UpdateView::Assured(Arc::new(UpdateMsg::new(Csn::new(ts, seq, origin), Bytes::new())))
    }

    async fn next_update(far: &dyn PeerSession) -> Csn {
        loop {
            match far.recv().await.unwrap() {
                Some(ReplMessage::Update(update)) => return update.csn,
                Some(_) => continue,
                None => panic!("session closed"),
            }
        }
    }

    mod handle {
        use super::*;

        #[test]
        fn test_engage_shutdown_once() {
            let (handle, _far) = peer(params(1, PeerKind::DataPeer, 7));
            assert!(handle.engage_shutdown());
            assert!(!handle.engage_shutdown());
            assert!(handle.is_shutting_down());
        }

        #[test]
        fn test_accepts_updates() {
            let (ds, _a) = peer(params(1, PeerKind::DataPeer, 7));
            assert!(ds.accepts_updates(7));
            ds.set_status(ServerStatus::BadGenerationId);
            assert!(!ds.accepts_updates(7));
            ds.set_status(ServerStatus::FullUpdate);
            assert!(!ds.accepts_updates(7));

            let (rs, _b) = peer(params(2, PeerKind::RelayPeer, 7));
            assert!(rs.accepts_updates(7));
            assert!(rs.accepts_updates(-1));
            assert!(!rs.accepts_updates(8));
        }

        #[test]
        fn test_queue_overflow_switches_to_catch_up() {
            let mut p = params(1, PeerKind::DataPeer, 7);
            p.queue_size = 2;
            let (handle, _far) = peer(p);
            assert!(matches!(handle.next_live_update(), NextUpdate::CatchUp));

            handle.push_update(view(1, 1, 9));
            handle.push_update(view(2, 2, 9));
            assert_eq!(handle.queued_updates(), 2);
            assert_eq!(handle.approx_first_missing_ms(), 1);

            handle.push_update(view(3, 3, 9));
            assert!(handle.is_catching_up());
            assert_eq!(handle.queued_updates(), 0);
            assert_eq!(handle.stats().queue_overflows, 1);
        }

        #[test]
        fn test_overflow_keeps_assured_views() {
            let mut p = params(1, PeerKind::DataPeer, 7);
            p.queue_size = 1;
            let (handle, _far) = peer(p);
            assert!(matches!(handle.next_live_update(), NextUpdate::CatchUp));

            let assured = Arc::new(UpdateMsg::safe_read(Csn::new(1, 1, 9), Bytes::new()));
            handle.push_update(UpdateView::Assured(Arc::clone(&assured)));
            handle.push_update(view(2, 2, 9));
            assert!(handle.is_catching_up());

            assert!(handle.replay_view(Arc::clone(&assured)).is_assured());
            let plain = Arc::new(UpdateMsg::new(Csn::new(2, 2, 9), Bytes::new()));
            assert!(!handle.replay_view(plain).is_assured());
            // handed out once
            assert!(!handle.replay_view(assured).is_assured());
        }

        #[test]
        fn test_backlog_while_catching_up() {
            let (handle, _far) = peer(params(1, PeerKind::DataPeer, 7));
            handle.update_server_state(Csn::new(10, 3, 9));
            let newest: ServerState = [Csn::new(20, 8, 9), Csn::new(20, 2, 4)].into_iter().collect();
            assert_eq!(handle.backlog(&newest), 5 + 2);
        }

        #[test]
        fn test_assured_counters() {
            let (handle, _far) = peer(params(1, PeerKind::DataPeer, 7));
            handle.incr_assured(AssuredMode::SafeRead, AssuredCounter::ReceivedUpdate);
            handle.incr_assured(AssuredMode::SafeData, AssuredCounter::SentTimeout);
            let stats = handle.stats();
            assert_eq!(stats.sr_received_updates, 1);
            assert_eq!(stats.sd_sent_timeouts, 1);
            assert_eq!(stats.sd_sent_updates, 0);
        }

        #[test]
        fn test_relay_hosts_data_peer() {
            let (rs, _far) = peer(params(2, PeerKind::RelayPeer, 7));
            assert!(!rs.has_remote_data_peers());
            let (ds, _x) = peer(params(5, PeerKind::DataPeer, 7));
            rs.set_remote_data_peers(vec![ds.to_ds_info(2)]);
            assert!(rs.hosts_data_peer(5));
            assert!(!rs.hosts_data_peer(6));
        }
    }

    mod writer {
        use super::*;

        #[tokio::test]
        async fn test_replays_log_then_follows_queue() {
            let log = Arc::new(InMemoryChangelog::new());
            let dn = "dc=example,dc=com";
            log.append(dn, &UpdateMsg::new(Csn::new(1, 1, 9), Bytes::new())).unwrap();
            log.append(dn, &UpdateMsg::new(Csn::new(2, 2, 9), Bytes::new())).unwrap();

            let (handle, far) = peer(params(1, PeerKind::DataPeer, 7));
            let writer = tokio::spawn(Arc::clone(&handle).run_writer(
                log.clone() as Arc<dyn ChangelogDb>,
                Arc::new(AtomicI64::new(7)),
            ));

            assert_eq!(next_update(far.as_ref()).await, Csn::new(1, 1, 9));
            assert_eq!(next_update(far.as_ref()).await, Csn::new(2, 2, 9));

            // already replayed, must not be sent twice
            handle.push_update(view(2, 2, 9));
            handle.push_update(view(3, 3, 9));
            assert_eq!(next_update(far.as_ref()).await, Csn::new(3, 3, 9));
            assert_eq!(handle.stats().updates_sent, 3);

            handle.close().await;
            writer.await.unwrap();
        }

        #[tokio::test]
        async fn test_assured_view_survives_initial_replay() {
            let log = Arc::new(InMemoryChangelog::new());
            let update = UpdateMsg::safe_read(Csn::new(1, 1, 9), Bytes::new());
            log.append("dc=example,dc=com", &update).unwrap();

            let (handle, far) = peer(params(1, PeerKind::DataPeer, 7));
            assert!(handle.is_catching_up());
            handle.push_update(UpdateView::Assured(Arc::new(update)));
            let writer = tokio::spawn(Arc::clone(&handle).run_writer(
                log.clone() as Arc<dyn ChangelogDb>,
                Arc::new(AtomicI64::new(7)),
            ));

            let received = loop {
                match far.recv().await.unwrap() {
                    Some(ReplMessage::Update(update)) => break update,
                    Some(_) => continue,
                    None => panic!("session closed"),
                }
            };
            assert_eq!(received.csn, Csn::new(1, 1, 9));
            assert!(received.assured);
            assert!(handle.outbound.lock().assured_backlog.is_empty());

            handle.close().await;
            writer.await.unwrap();
        }

        #[tokio::test]
        async fn test_control_flows_without_credits() {
            let log = Arc::new(InMemoryChangelog::new());
            let mut p = params(1, PeerKind::DataPeer, 7);
            p.send_window = 0;
            let (handle, far) = peer(p);
            let writer = tokio::spawn(Arc::clone(&handle).run_writer(
                log.clone() as Arc<dyn ChangelogDb>,
                Arc::new(AtomicI64::new(7)),
            ));

            tokio::task::yield_now().await;
            let update = view(5, 1, 9);
            log.append("dc=example,dc=com", update.inner()).unwrap();
            handle.push_update(update);
            handle.send_control(ReplMessage::Stop).unwrap();
            assert_eq!(far.recv().await.unwrap(), Some(ReplMessage::Stop));

            handle.on_window_credit(1);
            assert_eq!(next_update(far.as_ref()).await, Csn::new(5, 1, 9));

            handle.close().await;
            writer.await.unwrap();
        }
    }
}
