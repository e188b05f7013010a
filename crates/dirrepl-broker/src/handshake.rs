//! Session handshake: start messages, topology exchange and registration.
//!
//! Both sides first exchange a [`PeerStart`]. From protocol V4 on they then
//! exchange a [`TopologyMsg`]; the acceptor reads the peer's topology before
//! sending its own, the connector does the opposite. The domain lock is held
//! from the start exchange until the peer is registered, and a server id
//! already in use is refused before the domain's generation id is looked at.
//! On a relay cross-connect the acceptor only waits a bounded, randomized
//! time for it, which breaks the tie when two replication servers connect to
//! each other at the same time.

use crate::config::BrokerConfig;
use crate::csn::ServerId;
use crate::domain::{DomainHub, HubState, RegisterOutcome};
use crate::error::{BrokerError, Result};
use crate::message::{
    AssuredMode, PeerKind, PeerStart, ReplMessage, TopologyMsg, REPLICATION_PROTOCOL_V1,
    REPLICATION_PROTOCOL_V4,
};
use crate::peer::{PeerHandle, PeerParams};
use crate::server::ReplicationServer;
use crate::session::PeerSession;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest wait for one handshake message.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of a session, from connection to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Transport connected, nothing exchanged yet.
    Connecting,
    /// Waiting for the peer's start message.
    AwaitingPeerStart,
    /// Waiting for the peer's topology (protocol V4 and later).
    AwaitingPeerTopology,
    /// Registered with the domain; reader and writer running.
    Established,
    /// Being torn down.
    ShuttingDown,
    /// Done.
    Closed,
}

impl HandshakePhase {
    /// Whether `next` may follow this phase.
    pub fn can_advance_to(self, next: HandshakePhase) -> bool {
        use HandshakePhase as P;
        matches!(
            (self, next),
            (P::Connecting, P::AwaitingPeerStart)
                | (P::AwaitingPeerStart, P::AwaitingPeerTopology)
                | (P::AwaitingPeerStart, P::Established)
                | (P::AwaitingPeerTopology, P::Established)
                | (P::Established, P::ShuttingDown)
                | (P::ShuttingDown, P::Closed)
                | (P::Connecting, P::Closed)
                | (P::AwaitingPeerStart, P::Closed)
                | (P::AwaitingPeerTopology, P::Closed)
        )
    }
}

/// Result of a handshake that did not fail.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// The peer is registered and its tasks are running.
    Established(Arc<PeerHandle>),
    /// The server was already connected over the same link; this session was closed.
    DuplicateLink,
}

impl HandshakeOutcome {
    /// The established peer, if any.
    pub fn peer(&self) -> Option<&Arc<PeerHandle>> {
        match self {
            HandshakeOutcome::Established(peer) => Some(peer),
            HandshakeOutcome::DuplicateLink => None,
        }
    }
}

struct Handshake {
    phase: HandshakePhase,
    session: Arc<dyn PeerSession>,
    peer_id: ServerId,
    base_dn: String,
}

impl Handshake {
    fn new(session: Arc<dyn PeerSession>) -> Self {
        Self {
            phase: HandshakePhase::Connecting,
            session,
            peer_id: -1,
            base_dn: String::new(),
        }
    }

    fn advance(&mut self, next: HandshakePhase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(BrokerError::protocol(
                self.peer_id,
                format!("illegal handshake transition {:?} -> {:?}", self.phase, next),
            ));
        }
        debug!(
            base_dn = %self.base_dn,
            server_id = self.peer_id,
            from = ?self.phase,
            to = ?next,
            "handshake phase"
        );
        self.phase = next;
        Ok(())
    }

    async fn recv(&self) -> Result<ReplMessage> {
        let received = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.session.recv())
            .await
            .map_err(|_| BrokerError::session("handshake timed out"))??;
        match received {
            Some(ReplMessage::Stop) => Err(BrokerError::session("peer stopped the handshake")),
            Some(msg) => Ok(msg),
            None => Err(BrokerError::session("session closed during handshake")),
        }
    }

    async fn recv_start(&self) -> Result<PeerStart> {
        match self.recv().await? {
            ReplMessage::PeerStart(start) => Ok(start),
            other => Err(BrokerError::protocol(
                self.peer_id,
                format!("expected PeerStart, got {}", other.kind_name()),
            )),
        }
    }

    async fn recv_topology(&self) -> Result<TopologyMsg> {
        match self.recv().await? {
            ReplMessage::Topology(topology) => Ok(topology),
            other => Err(BrokerError::protocol(
                self.peer_id,
                format!("expected TopologyMsg, got {}", other.kind_name()),
            )),
        }
    }

    async fn close(&mut self) {
        let _ = self.session.send(ReplMessage::Stop).await;
        self.session.close().await;
        self.phase = HandshakePhase::Closed;
    }

    async fn abort(&mut self, err: &BrokerError) {
        warn!(
            base_dn = %self.base_dn,
            server_id = self.peer_id,
            addr = %self.session.remote_addr(),
            error = %err,
            "handshake failed"
        );
        self.close().await;
    }
}

/// Accept a directory server or replication server on a new session.
pub async fn accept_peer(
    server: &ReplicationServer,
    session: Arc<dyn PeerSession>,
) -> Result<HandshakeOutcome> {
    let mut hs = Handshake::new(session);
    hs.advance(HandshakePhase::AwaitingPeerStart)?;
    match accept_inner(server, &mut hs).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            hs.abort(&e).await;
            Err(e)
        }
    }
}

async fn accept_inner(server: &ReplicationServer, hs: &mut Handshake) -> Result<HandshakeOutcome> {
    let config = server.config();
    let start = hs.recv_start().await?;
    hs.peer_id = start.server_id;
    hs.base_dn = start.base_dn.clone();
    validate_start(config, &start)?;
    let version = negotiate_version(config.protocol_version, start.protocol_version)?;

    let hub = server.get_or_create_domain(&start.base_dn);
    let mut state = match start.kind {
        PeerKind::RelayPeer => {
            hub.lock_with_timeout(cross_connect_lock_timeout(config))
                .await?
        }
        PeerKind::DataPeer => hub.lock().await,
    };

    let handle = new_handle(config, &start, version, &hs.session);
    if hub.check_admission_locked(&state, &handle)? == RegisterOutcome::DuplicateLink {
        drop(state);
        hs.close().await;
        return Ok(HandshakeOutcome::DuplicateLink);
    }
    hub.reconcile_generation_id_locked(&mut state, start.generation_id, Some(&handle));
    hs.session
        .send(ReplMessage::PeerStart(local_start(&hub, &state, version)))
        .await?;

    if version >= REPLICATION_PROTOCOL_V4 {
        hs.advance(HandshakePhase::AwaitingPeerTopology)?;
        let topology = hs.recv_topology().await?;
        let reply = match start.kind {
            PeerKind::DataPeer => hub.topology_for_data_peer_locked(&state, start.server_id),
            PeerKind::RelayPeer => hub.topology_for_relay_locked(&state),
        };
        hs.session.send(ReplMessage::Topology(reply)).await?;
        if handle.is_relay_peer() {
            hub.receive_topology_from_relay_locked(&mut state, &handle, topology, false);
        }
    }

    finish(&hub, hs, state, handle).await
}

/// Connect to a replication server for `base_dn` over `session`.
pub async fn connect_relay_peer(
    server: &ReplicationServer,
    session: Arc<dyn PeerSession>,
    base_dn: &str,
) -> Result<HandshakeOutcome> {
    let mut hs = Handshake::new(session);
    hs.base_dn = base_dn.to_string();
    hs.advance(HandshakePhase::AwaitingPeerStart)?;
    match connect_inner(server, &mut hs).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            hs.abort(&e).await;
            Err(e)
        }
    }
}

async fn connect_inner(server: &ReplicationServer, hs: &mut Handshake) -> Result<HandshakeOutcome> {
    let config = server.config();
    let hub = server.get_or_create_domain(&hs.base_dn);
    let mut state = hub.lock().await;

    hs.session
        .send(ReplMessage::PeerStart(local_start(&hub, &state, config.protocol_version)))
        .await?;
    let start = hs.recv_start().await?;
    hs.peer_id = start.server_id;
    if start.kind != PeerKind::RelayPeer {
        return Err(BrokerError::protocol(
            start.server_id,
            "connected to a server that is not a replication server",
        ));
    }
    if start.base_dn != hs.base_dn {
        return Err(BrokerError::protocol(
            start.server_id,
            format!("answered for {} instead of {}", start.base_dn, hs.base_dn),
        ));
    }
    validate_start(config, &start)?;
    let version = negotiate_version(config.protocol_version, start.protocol_version)?;

    let handle = new_handle(config, &start, version, &hs.session);
    if hub.check_admission_locked(&state, &handle)? == RegisterOutcome::DuplicateLink {
        drop(state);
        hs.close().await;
        return Ok(HandshakeOutcome::DuplicateLink);
    }
    hub.reconcile_generation_id_locked(&mut state, start.generation_id, Some(&handle));

    if version >= REPLICATION_PROTOCOL_V4 {
        hs.advance(HandshakePhase::AwaitingPeerTopology)?;
        let ours = hub.topology_for_relay_locked(&state);
        hs.session.send(ReplMessage::Topology(ours)).await?;
        let topology = hs.recv_topology().await?;
        hub.receive_topology_from_relay_locked(&mut state, &handle, topology, false);
    }

    finish(&hub, hs, state, handle).await
}

async fn finish(
    hub: &Arc<DomainHub>,
    hs: &mut Handshake,
    mut state: tokio::sync::MutexGuard<'_, HubState>,
    handle: Arc<PeerHandle>,
) -> Result<HandshakeOutcome> {
    match hub.register_peer_locked(&mut state, &handle)? {
        RegisterOutcome::Registered => {}
        RegisterOutcome::DuplicateLink => {
            drop(state);
            hs.close().await;
            return Ok(HandshakeOutcome::DuplicateLink);
        }
    }
    hs.advance(HandshakePhase::Established)?;
    drop(state);

    hub.start_peer(&handle);
    info!(
        base_dn = %hub.base_dn(),
        server_id = handle.server_id(),
        kind = ?handle.kind(),
        protocol_version = handle.protocol_version(),
        generation_id = handle.generation_id(),
        status = %handle.status(),
        "peer connected"
    );
    Ok(HandshakeOutcome::Established(handle))
}

fn validate_start(config: &BrokerConfig, start: &PeerStart) -> Result<()> {
    if start.server_id <= 0 {
        return Err(BrokerError::protocol(start.server_id, "invalid server id"));
    }
    if start.kind == PeerKind::RelayPeer && start.server_id == config.server_id {
        return Err(BrokerError::protocol(
            start.server_id,
            "replication server uses the local server id",
        ));
    }
    if start.base_dn.trim().is_empty() {
        return Err(BrokerError::protocol(start.server_id, "empty base DN"));
    }
    if start.kind == PeerKind::DataPeer {
        if let Some(status) = start.initial_status {
            if !status.is_valid_initial() {
                return Err(BrokerError::protocol(
                    start.server_id,
                    format!("invalid initial status {}", status),
                ));
            }
        }
    }
    Ok(())
}

/// Pick the protocol version of a session.
pub fn negotiate_version(local: u16, remote: u16) -> Result<u16> {
    if remote < REPLICATION_PROTOCOL_V1 {
        return Err(BrokerError::VersionMismatch {
            max: local,
            got: remote,
        });
    }
    Ok(local.min(remote))
}

/// Lock wait of a relay cross-connect: the minimum plus whole seconds of jitter.
pub fn cross_connect_lock_timeout(config: &BrokerConfig) -> Duration {
    let steps = config.cross_connect_lock_jitter_ms / 1000;
    let extra = rand::thread_rng().gen_range(0..=steps) * 1000;
    Duration::from_millis(config.cross_connect_lock_min_ms + extra)
}

fn new_handle(
    config: &BrokerConfig,
    start: &PeerStart,
    version: u16,
    session: &Arc<dyn PeerSession>,
) -> Arc<PeerHandle> {
    let mut params = PeerParams::from_start(start, config.window_size, config.queue_size);
    params.protocol_version = version;
    params.send_window_poll = config.send_window_poll();
    Arc::new(PeerHandle::new(params, Arc::clone(session)))
}

fn local_start(hub: &DomainHub, state: &HubState, version: u16) -> PeerStart {
    let config = hub.config();
    PeerStart {
        server_id: config.server_id,
        kind: PeerKind::RelayPeer,
        server_url: config.server_url.clone(),
        base_dn: hub.base_dn().to_string(),
        generation_id: state.generation_id(),
        protocol_version: version,
        group_id: config.group_id,
        weight: config.weight,
        server_state: hub.latest_server_state(),
        window_size: config.window_size,
        initial_status: None,
        assured: false,
        assured_mode: AssuredMode::SafeData,
        safe_data_level: 1,
    }
}
