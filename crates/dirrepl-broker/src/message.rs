//! Logical replication protocol messages.
//!
//! These are the messages exchanged with directory servers and peer
//! replication servers. Encoding them on the wire is the session layer's
//! business; the broker only deals with these typed values.

use crate::csn::{Csn, ServerId, ServerState};
use crate::status::ServerStatus;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// First protocol version: no assured replication, no topology exchange.
pub const REPLICATION_PROTOCOL_V1: u16 = 1;
/// Adds assured replication.
pub const REPLICATION_PROTOCOL_V2: u16 = 2;
/// Adds change-time heartbeats between replication servers.
pub const REPLICATION_PROTOCOL_V3: u16 = 3;
/// Adds the topology exchange as second handshake phase.
pub const REPLICATION_PROTOCOL_V4: u16 = 4;
/// Version spoken by this broker.
pub const CURRENT_PROTOCOL_VERSION: u16 = REPLICATION_PROTOCOL_V4;

/// Assured replication sub-mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssuredMode {
    /// Wait until the update is stored by `level` servers.
    SafeData,
    /// Wait until every normal-status replica of the group has replayed it.
    SafeRead,
}

/// A replicated directory operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    /// Identity and causal position of the update.
    pub csn: Csn,
    /// Whether the originator waits for acknowledgments.
    pub assured: bool,
    /// Assured sub-mode, meaningful only when `assured` is set.
    pub assured_mode: AssuredMode,
    /// Number of servers that must hold the update in safe-data mode.
    pub safe_data_level: u8,
    /// Encoded operation; opaque to the broker.
    pub payload: Bytes,
}

impl UpdateMsg {
    /// A non-assured update.
    pub fn new(csn: Csn, payload: impl Into<Bytes>) -> Self {
        Self {
            csn,
            assured: false,
            assured_mode: AssuredMode::SafeData,
            safe_data_level: 1,
            payload: payload.into(),
        }
    }

    /// An assured update in safe-data mode.
    pub fn safe_data(csn: Csn, level: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            csn,
            assured: true,
            assured_mode: AssuredMode::SafeData,
            safe_data_level: level,
            payload: payload.into(),
        }
    }

    /// An assured update in safe-read mode.
    pub fn safe_read(csn: Csn, payload: impl Into<Bytes>) -> Self {
        Self {
            csn,
            assured: true,
            assured_mode: AssuredMode::SafeRead,
            safe_data_level: 1,
            payload: payload.into(),
        }
    }
}

/// A view of a shared update as delivered to one peer.
///
/// Peers we do not expect an acknowledgment from must see the update with
/// the assured flag off. `NotAssured` overrides only the assured accessors
/// and shares the same [`UpdateMsg`] allocation as every other view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateView {
    /// The update exactly as received.
    Assured(Arc<UpdateMsg>),
    /// The update with the assured flag forced off.
    NotAssured(Arc<UpdateMsg>),
}

impl UpdateView {
    /// The shared update behind this view.
    pub fn inner(&self) -> &Arc<UpdateMsg> {
        match self {
            Self::Assured(msg) | Self::NotAssured(msg) => msg,
        }
    }

    /// CSN of the update.
    pub fn csn(&self) -> Csn {
        self.inner().csn
    }

    /// Assured flag as seen by the receiving peer.
    pub fn is_assured(&self) -> bool {
        match self {
            Self::Assured(msg) => msg.assured,
            Self::NotAssured(_) => false,
        }
    }

    /// Assured sub-mode of the update.
    pub fn assured_mode(&self) -> AssuredMode {
        self.inner().assured_mode
    }

    /// Safe-data level of the update.
    pub fn safe_data_level(&self) -> u8 {
        self.inner().safe_data_level
    }

    /// Operation payload.
    pub fn payload(&self) -> &Bytes {
        &self.inner().payload
    }

    /// Materialize the view as a standalone message for the session layer.
    pub fn to_msg(&self) -> UpdateMsg {
        let mut msg = UpdateMsg::clone(self.inner());
        msg.assured = self.is_assured();
        msg
    }
}

/// Kind of remote server at the other end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerKind {
    /// A directory server replica.
    DataPeer,
    /// A peer replication server.
    RelayPeer,
}

/// Description of a directory server in a topology message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsInfo {
    /// Directory server id.
    pub server_id: ServerId,
    /// Replication server it is connected to.
    pub rs_id: ServerId,
    /// Its generation id.
    pub generation_id: i64,
    /// Its status.
    pub status: ServerStatus,
    /// Whether it publishes assured updates.
    pub assured: bool,
    /// Its assured sub-mode.
    pub assured_mode: AssuredMode,
    /// Its safe-data level.
    pub safe_data_level: u8,
    /// Its group id.
    pub group_id: u8,
}

/// Description of a replication server in a topology message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsInfo {
    /// Replication server id.
    pub server_id: ServerId,
    /// Address other servers connect to.
    pub server_url: String,
    /// Its generation id for the domain.
    pub generation_id: i64,
    /// Its group id.
    pub group_id: u8,
    /// Load-balancing weight.
    pub weight: u32,
}

/// Topology as seen from one replication server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyMsg {
    /// Known directory servers.
    pub ds_infos: Vec<DsInfo>,
    /// Known replication servers.
    pub rs_infos: Vec<RsInfo>,
}

/// First handshake message, sent by both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStart {
    /// Sender's server id.
    pub server_id: ServerId,
    /// Sender's kind.
    pub kind: PeerKind,
    /// Sender's advertised address.
    pub server_url: String,
    /// Domain the session is about.
    pub base_dn: String,
    /// Sender's generation id for the domain (-1 when unknown).
    pub generation_id: i64,
    /// Highest protocol version the sender speaks.
    pub protocol_version: u16,
    /// Sender's group id.
    pub group_id: u8,
    /// Load-balancing weight of a replication server.
    pub weight: u32,
    /// Sender's view of the domain.
    pub server_state: ServerState,
    /// Credits the sender grants for updates sent to it.
    pub window_size: u32,
    /// Status a directory server connects with.
    pub initial_status: Option<ServerStatus>,
    /// Assured configuration of a directory server.
    pub assured: bool,
    /// Assured sub-mode of a directory server.
    pub assured_mode: AssuredMode,
    /// Safe-data level of a directory server.
    pub safe_data_level: u8,
}

/// Final acknowledgment of an assured update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMsg {
    /// CSN of the acknowledged update.
    pub csn: Csn,
    /// Some expected server did not answer in time.
    pub has_timeout: bool,
    /// Some expected server was not in normal status.
    pub has_wrong_status: bool,
    /// Some server failed to replay the update.
    pub has_replay_error: bool,
    /// Servers responsible for the errors above.
    pub failed_servers: Vec<ServerId>,
}

impl AckMsg {
    /// A successful acknowledgment.
    pub fn success(csn: Csn) -> Self {
        Self {
            csn,
            has_timeout: false,
            has_wrong_status: false,
            has_replay_error: false,
            failed_servers: Vec::new(),
        }
    }

    /// True when no error flag is set.
    pub fn is_success(&self) -> bool {
        !self.has_timeout && !self.has_wrong_status && !self.has_replay_error
    }
}

/// Status change request or notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatusMsg {
    /// Status a replication server asks the directory server to enter.
    pub requested_status: Option<ServerStatus>,
    /// Status a directory server announces it entered.
    pub new_status: Option<ServerStatus>,
}

/// Administrative request to adopt a new generation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetGenerationIdMsg {
    /// The generation id to adopt.
    pub generation_id: i64,
}

/// Flow-control credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowMsg {
    /// Number of updates the receiver may now send.
    pub credits: u32,
}

/// Monitoring state of one server inside a [`MonitorMsg`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMonitorState {
    /// Server state of the server.
    pub state: ServerState,
    /// Timestamp (ms) of the oldest change not yet sent to it, 0 if none.
    pub approx_first_missing_ms: u64,
}

/// Monitoring data exchanged between servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorMsg {
    /// Sending server.
    pub sender: ServerId,
    /// Destination server.
    pub destination: ServerId,
    /// Newest CSNs stored by the sending replication server.
    pub rs_db_state: ServerState,
    /// Per directory server monitoring state.
    pub ds_states: BTreeMap<ServerId, PeerMonitorState>,
    /// Per replication server monitoring state.
    pub rs_states: BTreeMap<ServerId, PeerMonitorState>,
}

/// Request for a [`MonitorMsg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRequestMsg {
    /// Requesting server.
    pub sender: ServerId,
    /// Server asked to answer.
    pub destination: ServerId,
}

/// Change-time heartbeat: the origin has produced nothing newer than `csn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    /// Newest CSN the origin could have produced.
    pub csn: Csn,
}

/// Destination of a routable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Every server of the domain except the sender.
    AllServers,
    /// One specific server.
    Server(ServerId),
}

/// Body of a directed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutablePayload {
    /// Error report.
    Error {
        /// Human readable details.
        details: String,
    },
    /// Ask the destination to initialize the sender.
    InitializeRequest,
    /// Announce an initialization of the destination.
    InitializeTarget {
        /// Number of entries that will follow.
        entry_count: u64,
    },
    /// One entry of an initialization.
    Entry {
        /// Encoded entry.
        data: Bytes,
    },
    /// End of an initialization.
    Done,
}

/// A message addressed to a server rather than to the whole domain stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutableMsg {
    /// Sending server.
    pub sender: ServerId,
    /// Destination.
    pub destination: Destination,
    /// Body.
    pub payload: RoutablePayload,
}

impl RoutableMsg {
    /// An error message from `sender` to `destination`.
    pub fn error(sender: ServerId, destination: ServerId, details: impl Into<String>) -> Self {
        Self {
            sender,
            destination: Destination::Server(destination),
            payload: RoutablePayload::Error {
                details: details.into(),
            },
        }
    }

    /// Short name of the body type, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self.payload {
            RoutablePayload::Error { .. } => "ErrorMsg",
            RoutablePayload::InitializeRequest => "InitializeRequestMsg",
            RoutablePayload::InitializeTarget { .. } => "InitializeTargetMsg",
            RoutablePayload::Entry { .. } => "EntryMsg",
            RoutablePayload::Done => "DoneMsg",
        }
    }
}

/// Every message a session can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplMessage {
    /// Handshake phase 1.
    PeerStart(PeerStart),
    /// Handshake phase 2 and topology broadcast.
    Topology(TopologyMsg),
    /// A replicated update.
    Update(UpdateMsg),
    /// Assured completion.
    Ack(AckMsg),
    /// Status change.
    ChangeStatus(ChangeStatusMsg),
    /// Generation id reset.
    ResetGenerationId(ResetGenerationIdMsg),
    /// Flow-control credit.
    Window(WindowMsg),
    /// Monitoring data.
    Monitor(MonitorMsg),
    /// Monitoring data request.
    MonitorRequest(MonitorRequestMsg),
    /// Change-time heartbeat.
    Heartbeat(HeartbeatMsg),
    /// Directed message.
    Routable(RoutableMsg),
    /// Graceful abort or end of session.
    Stop,
}

impl ReplMessage {
    /// Short name of the message type, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::PeerStart(_) => "PeerStart",
            Self::Topology(_) => "TopologyMsg",
            Self::Update(_) => "UpdateMsg",
            Self::Ack(_) => "AckMsg",
            Self::ChangeStatus(_) => "ChangeStatusMsg",
            Self::ResetGenerationId(_) => "ResetGenerationIdMsg",
            Self::Window(_) => "WindowMsg",
            Self::Monitor(_) => "MonitorMsg",
            Self::MonitorRequest(_) => "MonitorRequestMsg",
            Self::Heartbeat(_) => "HeartbeatMsg",
            Self::Routable(msg) => msg.kind_name(),
            Self::Stop => "StopMsg",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_assured_view_shares_payload() {
        let msg = Arc::new(UpdateMsg::safe_read(Csn::new(1, 1, 1), vec![1u8, 2, 3]));
        let assured = UpdateView::Assured(Arc::clone(&msg));
        let plain = UpdateView::NotAssured(Arc::clone(&msg));

        assert!(assured.is_assured());
        assert!(!plain.is_assured());
        assert!(Arc::ptr_eq(assured.inner(), plain.inner()));
        assert_eq!(plain.assured_mode(), AssuredMode::SafeRead);
        assert_eq!(plain.payload().as_ref(), &[1, 2, 3]);
        assert!(msg.assured);
    }

    #[test]
    fn test_to_msg_applies_view() {
        let msg = Arc::new(UpdateMsg::safe_data(Csn::new(1, 1, 1), 2, Bytes::new()));
        assert!(!UpdateView::NotAssured(Arc::clone(&msg)).to_msg().assured);
        assert!(UpdateView::Assured(msg).to_msg().assured);
    }

    #[test]
    fn test_ack_success_flags() {
        let ack = AckMsg::success(Csn::new(1, 1, 1));
        assert!(ack.is_success());
        let timeout = AckMsg {
            has_timeout: true,
            ..ack
        };
        assert!(!timeout.is_success());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ReplMessage::Stop.kind_name(), "StopMsg");
        let err = RoutableMsg::error(1, 2, "boom");
        assert_eq!(ReplMessage::Routable(err).kind_name(), "ErrorMsg");
    }
}
