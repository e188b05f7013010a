//! Error types for the replication broker.

use crate::csn::Csn;
use thiserror::Error;

/// Errors that can occur in the replication broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Durable change log read/write error.
    #[error("changelog error for {base_dn}: {msg}")]
    Changelog {
        /// Base DN of the domain the log operation targeted.
        base_dn: String,
        /// Error message describing the issue.
        msg: String,
    },

    /// Unexpected message or malformed exchange on a peer session.
    #[error("protocol error with server {server_id}: {msg}")]
    Protocol {
        /// Remote server id, or -1 when not yet known.
        server_id: i32,
        /// Error message describing the violation.
        msg: String,
    },

    /// A live handle already exists for this server id.
    #[error("duplicate server id {server_id}: already connected from {existing_addr}, rejected {rejected_addr}")]
    DuplicateServerId {
        /// The conflicting server id.
        server_id: i32,
        /// Remote address of the connection that stays.
        existing_addr: String,
        /// Remote address of the connection that is aborted.
        rejected_addr: String,
    },

    /// An assured update with this CSN is already waiting for acks.
    #[error("assured update {csn} already has a pending ack record")]
    DuplicateAssuredCsn {
        /// CSN of the duplicated update.
        csn: Csn,
    },

    /// Domain lock could not be taken within the cross-connect timeout.
    #[error("timed out after {timeout_ms}ms waiting for the lock of domain {base_dn}")]
    LockTimeout {
        /// Base DN of the domain.
        base_dn: String,
        /// How long we waited.
        timeout_ms: u64,
    },

    /// The peer session was closed or failed.
    #[error("session error: {msg}")]
    Session {
        /// Error message describing the issue.
        msg: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {msg}")]
    Config {
        /// Error message describing the invalid value.
        msg: String,
    },

    /// Protocol version mismatch.
    #[error("unsupported protocol version {got}, supported up to {max}")]
    VersionMismatch {
        /// Highest version we speak.
        max: u16,
        /// Version offered by the peer.
        got: u16,
    },

    /// The peer or the domain was shut down.
    #[error("replication domain shut down")]
    Shutdown,
}

/// Result alias for the broker.
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Shorthand for a [`BrokerError::Protocol`] error.
    pub fn protocol(server_id: i32, msg: impl Into<String>) -> Self {
        Self::Protocol {
            server_id,
            msg: msg.into(),
        }
    }

    /// Shorthand for a [`BrokerError::Session`] error.
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session { msg: msg.into() }
    }
}
