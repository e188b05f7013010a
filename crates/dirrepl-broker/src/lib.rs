#![warn(missing_docs)]

//! Directory replication broker: per-domain fan-out of updates between
//! directory servers and replication servers, with assured delivery,
//! generation id consistency, topology dissemination and flow control.
//!
//! Peers are reached through the [`session::PeerSession`] trait; the crate
//! ships the in-process [`session::ChannelSession`] and no wire transport.
//! The `dirrepl-broker` binary therefore only hosts domains for sessions
//! attached through [`ReplicationServer::accept`].

pub mod acks;
pub mod broadcast;
pub mod changelog;
pub mod config;
pub mod csn;
pub mod domain;
pub mod error;
pub mod handshake;
pub mod message;
pub mod monitor;
pub mod peer;
pub mod server;
pub mod session;
pub mod status;
pub mod tasks;
pub mod window;

pub use config::BrokerConfig;
pub use domain::DomainHub;
pub use error::{BrokerError, Result};
pub use server::{ReplicationServer, ServerShutdown};
