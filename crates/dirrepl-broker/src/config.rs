//! Broker configuration, loaded from TOML or JSON.

use crate::csn::ServerId;
use crate::error::BrokerError;
use crate::message::CURRENT_PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings of one replication server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Id of this replication server.
    pub server_id: ServerId,
    /// Address other servers use to reach this one.
    pub server_url: String,
    /// Group id of this replication server.
    pub group_id: u8,
    /// Load-balancing weight advertised to directory servers.
    pub weight: u32,
    /// Replicated domains served.
    pub base_dns: Vec<String>,
    /// Credits granted to each peer.
    pub window_size: u32,
    /// Live outbound queue length per peer before falling back to log replay.
    pub queue_size: usize,
    /// How long an assured update waits for acks.
    pub assured_timeout_ms: u64,
    /// Backlog at which a directory server becomes degraded; 0 disables.
    pub degraded_status_threshold: u64,
    /// Period of the status evaluator.
    pub status_analyzer_period_ms: u64,
    /// Longest time a pending broadcast waits before being sent.
    pub broadcast_period_ms: u64,
    /// Period of the monitoring publisher.
    pub monitoring_period_ms: u64,
    /// Wait slice of a sender out of credits.
    pub send_window_poll_ms: u64,
    /// Minimum wait for the domain lock on a relay cross-connect.
    pub cross_connect_lock_min_ms: u64,
    /// Random extra wait on a relay cross-connect, drawn in whole seconds.
    pub cross_connect_lock_jitter_ms: u64,
    /// Missing-change counts under this value are reported as 0.
    pub missing_changes_floor: u64,
    /// Highest protocol version spoken.
    pub protocol_version: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            server_url: String::from("localhost:8989"),
            group_id: 1,
            weight: 1,
            base_dns: Vec::new(),
            window_size: 100,
            queue_size: 10_000,
            assured_timeout_ms: 2_000,
            degraded_status_threshold: 5_000,
            status_analyzer_period_ms: 5_000,
            broadcast_period_ms: 100,
            monitoring_period_ms: 60_000,
            send_window_poll_ms: 500,
            cross_connect_lock_min_ms: 3_000,
            cross_connect_lock_jitter_ms: 5_000,
            missing_changes_floor: 5,
            protocol_version: CURRENT_PROTOCOL_VERSION,
        }
    }
}

impl BrokerConfig {
    /// Load a config file; the format follows the extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: BrokerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<(), BrokerError> {
        let invalid = |msg: &str| Err(BrokerError::Config { msg: msg.to_string() });
        if self.server_id <= 0 {
            return invalid("server_id must be positive");
        }
        if self.window_size == 0 {
            return invalid("window_size must be at least 1");
        }
        if self.queue_size == 0 {
            return invalid("queue_size must be at least 1");
        }
        if self.assured_timeout_ms == 0 {
            return invalid("assured_timeout_ms must be at least 1");
        }
        if self.status_analyzer_period_ms == 0
            || self.broadcast_period_ms == 0
            || self.monitoring_period_ms == 0
            || self.send_window_poll_ms == 0
        {
            return invalid("periods must be at least 1ms");
        }
        if self.protocol_version == 0 || self.protocol_version > CURRENT_PROTOCOL_VERSION {
            return Err(BrokerError::VersionMismatch {
                max: CURRENT_PROTOCOL_VERSION,
                got: self.protocol_version,
            });
        }
        if let Some(dn) = self.base_dns.iter().find(|dn| dn.trim().is_empty()) {
            return Err(BrokerError::Config {
                msg: format!("invalid base DN {:?}", dn),
            });
        }
        Ok(())
    }

    /// Ack timeout as a duration.
    pub fn assured_timeout(&self) -> Duration {
        Duration::from_millis(self.assured_timeout_ms)
    }

    /// Status evaluator period as a duration.
    pub fn status_analyzer_period(&self) -> Duration {
        Duration::from_millis(self.status_analyzer_period_ms)
    }

    /// Broadcaster period as a duration.
    pub fn broadcast_period(&self) -> Duration {
        Duration::from_millis(self.broadcast_period_ms)
    }

    /// Monitoring publisher period as a duration.
    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period_ms)
    }

    /// Send window wait slice as a duration.
    pub fn send_window_poll(&self) -> Duration {
        Duration::from_millis(self.send_window_poll_ms)
    }
}
