//! The replication server: registry of domain hubs and process shutdown.

use crate::changelog::ChangelogDb;
use crate::config::BrokerConfig;
use crate::domain::{DomainHub, MonitorReport};
use crate::error::Result;
use crate::handshake::{self, HandshakeOutcome};
use crate::session::PeerSession;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Process-wide shutdown trigger.
///
/// Cloned into every domain; the first [`ServerShutdown::trigger`] wins and
/// its reason is kept.
#[derive(Debug, Clone)]
pub struct ServerShutdown {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for ServerShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerShutdown {
    /// Create an untriggered handle.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request an orderly shutdown. Returns false if one was already requested.
    pub fn trigger(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let fired = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if fired {
            error!(%reason, "replication server shutdown requested");
        }
        fired
    }

    /// True once triggered.
    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Why the shutdown was requested.
    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolves once triggered.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }
}

/// One replication server: its configuration, change log and domains.
pub struct ReplicationServer {
    config: Arc<BrokerConfig>,
    changelog: Arc<dyn ChangelogDb>,
    domains: RwLock<HashMap<String, Arc<DomainHub>>>,
    shutdown: ServerShutdown,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ReplicationServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationServer")
            .field("server_id", &self.config.server_id)
            .field("domains", &self.domains.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ReplicationServer {
    /// Create a server; domains are created by [`ReplicationServer::start`] or on demand.
    pub fn new(config: BrokerConfig, changelog: Arc<dyn ChangelogDb>) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            changelog,
            domains: RwLock::new(HashMap::new()),
            shutdown: ServerShutdown::new(),
            watcher: parking_lot::Mutex::new(None),
        })
    }

    /// Create the configured domains and watch for shutdown requests.
    pub fn start(self: &Arc<Self>) {
        for base_dn in &self.config.base_dns {
            self.get_or_create_domain(base_dn);
        }
        let watcher = crate::tasks::spawn_shutdown_watcher(Arc::clone(self));
        *self.watcher.lock() = Some(watcher);
        info!(
            server_id = self.config.server_id,
            url = %self.config.server_url,
            domains = self.config.base_dns.len(),
            "replication server started"
        );
    }

    /// Server configuration.
    pub fn config(&self) -> &Arc<BrokerConfig> {
        &self.config
    }

    /// Shutdown handle shared with the domains.
    pub fn shutdown_handle(&self) -> &ServerShutdown {
        &self.shutdown
    }

    /// Hub of `base_dn`, if it exists.
    pub fn domain(&self, base_dn: &str) -> Option<Arc<DomainHub>> {
        self.domains.read().get(base_dn).cloned()
    }

    /// Hub of `base_dn`, created and started if needed.
    pub fn get_or_create_domain(&self, base_dn: &str) -> Arc<DomainHub> {
        if let Some(hub) = self.domain(base_dn) {
            return hub;
        }
        let mut domains = self.domains.write();
        if let Some(hub) = domains.get(base_dn) {
            return Arc::clone(hub);
        }
        let hub = DomainHub::new(
            base_dn,
            Arc::clone(&self.config),
            Arc::clone(&self.changelog),
            self.shutdown.clone(),
        );
        hub.start();
        domains.insert(base_dn.to_string(), Arc::clone(&hub));
        hub
    }

    /// All hubs, ordered by base DN.
    pub fn domains(&self) -> Vec<Arc<DomainHub>> {
        let mut hubs: Vec<_> = self.domains.read().values().cloned().collect();
        hubs.sort_by(|a, b| a.base_dn().cmp(b.base_dn()));
        hubs
    }

    /// Run the acceptor side of a handshake on a new session.
    pub async fn accept(&self, session: Arc<dyn PeerSession>) -> Result<HandshakeOutcome> {
        handshake::accept_peer(self, session).await
    }

    /// Connect to another replication server for `base_dn` over `session`.
    pub async fn connect_relay(
        &self,
        session: Arc<dyn PeerSession>,
        base_dn: &str,
    ) -> Result<HandshakeOutcome> {
        handshake::connect_relay_peer(self, session, base_dn).await
    }

    /// Monitoring summary of every domain.
    pub async fn monitor_reports(&self) -> Vec<MonitorReport> {
        let mut reports = Vec::new();
        for hub in self.domains() {
            reports.push(hub.monitor_report().await);
        }
        reports
    }

    /// Stop every domain and the shutdown watcher.
    pub async fn shutdown(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        self.stop_domains().await;
    }

    pub(crate) async fn stop_domains(&self) {
        for hub in self.domains() {
            hub.shutdown().await;
        }
        info!(server_id = self.config.server_id, "replication server stopped");
    }
}
