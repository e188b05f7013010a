//! Background tasks of a domain and of the server.

use crate::domain::DomainHub;
use crate::server::ReplicationServer;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Spawn the broadcaster, status evaluator and monitoring publisher of `hub`.
pub fn spawn_domain_tasks(hub: &Arc<DomainHub>) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        tokio::spawn(run_broadcaster(Arc::clone(hub))),
        tokio::spawn(run_monitoring_publisher(Arc::clone(hub))),
    ];
    if hub.config().degraded_status_threshold > 0 {
        handles.push(tokio::spawn(run_status_evaluator(Arc::clone(hub))));
    } else {
        debug!(base_dn = %hub.base_dn(), "status evaluator disabled");
    }
    handles
}

/// Send the pending batch whenever something is enqueued, at least once per period.
async fn run_broadcaster(hub: Arc<DomainHub>) {
    let period = hub.config().broadcast_period();
    loop {
        tokio::select! {
            _ = hub.broadcaster().wait() => {}
            _ = tokio::time::sleep(period) => {}
        }
        if hub.is_stopped() {
            break;
        }
        hub.send_pending_batch().await;
    }
}

async fn run_status_evaluator(hub: Arc<DomainHub>) {
    let mut ticker = periodic(hub.config().status_analyzer_period());
    loop {
        ticker.tick().await;
        if hub.is_stopped() {
            break;
        }
        let changed = hub.check_degraded_status().await;
        if changed > 0 {
            debug!(base_dn = %hub.base_dn(), changed, "status evaluator changed peer statuses");
        }
    }
}

async fn run_monitoring_publisher(hub: Arc<DomainHub>) {
    let mut ticker = periodic(hub.config().monitoring_period());
    loop {
        ticker.tick().await;
        if hub.is_stopped() {
            break;
        }
        hub.request_remote_monitoring().await;
        let data = hub.compute_monitor_data().await;
        debug!(
            base_dn = %hub.base_dn(),
            data_peers = data.ds_missing_changes.len(),
            relay_peers = data.rs_missing_changes.len(),
            "monitoring data computed"
        );
    }
}

/// An interval whose first tick is one period away.
fn periodic(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Stop every domain once the server's shutdown handle fires.
pub fn spawn_shutdown_watcher(server: Arc<ReplicationServer>) -> JoinHandle<()> {
    let shutdown = server.shutdown_handle().clone();
    let server: Weak<ReplicationServer> = Arc::downgrade(&server);
    tokio::spawn(async move {
        shutdown.wait().await;
        let Some(server) = server.upgrade() else {
            return;
        };
        warn!(
            reason = %shutdown.reason().unwrap_or_default(),
            "stopping every replication domain"
        );
        server.stop_domains().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{ChangelogDb, InMemoryChangelog};
    use crate::config::BrokerConfig;
    use crate::csn::Csn;
    use crate::message::{PeerKind, ReplMessage, UpdateMsg};
    use crate::peer::test_support::{params, peer};
    use crate::server::ServerShutdown;
    use crate::status::ServerStatus;
    use bytes::Bytes;

    const DN: &str = "dc=example,dc=com";

    fn hub(config: BrokerConfig) -> Arc<DomainHub> {
        DomainHub::new(
            DN,
            Arc::new(config),
            Arc::new(InMemoryChangelog::new()) as Arc<dyn ChangelogDb>,
            ServerShutdown::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcaster_sends_topology_after_registration() {
        let hub = hub(BrokerConfig {
            server_id: 100,
            ..BrokerConfig::default()
        });
        hub.start();
        let (ds1, _a) = peer(params(1, PeerKind::DataPeer, 7));
        let (ds2, _b) = peer(params(2, PeerKind::DataPeer, 7));
        let mut rx1 = ds1.take_control_receiver_for_test().unwrap();
        let mut rx2 = ds2.take_control_receiver_for_test().unwrap();
        hub.register_peer(&ds1).await.unwrap();
        hub.register_peer(&ds2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let topology = |rx: &mut tokio::sync::mpsc::UnboundedReceiver<ReplMessage>| {
            let mut count = 0;
            while let Ok(msg) = rx.try_recv() {
                if matches!(msg, ReplMessage::Topology(_)) {
                    count += 1;
                }
            }
            count
        };
        // ds2 misses out only if the batch went out between the registrations
        assert_eq!(topology(&mut rx1), 1);
        assert!(topology(&mut rx2) <= 1);
        hub.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_evaluator_runs_periodically() {
        let hub = hub(BrokerConfig {
            server_id: 100,
            degraded_status_threshold: 1,
            status_analyzer_period_ms: 1_000,
            ..BrokerConfig::default()
        });
        let (source, _a) = peer(params(1, PeerKind::DataPeer, 7));
        let (slow, _b) = peer(params(2, PeerKind::DataPeer, 7));
        slow.skip_catch_up_for_test();
        hub.register_peer(&source).await.unwrap();
        hub.register_peer(&slow).await.unwrap();
        hub.accept_update(UpdateMsg::new(Csn::new(1, 1, 1), Bytes::new()), &source)
            .await
            .unwrap();
        hub.start();

        assert_eq!(slow.status(), ServerStatus::Normal);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(slow.status(), ServerStatus::Degraded);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_evaluator_when_disabled() {
        let hub = hub(BrokerConfig {
            degraded_status_threshold: 0,
            ..BrokerConfig::default()
        });
        let handles = spawn_domain_tasks(&hub);
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.abort();
        }
    }
}
