//! Periodic sweep that removes servers which have gone quiet (§4.3).

use crate::config::SharedConfig;
use crate::registry::ServerRegistry;
use crate::shutdown::Shutdown;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Evictor sweep period. Fixed, unlike `pingIntervalMs` which is
/// admin-tunable (§4.3).
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct Evictor {
    registry: Arc<ServerRegistry>,
    config: SharedConfig,
    shutdown: Shutdown,
}

impl Evictor {
    pub fn new(registry: Arc<ServerRegistry>, config: SharedConfig, shutdown: Shutdown) -> Self {
        Self { registry, config, shutdown }
    }

    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = self.shutdown.wait() => return,
            }
            if self.shutdown.is_triggered() {
                return;
            }
            self.sweep_once().await;
        }
    }

    async fn sweep_once(&self) {
        let eviction_timeout_ms = self.config.load().eviction_timeout_ms as i64;
        let cutoff_ms = Utc::now().timestamp_millis() - eviction_timeout_ms;
        let stale = self.registry.stale_endpoints(cutoff_ms).await;
        for endpoint in stale {
            if self.registry.remove(&endpoint).await {
                info!(%endpoint, "evicted stale server");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::model::ServerEndpoint;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn sweep_removes_only_servers_past_the_cutoff() {
        let registry = Arc::new(ServerRegistry::new());
        let stale = ServerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9001);
        let fresh = ServerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 9002);
        registry.register(stale).await;
        registry.register(fresh).await;

        let mut config = GlobalConfig::default();
        config.eviction_timeout_ms = 15_000;
        let shared = SharedConfig::new(config);
        let evictor = Evictor::new(registry.clone(), shared, Shutdown::new());

        // Fresh join above shouldn't be evicted with the default timeout.
        evictor.sweep_once().await;
        let snap = registry.snapshot().await;
        assert_eq!(snap.servers.len(), 2);

        // Force eviction by dropping the timeout to something already past.
        evictor.config.rcu(|c| {
            let mut next = c.clone();
            next.eviction_timeout_ms = 0;
            next
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        evictor.sweep_once().await;
        let snap = registry.snapshot().await;
        assert!(snap.servers.is_empty());
    }

    #[tokio::test]
    async fn sweep_purges_sticky_entries_pointing_at_evicted_server() {
        let registry = Arc::new(ServerRegistry::new());
        let target = ServerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 9003);
        registry.register(target).await;
        registry
            .record_assignment(crate::model::ClientAssignmentRecord {
                client_name: "evicted-client".into(),
                mode: crate::model::Mode::Sticky,
                assigned_at_ms: 0,
                server: target,
                observed_client_remote: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            })
            .await;

        let mut config = GlobalConfig::default();
        config.eviction_timeout_ms = 0;
        let shared = SharedConfig::new(config);
        let evictor = Evictor::new(registry.clone(), shared, Shutdown::new());

        tokio::time::sleep(Duration::from_millis(5)).await;
        evictor.sweep_once().await;

        assert_eq!(registry.sticky_lookup("evicted-client").await, None);
    }
}
