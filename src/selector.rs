//! The three selection policies (§4.4): static weighted round-robin, dynamic
//! lowest-RTT, and sticky-with-fallback.

use crate::config::SharedConfig;
use crate::model::{ClientAssignmentRecord, Mode, ServerEndpoint};
use crate::registry::{RegistrySnapshot, ServerRegistry, ServerSnapshot};
use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Maximum RTT delta (ms) within which the dynamic policy prefers fewer live
/// clients over the strict minimum (§4.4).
const DYNAMIC_TIEBREAK_WINDOW_MS: u64 = 10;

pub struct Selector {
    registry: Arc<ServerRegistry>,
    config: SharedConfig,
}

fn is_schedulable(entry: &ServerSnapshot, max_per_server: Option<u32>) -> bool {
    if entry.drained {
        return false;
    }
    match max_per_server {
        Some(cap) => (entry.live_clients.len() as u32) < cap,
        None => true,
    }
}

impl Selector {
    pub fn new(registry: Arc<ServerRegistry>, config: SharedConfig) -> Self {
        Self { registry, config }
    }

    /// Runs the requested policy and, on success, records the assignment
    /// (bumping `requestCount`, populating sticky memory, and appending to
    /// both assignment rings) before returning the chosen endpoint.
    pub async fn select_and_record(
        &self,
        client_name: &str,
        mode: Mode,
        observed_client_remote: IpAddr,
    ) -> Option<ServerEndpoint> {
        let snapshot = self.registry.snapshot().await;
        let cfg = self.config.load();
        let chosen = match mode {
            Mode::Static => self.select_static(&snapshot).await,
            Mode::Dynamic => {
                self.select_dynamic_with_fallback(&snapshot, cfg.max_per_server).await
            }
            Mode::Sticky => self.select_sticky(client_name, &snapshot, cfg.max_per_server).await,
        };

        if let Some(server) = chosen {
            self.registry
                .record_assignment(ClientAssignmentRecord {
                    client_name: client_name.to_string(),
                    mode,
                    assigned_at_ms: Utc::now().timestamp_millis(),
                    server,
                    observed_client_remote,
                })
                .await;
        }
        chosen
    }

    async fn select_static(&self, snapshot: &RegistrySnapshot) -> Option<ServerEndpoint> {
        let by_endpoint: HashMap<ServerEndpoint, &ServerSnapshot> =
            snapshot.servers.iter().map(|s| (s.endpoint, s)).collect();
        let cfg = self.config.load();

        let ring = self.registry.weighted_ring();
        let pool: Vec<ServerEndpoint> = if !ring.is_empty() {
            ring.as_ref().clone()
        } else {
            snapshot.servers.iter().map(|s| s.endpoint).collect()
        };

        if pool.is_empty() {
            return None;
        }

        let pool_len = pool.len() as u64;
        let walk_budget = 2 * pool_len + 1;
        for _ in 0..walk_budget {
            let idx = self.registry.next_rr_index(pool_len) as usize;
            let candidate = pool[idx];
            if let Some(entry) = by_endpoint.get(&candidate)
                && is_schedulable(entry, cfg.max_per_server)
            {
                return Some(candidate);
            }
        }

        snapshot
            .servers
            .iter()
            .find(|s| is_schedulable(s, cfg.max_per_server))
            .map(|s| s.endpoint)
    }

    fn select_dynamic(
        &self,
        snapshot: &RegistrySnapshot,
        max_per_server: Option<u32>,
    ) -> Option<ServerEndpoint> {
        let candidates: Vec<&ServerSnapshot> = snapshot
            .servers
            .iter()
            .filter(|s| is_schedulable(s, max_per_server) && s.rtt_ms.is_some())
            .collect();

        if candidates.is_empty() {
            debug!("dynamic selection has no probed schedulable server, falling back to static");
            return None;
        }

        let min_rtt = candidates.iter().map(|s| s.rtt_ms.unwrap()).min().unwrap();
        candidates
            .into_iter()
            .filter(|s| s.rtt_ms.unwrap() <= min_rtt + DYNAMIC_TIEBREAK_WINDOW_MS)
            .min_by_key(|s| (s.live_clients.len(), s.endpoint))
            .map(|s| s.endpoint)
    }

    async fn select_sticky(
        &self,
        client_name: &str,
        snapshot: &RegistrySnapshot,
        max_per_server: Option<u32>,
    ) -> Option<ServerEndpoint> {
        if let Some(ep) = self.registry.sticky_lookup(client_name).await
            && let Some(entry) = snapshot.servers.iter().find(|s| s.endpoint == ep)
            && is_schedulable(entry, max_per_server)
        {
            return Some(ep);
        }
        self.select_dynamic_with_fallback(snapshot, max_per_server).await
    }

    /// `select_dynamic` falls back to static selection when it finds no
    /// probed candidate (§4.4); sticky and a direct dynamic request share
    /// this path so the fallback only runs once selection has actually
    /// missed.
    async fn select_dynamic_with_fallback(
        &self,
        snapshot: &RegistrySnapshot,
        max_per_server: Option<u32>,
    ) -> Option<ServerEndpoint> {
        match self.select_dynamic(snapshot, max_per_server) {
            Some(ep) => Some(ep),
            None => self.select_static(snapshot).await,
        }
    }
}
