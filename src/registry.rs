//! The authoritative server registry: the single source of truth consulted
//! by the selector, the status endpoint, and both admin and server-channel
//! listeners.

use crate::model::{ClientAssignmentRecord, LiveClient, ServerEndpoint};
use arc_swap::ArcSwap;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Bound on a single server's assignment ring (§3).
pub const MAX_PER_SERVER_ASSIGNMENTS: usize = 200;
/// Bound on the cluster-wide assignment ring (§3).
pub const MAX_GLOBAL_ASSIGNMENTS: usize = 500;
/// Bound on the ping history ring (§3).
pub const MAX_PING_HISTORY: usize = 10;

/// Per-endpoint derived state.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub weight: u32,
    pub drained: bool,
    pub last_seen_at_ms: i64,
    pub request_count: u64,
    pub rtt_ms: Option<u64>,
    pub ping_history: VecDeque<bool>,
    pub live_clients: Vec<LiveClient>,
    pub assignments: VecDeque<ClientAssignmentRecord>,
}

impl ServerEntry {
    fn new(now_ms: i64) -> Self {
        Self {
            weight: 1,
            drained: false,
            last_seen_at_ms: now_ms,
            request_count: 0,
            rtt_ms: None,
            ping_history: VecDeque::with_capacity(MAX_PING_HISTORY),
            live_clients: Vec::new(),
            assignments: VecDeque::new(),
        }
    }

    /// Percentage of `true` outcomes in `ping_history`; 100 when empty (§3).
    pub fn health_score(&self) -> u8 {
        if self.ping_history.is_empty() {
            return 100;
        }
        let successes = self.ping_history.iter().filter(|ok| **ok).count();
        ((successes * 100) / self.ping_history.len()) as u8
    }

    fn push_ping_outcome(&mut self, success: bool, rtt_ms: Option<u64>) {
        if self.ping_history.len() == MAX_PING_HISTORY {
            self.ping_history.pop_front();
        }
        self.ping_history.push_back(success);
        if success {
            self.rtt_ms = rtt_ms;
        }
    }

    fn push_assignment(&mut self, record: ClientAssignmentRecord) {
        if self.assignments.len() == MAX_PER_SERVER_ASSIGNMENTS {
            self.assignments.pop_front();
        }
        self.assignments.push_back(record);
        self.request_count += 1;
    }
}

/// Point-in-time copy of one endpoint's state, used by the selector and the
/// status endpoint so neither holds the registry lock while doing work.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub endpoint: ServerEndpoint,
    pub weight: u32,
    pub drained: bool,
    pub last_seen_at_ms: i64,
    pub request_count: u64,
    pub rtt_ms: Option<u64>,
    pub health_score: u8,
    pub live_clients: Vec<LiveClient>,
}

/// A full, internally-consistent copy of the registry.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub servers: Vec<ServerSnapshot>,
    pub recent_assignments: Vec<ClientAssignmentRecord>,
}

struct Inner {
    servers: HashMap<ServerEndpoint, ServerEntry>,
    recent_assignments: VecDeque<ClientAssignmentRecord>,
}

/// The authoritative registry of all currently-joined servers.
///
/// Concurrency discipline (§4.1, §5): a single coarse mutex guards the server
/// map and the global assignment ring together, so `remove` can purge every
/// piece of derived state for an endpoint in one critical section. The
/// weighted ring is published separately via atomic copy-on-write so readers
/// building a selection never observe a partially-rebuilt ring, and the
/// round-robin cursor is a free-standing atomic so concurrent static
/// selections never lose an increment.
pub struct ServerRegistry {
    inner: Mutex<Inner>,
    ring: ArcSwap<Vec<ServerEndpoint>>,
    rr_cursor: AtomicU64,
    sticky: Mutex<HashMap<String, ServerEndpoint>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                servers: HashMap::new(),
                recent_assignments: VecDeque::new(),
            }),
            ring: ArcSwap::from_pointee(Vec::new()),
            rr_cursor: AtomicU64::new(0),
            sticky: Mutex::new(HashMap::new()),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Rebuilds the materialized weighted ring from the current server map
    /// and resets the round-robin cursor (§3, §9). Must be called with
    /// `inner` already locked and up to date.
    fn rebuild_ring_locked(&self, inner: &Inner) {
        let mut ring = Vec::new();
        let mut endpoints: Vec<&ServerEndpoint> = inner.servers.keys().collect();
        endpoints.sort();
        for ep in endpoints {
            let weight = inner.servers[ep].weight;
            for _ in 0..weight {
                ring.push(*ep);
            }
        }
        self.ring.store(Arc::new(ring));
        self.rr_cursor.store(0, Ordering::SeqCst);
    }

    pub fn weighted_ring(&self) -> Arc<Vec<ServerEndpoint>> {
        self.ring.load_full()
    }

    /// Advances the shared round-robin cursor by one slot and returns the
    /// pre-increment value, modulo `ring_len`. Non-negative modulo arithmetic
    /// makes wraparound at `u64::MAX` benign (§8 boundary property).
    pub fn next_rr_index(&self, ring_len: u64) -> u64 {
        if ring_len == 0 {
            return 0;
        }
        let raw = self.rr_cursor.fetch_add(1, Ordering::SeqCst);
        raw % ring_len
    }

    /// Registers a new endpoint, or refreshes `lastSeenAt` if already present.
    /// Returns `true` if a new entry was created.
    pub async fn register(&self, endpoint: ServerEndpoint) -> bool {
        let now = Self::now_ms();
        let mut inner = self.inner.lock().await;
        let created = if let Some(entry) = inner.servers.get_mut(&endpoint) {
            entry.last_seen_at_ms = now;
            false
        } else {
            inner.servers.insert(endpoint, ServerEntry::new(now));
            true
        };
        if created {
            self.rebuild_ring_locked(&inner);
            info!(%endpoint, "server registered");
        }
        created
    }

    /// Purges an endpoint and all derived state, and any sticky entries
    /// pointing to it. Used by both `!leave` and the admin `remove` verb, and
    /// by the evictor. Idempotent.
    pub async fn remove(&self, endpoint: &ServerEndpoint) -> bool {
        let mut inner = self.inner.lock().await;
        let existed = inner.servers.remove(endpoint).is_some();
        if existed {
            self.rebuild_ring_locked(&inner);
        }
        drop(inner);

        let mut sticky = self.sticky.lock().await;
        sticky.retain(|_, v| v != endpoint);

        if existed {
            info!(%endpoint, "server removed");
        }
        existed
    }

    /// Replaces an endpoint's live-client list wholesale and refreshes
    /// `lastSeenAt` (§4.1, `!report`).
    pub async fn record_report(&self, endpoint: &ServerEndpoint, live_clients: Vec<LiveClient>) -> bool {
        let now = Self::now_ms();
        let mut inner = self.inner.lock().await;
        match inner.servers.get_mut(endpoint) {
            Some(entry) => {
                entry.last_seen_at_ms = now;
                entry.live_clients = live_clients;
                true
            }
            None => false,
        }
    }

    /// Clamps `w` to `>= 1` and rebuilds the ring. Returns `false` for an
    /// unknown endpoint, leaving state unchanged.
    pub async fn set_weight(&self, endpoint: &ServerEndpoint, w: u32) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.servers.get_mut(endpoint) {
            Some(entry) => {
                entry.weight = w.max(1);
                self.rebuild_ring_locked(&inner);
                true
            }
            None => false,
        }
    }

    /// Sets `drained` on one endpoint, or on every registered endpoint when
    /// `endpoint` is `None` (admin `drain all` / `undrain all`).
    pub async fn set_drained(&self, endpoint: Option<&ServerEndpoint>, drained: bool) -> bool {
        let mut inner = self.inner.lock().await;
        match endpoint {
            Some(ep) => match inner.servers.get_mut(ep) {
                Some(entry) => {
                    entry.drained = drained;
                    true
                }
                None => false,
            },
            None => {
                for entry in inner.servers.values_mut() {
                    entry.drained = drained;
                }
                true
            }
        }
    }

    async fn push_ping_outcome(&self, endpoint: &ServerEndpoint, success: bool, rtt_ms: Option<u64>) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.servers.get_mut(endpoint) {
            entry.push_ping_outcome(success, rtt_ms);
        }
    }

    /// Records a successful probe outcome (§4.2).
    pub async fn record_probe_success(&self, endpoint: &ServerEndpoint, rtt_ms: u64) {
        self.push_ping_outcome(endpoint, true, Some(rtt_ms)).await;
    }

    /// Records a failed probe outcome (§4.2).
    pub async fn record_probe_failure(&self, endpoint: &ServerEndpoint) {
        self.push_ping_outcome(endpoint, false, None).await;
    }

    /// Appends a successful assignment to both the per-server and global
    /// rings, evicting the oldest entry when over the bound, and bumps
    /// `requestCount` and `StickyMemory` (§4.4).
    pub async fn record_assignment(&self, record: ClientAssignmentRecord) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.servers.get_mut(&record.server) {
            entry.push_assignment(record.clone());
        }
        if inner.recent_assignments.len() == MAX_GLOBAL_ASSIGNMENTS {
            inner.recent_assignments.pop_front();
        }
        inner.recent_assignments.push_back(record.clone());
        drop(inner);

        self.sticky
            .lock()
            .await
            .insert(record.client_name.clone(), record.server);
    }

    /// Returns the sticky endpoint for a client name, if any.
    pub async fn sticky_lookup(&self, client_name: &str) -> Option<ServerEndpoint> {
        self.sticky.lock().await.get(client_name).copied()
    }

    /// Clears both bounded assignment rings (admin `clear`). Sticky memory
    /// and per-server request counters are untouched — `clear` is about
    /// history, not live state.
    pub async fn clear_history(&self) {
        let mut inner = self.inner.lock().await;
        inner.recent_assignments.clear();
        for entry in inner.servers.values_mut() {
            entry.assignments.clear();
        }
    }

    /// A point-in-time, internally-consistent copy for the selector and the
    /// status endpoint. The lock is held only long enough to clone.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock().await;
        let mut endpoints: Vec<&ServerEndpoint> = inner.servers.keys().collect();
        endpoints.sort();
        let servers = endpoints
            .into_iter()
            .map(|ep| {
                let entry = &inner.servers[ep];
                ServerSnapshot {
                    endpoint: *ep,
                    weight: entry.weight,
                    drained: entry.drained,
                    last_seen_at_ms: entry.last_seen_at_ms,
                    request_count: entry.request_count,
                    rtt_ms: entry.rtt_ms,
                    health_score: entry.health_score(),
                    live_clients: entry.live_clients.clone(),
                }
            })
            .collect();
        RegistrySnapshot {
            servers,
            recent_assignments: inner.recent_assignments.iter().cloned().collect(),
        }
    }

    /// All registered endpoints whose `lastSeenAt` predates `cutoff_ms`
    /// (§4.3, used by the evictor).
    pub async fn stale_endpoints(&self, cutoff_ms: i64) -> Vec<ServerEndpoint> {
        let inner = self.inner.lock().await;
        inner
            .servers
            .iter()
            .filter(|(_, entry)| entry.last_seen_at_ms < cutoff_ms)
            .map(|(ep, _)| *ep)
            .collect()
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Mode;
    use std::net::{IpAddr, Ipv4Addr};

    fn ep(last_octet: u8, port: u16) -> ServerEndpoint {
        ServerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port)
    }

    #[tokio::test]
    async fn register_is_idempotent_per_endpoint() {
        let reg = ServerRegistry::new();
        assert!(reg.register(ep(1, 9001)).await);
        assert!(!reg.register(ep(1, 9001)).await);
        let snap = reg.snapshot().await;
        assert_eq!(snap.servers.len(), 1);
    }

    #[tokio::test]
    async fn ring_size_equals_sum_of_weights() {
        let reg = ServerRegistry::new();
        reg.register(ep(1, 9001)).await;
        reg.register(ep(2, 9002)).await;
        reg.set_weight(&ep(1, 9001), 3).await;
        assert_eq!(reg.weighted_ring().len(), 4);
    }

    #[tokio::test]
    async fn set_weight_clamps_to_one() {
        let reg = ServerRegistry::new();
        reg.register(ep(1, 9001)).await;
        reg.set_weight(&ep(1, 9001), 0).await;
        assert_eq!(reg.weighted_ring().len(), 1);
    }

    #[tokio::test]
    async fn set_weight_on_unknown_endpoint_is_noop() {
        let reg = ServerRegistry::new();
        assert!(!reg.set_weight(&ep(9, 1), 5).await);
    }

    #[tokio::test]
    async fn remove_purges_derived_state_and_sticky_entries() {
        let reg = ServerRegistry::new();
        let target = ep(1, 9001);
        reg.register(target).await;
        reg.record_assignment(ClientAssignmentRecord {
            client_name: "carol".into(),
            mode: Mode::Sticky,
            assigned_at_ms: 0,
            server: target,
            observed_client_remote: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        })
        .await;
        assert_eq!(reg.sticky_lookup("carol").await, Some(target));

        assert!(reg.remove(&target).await);
        assert!(reg.snapshot().await.servers.is_empty());
        assert_eq!(reg.sticky_lookup("carol").await, None);
        assert_eq!(reg.weighted_ring().len(), 0);
    }

    #[tokio::test]
    async fn remove_twice_is_equivalent_to_once() {
        let reg = ServerRegistry::new();
        let target = ep(1, 9001);
        reg.register(target).await;
        assert!(reg.remove(&target).await);
        assert!(!reg.remove(&target).await);
    }

    #[tokio::test]
    async fn health_score_is_100_when_history_empty() {
        let reg = ServerRegistry::new();
        reg.register(ep(1, 9001)).await;
        let snap = reg.snapshot().await;
        assert_eq!(snap.servers[0].health_score, 100);
    }

    #[tokio::test]
    async fn ping_history_is_bounded_and_scores_correctly() {
        let reg = ServerRegistry::new();
        let target = ep(1, 9001);
        reg.register(target).await;
        for _ in 0..12 {
            reg.record_probe_success(&target, 5).await;
        }
        reg.record_probe_failure(&target).await;
        let snap = reg.snapshot().await;
        let s = &snap.servers[0];
        // 10 successes fall off to 9 successes + 1 failure = 90%.
        assert_eq!(s.health_score, 90);
    }

    #[tokio::test]
    async fn rr_cursor_never_yields_out_of_range_index() {
        let reg = ServerRegistry::new();
        reg.rr_cursor.store(u64::MAX - 1, Ordering::SeqCst);
        for _ in 0..4 {
            let idx = reg.next_rr_index(3);
            assert!(idx < 3);
        }
    }
}

/// Property tests for the §8 registry invariants: the ring always tracks the
/// sum of registered weights, and `remove` leaves no trace of a purged
/// endpoint anywhere derived state is kept. The registry's API is async, so
/// each case opens its own single-threaded runtime to drive it from
/// proptest's synchronous test functions.
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::model::Mode;
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ep(last_octet: u8, port: u16) -> ServerEndpoint {
        ServerEndpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port)
    }

    proptest! {
        #[test]
        fn ring_length_always_equals_sum_of_weights(weights in prop::collection::vec(1u32..=10, 1..8)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let reg = ServerRegistry::new();
                for (i, &w) in weights.iter().enumerate() {
                    let endpoint = ep(i as u8 + 1, 9000 + i as u16);
                    reg.register(endpoint).await;
                    reg.set_weight(&endpoint, w).await;
                }
                let expected: u32 = weights.iter().sum();
                prop_assert_eq!(reg.weighted_ring().len() as u32, expected);
                Ok(())
            })?;
        }

        #[test]
        fn remove_purges_all_derived_state(n in 1usize..6, pick in 0usize..6) {
            let removed_idx = pick % n;
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let reg = ServerRegistry::new();
                let mut endpoints = Vec::new();
                for i in 0..n {
                    let endpoint = ep(i as u8 + 1, 9000 + i as u16);
                    reg.register(endpoint).await;
                    endpoints.push(endpoint);
                }
                let target = endpoints[removed_idx];
                reg.record_assignment(ClientAssignmentRecord {
                    client_name: "pbt-client".into(),
                    mode: Mode::Sticky,
                    assigned_at_ms: 0,
                    server: target,
                    observed_client_remote: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                })
                .await;

                reg.remove(&target).await;

                let snap = reg.snapshot().await;
                prop_assert!(!snap.servers.iter().any(|s| s.endpoint == target));
                prop_assert_eq!(reg.sticky_lookup("pbt-client").await, None);
                prop_assert!(!reg.weighted_ring().iter().any(|e| *e == target));
                Ok(())
            })?;
        }
    }
}
