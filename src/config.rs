//! Process-wide mutable configuration, shared behind a single accessor.
//!
//! Every listener reads the current config via [`SharedConfig::load`] on each
//! request; admin mutations replace the whole record atomically so readers
//! never observe a half-updated set of ban lists.

use crate::model::Mode;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

pub const MIN_PING_INTERVAL_MS: u64 = 200;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_EVICTION_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub default_mode: Mode,
    pub max_per_server: Option<u32>,
    pub ping_interval_ms: u64,
    pub eviction_timeout_ms: u64,
    pub banned_ips: HashSet<IpAddr>,
    pub banned_names: HashSet<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_mode: Mode::Static,
            max_per_server: None,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            eviction_timeout_ms: DEFAULT_EVICTION_TIMEOUT_MS,
            banned_ips: HashSet::new(),
            banned_names: HashSet::new(),
        }
    }
}

impl GlobalConfig {
    pub fn is_schedulable_by_capacity(&self, live_count: usize) -> bool {
        match self.max_per_server {
            Some(cap) => (live_count as u32) < cap,
            None => true,
        }
    }
}

/// Clamps a requested ping interval to the floor required by §4.2.
pub fn clamp_ping_interval(ms: u64) -> u64 {
    ms.max(MIN_PING_INTERVAL_MS)
}

/// Clamps a requested weight to the floor required by §3.
pub fn clamp_weight(w: i64) -> u32 {
    if w < 1 { 1 } else { w as u32 }
}

/// Atomically-published handle to the current [`GlobalConfig`].
///
/// Cloning is cheap (an `Arc` bump); every holder observes config changes
/// published after it was cloned.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<ArcSwap<GlobalConfig>>,
}

impl SharedConfig {
    pub fn new(initial: GlobalConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    pub fn load(&self) -> Arc<GlobalConfig> {
        self.inner.load_full()
    }

    /// Read-copy-update: applies `f` to a clone of the current config and
    /// atomically publishes the result.
    pub fn rcu(&self, f: impl Fn(&GlobalConfig) -> GlobalConfig) {
        self.inner.rcu(|cur| f(cur));
    }
}
