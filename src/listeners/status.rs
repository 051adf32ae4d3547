//! STATUS_PORT: one JSON document per connection (§4.7, §6).

use crate::config::SharedConfig;
use crate::model::Mode;
use crate::registry::ServerRegistry;
use crate::shutdown::Shutdown;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// At most this many of the most recent assignments are included in the
/// status document (§6).
const MAX_STATUS_ASSIGNMENTS: usize = 20;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusDocument {
    up_since: i64,
    default_mode: Mode,
    max_per_server: Option<u32>,
    ping_interval_ms: u64,
    eviction_timeout_ms: u64,
    banned_ips: Vec<String>,
    banned_names: Vec<String>,
    servers: Vec<StatusServer>,
    recent_assignments: Vec<StatusAssignment>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusServer {
    addr: String,
    port: u16,
    rtt_ms: i64,
    weight: u32,
    drained: bool,
    live_count: usize,
    request_count: u64,
    health_score: u8,
    last_seen_ms: i64,
    live_clients: Vec<crate::model::LiveClient>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusAssignment {
    client_name: String,
    mode: Mode,
    server: String,
    assigned_at: i64,
}

pub struct StatusEndpoint {
    registry: Arc<ServerRegistry>,
    config: SharedConfig,
    up_since_ms: i64,
}

impl StatusEndpoint {
    pub fn new(registry: Arc<ServerRegistry>, config: SharedConfig, up_since_ms: i64) -> Self {
        Self { registry, config, up_since_ms }
    }

    pub async fn serve(self, listener: TcpListener, shutdown: Shutdown) {
        let registry = self.registry;
        let config = self.config;
        let up_since_ms = self.up_since_ms;

        super::run_accept_loop(listener, shutdown, move |stream, addr| {
            let registry = registry.clone();
            let config = config.clone();
            async move {
                handle_connection(stream, addr, registry, config, up_since_ms).await;
            }
        })
        .await;
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    _addr: SocketAddr,
    registry: Arc<ServerRegistry>,
    config: SharedConfig,
    up_since_ms: i64,
) {
    // Take a snapshot under one brief lock, then serialize outside it (§4.7).
    let snapshot = registry.snapshot().await;
    let cfg = config.load();
    let document = build_document(&snapshot, &cfg, up_since_ms);

    let body = match serde_json::to_string(&document) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "failed to serialize status document");
            return;
        }
    };
    let _ = stream.write_all(body.as_bytes()).await;
}

fn build_document(
    snapshot: &crate::registry::RegistrySnapshot,
    cfg: &crate::config::GlobalConfig,
    up_since_ms: i64,
) -> StatusDocument {
    let mut banned_ips: Vec<String> = cfg.banned_ips.iter().map(|ip| ip.to_string()).collect();
    banned_ips.sort();
    let mut banned_names: Vec<String> = cfg.banned_names.iter().cloned().collect();
    banned_names.sort();

    let servers = snapshot
        .servers
        .iter()
        .map(|s| StatusServer {
            addr: s.endpoint.addr.to_string(),
            port: s.endpoint.port,
            rtt_ms: s.rtt_ms.map(|ms| ms as i64).unwrap_or(-1),
            weight: s.weight,
            drained: s.drained,
            live_count: s.live_clients.len(),
            request_count: s.request_count,
            health_score: s.health_score,
            last_seen_ms: s.last_seen_at_ms,
            live_clients: s.live_clients.clone(),
        })
        .collect();

    let total = snapshot.recent_assignments.len();
    let start = total.saturating_sub(MAX_STATUS_ASSIGNMENTS);
    let recent_assignments = snapshot.recent_assignments[start..]
        .iter()
        .map(|r| StatusAssignment {
            client_name: r.client_name.clone(),
            mode: r.mode,
            server: r.server.to_string(),
            assigned_at: r.assigned_at_ms,
        })
        .collect();

    StatusDocument {
        up_since: up_since_ms,
        default_mode: cfg.default_mode,
        max_per_server: cfg.max_per_server,
        ping_interval_ms: cfg.ping_interval_ms,
        eviction_timeout_ms: cfg.eviction_timeout_ms,
        banned_ips,
        banned_names,
        servers,
        recent_assignments,
    }
}
