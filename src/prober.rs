//! Periodic RTT probing of every registered server (§4.2).

use crate::config::SharedConfig;
use crate::registry::ServerRegistry;
use crate::shutdown::Shutdown;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub struct RttProber {
    registry: Arc<ServerRegistry>,
    config: SharedConfig,
    shutdown: Shutdown,
}

impl RttProber {
    pub fn new(registry: Arc<ServerRegistry>, config: SharedConfig, shutdown: Shutdown) -> Self {
        Self { registry, config, shutdown }
    }

    /// Runs the probe loop until shutdown. Reading `pingIntervalMs` fresh on
    /// every tick means an admin `set ping` change is picked up on the next
    /// cycle, equivalent to tearing down and restarting the schedule (§4.2).
    pub async fn run(&self) {
        loop {
            let interval_ms = self.config.load().ping_interval_ms;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
                _ = self.shutdown.wait() => return,
            }
            if self.shutdown.is_triggered() {
                return;
            }
            self.probe_once().await;
        }
    }

    async fn probe_once(&self) {
        let snapshot = self.registry.snapshot().await;
        let interval_ms = self.config.load().ping_interval_ms;
        let probe_timeout = Duration::from_millis(interval_ms.max(400) / 2);

        let mut tasks = Vec::with_capacity(snapshot.servers.len());
        for server in snapshot.servers {
            let registry = self.registry.clone();
            tasks.push(tokio::spawn(async move {
                let outcome = probe_endpoint(server.endpoint.addr, server.endpoint.port, probe_timeout).await;
                match outcome {
                    Some(rtt_ms) => registry.record_probe_success(&server.endpoint, rtt_ms).await,
                    None => registry.record_probe_failure(&server.endpoint).await,
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Opens a connection, sends `ping\n`, and checks for a `pong` reply within
/// `probe_timeout`. Returns the observed round trip in milliseconds on
/// success.
async fn probe_endpoint(
    addr: std::net::IpAddr,
    port: u16,
    probe_timeout: Duration,
) -> Option<u64> {
    let started = Instant::now();
    let attempt = async {
        let mut stream = TcpStream::connect((addr, port)).await.ok()?;
        stream.write_all(b"ping\n").await.ok()?;
        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.ok()?;
        if line.trim().eq_ignore_ascii_case("pong") {
            Some(())
        } else {
            None
        }
    };

    match timeout(probe_timeout, attempt).await {
        Ok(Some(())) => {
            let rtt = started.elapsed().as_nanos() / 1_000_000;
            Some(rtt as u64)
        }
        Ok(None) => {
            debug!(%addr, port, "probe failed or returned non-pong response");
            None
        }
        Err(_) => {
            debug!(%addr, port, "probe timed out");
            None
        }
    }
}
