//! CLIENT_PORT: one HELLO line in, one assignment line out (§4.5).

use crate::config::SharedConfig;
use crate::error::LbError;
use crate::model::Mode;
use crate::selector::Selector;
use crate::shutdown::Shutdown;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const NO_SERVER_AVAILABLE: &str = "NO_SERVER_AVAILABLE";

pub struct ClientHandshakeListener {
    selector: Arc<Selector>,
    config: SharedConfig,
    anon_counter: Arc<AtomicU64>,
}

impl ClientHandshakeListener {
    pub fn new(selector: Arc<Selector>, config: SharedConfig) -> Self {
        Self {
            selector,
            config,
            anon_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn serve(self, listener: TcpListener, shutdown: Shutdown) {
        let selector = self.selector;
        let config = self.config;
        let anon_counter = self.anon_counter;

        super::run_accept_loop(listener, shutdown, move |stream, addr| {
            let selector = selector.clone();
            let config = config.clone();
            let anon_counter = anon_counter.clone();
            async move {
                handle_connection(stream, addr, selector, config, anon_counter).await;
            }
        })
        .await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    selector: Arc<Selector>,
    config: SharedConfig,
    anon_counter: Arc<AtomicU64>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let read_result = tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await;
    let Ok(Ok(n)) = read_result else {
        return;
    };
    if n == 0 {
        return;
    }

    let Some((client_name, mode)) = parse_hello(&line, &config, &anon_counter) else {
        let err = LbError::Protocol(format!("malformed HELLO from {addr}"));
        warn!(error = %err, "rejected client handshake");
        let _ = write_half.write_all(format!("{NO_SERVER_AVAILABLE}\n").as_bytes()).await;
        return;
    };

    let cfg = config.load();
    if cfg.banned_names.contains(&client_name) || cfg.banned_ips.contains(&addr.ip()) {
        let err = LbError::NoCapacity;
        warn!(%client_name, remote = %addr, error = %err, "rejected banned client");
        let _ = write_half.write_all(format!("{NO_SERVER_AVAILABLE}\n").as_bytes()).await;
        return;
    }

    match selector.select_and_record(&client_name, mode, addr.ip()).await {
        Some(server) => {
            info!(%client_name, %server, ?mode, "assigned client");
            let reply = format!("{}\n", server.to_string().replace('/', ""));
            let _ = write_half.write_all(reply.as_bytes()).await;
        }
        None => {
            let err = LbError::NoCapacity;
            debug!(%client_name, ?mode, error = %err, "no schedulable server");
            let _ = write_half.write_all(format!("{NO_SERVER_AVAILABLE}\n").as_bytes()).await;
        }
    }
}

/// Parses `HELLO <name> [mode]`, case-insensitive on `HELLO` and the mode
/// token. A missing or unrecognized mode falls back to `defaultMode`; a
/// missing name is assigned a monotonic `Client-<N>` placeholder (§4.5).
fn parse_hello(
    line: &str,
    config: &SharedConfig,
    anon_counter: &AtomicU64,
) -> Option<(String, Mode)> {
    let mut tokens = line.trim().split_whitespace();
    let verb = tokens.next()?;
    if !verb.eq_ignore_ascii_case("HELLO") {
        return None;
    }

    let name_token = tokens.next();
    let mode_token = tokens.next();

    let default_mode = config.load().default_mode;
    let mode = mode_token.and_then(Mode::parse).unwrap_or(default_mode);

    let name = match name_token {
        Some(n) => n.to_string(),
        None => format!("Client-{}", anon_counter.fetch_add(1, Ordering::SeqCst)),
    };

    Some((name, mode))
}
