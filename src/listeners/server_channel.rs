//! REG_PORT: `!join` / `!leave` / `!report` from servers (§4.6).

use crate::error::LbError;
use crate::model::{LiveClient, ServerEndpoint};
use crate::registry::ServerRegistry;
use crate::shutdown::Shutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ServerChannelListener {
    registry: Arc<ServerRegistry>,
}

impl ServerChannelListener {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self { registry }
    }

    pub async fn serve(self, listener: TcpListener, shutdown: Shutdown) {
        let registry = self.registry;
        super::run_accept_loop(listener, shutdown, move |stream, addr| {
            let registry = registry.clone();
            async move {
                handle_connection(stream, addr, registry).await;
            }
        })
        .await;
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, registry: Arc<ServerRegistry>) {
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

    match dispatch(&line, addr, &registry).await {
        Reply::Ack => {
            let _ = write_half.write_all(b"!ack\n").await;
        }
        Reply::Bye => {
            let _ = write_half.write_all(b"!bye\n").await;
        }
        Reply::None => {}
        Reply::Err => {
            let _ = write_half.write_all(b"!err\n").await;
        }
    }
}

enum Reply {
    Ack,
    Bye,
    None,
    Err,
}

async fn dispatch(line: &str, addr: SocketAddr, registry: &ServerRegistry) -> Reply {
    let tokens: Vec<&str> = line.trim().split_whitespace().collect();
    let Some(&verb) = tokens.first() else {
        warn!(remote = %addr, error = %LbError::Protocol("empty message".into()), "malformed server message");
        return Reply::Err;
    };

    match verb {
        "!join" => match tokens.last().and_then(|p| p.parse::<u16>().ok()) {
            Some(port) => {
                let endpoint = ServerEndpoint::new(addr.ip(), port);
                let created = registry.register(endpoint).await;
                if created {
                    info!(%endpoint, "server joined");
                }
                Reply::Ack
            }
            None => {
                let err = LbError::Protocol("malformed !join (no trailing port)".into());
                warn!(remote = %addr, error = %err, "malformed server message");
                Reply::Err
            }
        },
        "!leave" => match tokens.get(1).and_then(|p| p.parse::<u16>().ok()) {
            Some(port) => {
                let endpoint = ServerEndpoint::new(addr.ip(), port);
                registry.remove(&endpoint).await;
                Reply::Bye
            }
            None => {
                let err = LbError::Protocol("malformed !leave (no trailing port)".into());
                warn!(remote = %addr, error = %err, "malformed server message");
                Reply::Err
            }
        },
        "!report" => match parse_report(&tokens) {
            Some((port, clients)) => {
                let endpoint = ServerEndpoint::new(addr.ip(), port);
                registry.record_report(&endpoint, clients).await;
                Reply::None
            }
            None => {
                let err = LbError::Protocol("malformed !report".into());
                warn!(remote = %addr, error = %err, "malformed server message");
                Reply::Err
            }
        },
        other => {
            let err = LbError::Protocol(format!("unrecognized verb {other}"));
            warn!(remote = %addr, error = %err, "malformed server message");
            Reply::Err
        }
    }
}

/// Parses `!report <port> clients <n> <name>@<ip> …` (§4.6).
fn parse_report(tokens: &[&str]) -> Option<(u16, Vec<LiveClient>)> {
    let port: u16 = tokens.get(1)?.parse().ok()?;
    if !tokens.get(2)?.eq_ignore_ascii_case("clients") {
        return None;
    }
    let n: usize = tokens.get(3)?.parse().ok()?;
    let rest = &tokens[4..];
    if rest.len() < n {
        return None;
    }
    let clients = rest[..n]
        .iter()
        .map(|tok| match tok.rfind('@') {
            Some(idx) => LiveClient {
                name: tok[..idx].to_string(),
                ip: tok[idx + 1..].to_string(),
            },
            None => LiveClient {
                name: tok.to_string(),
                ip: "unknown".to_string(),
            },
        })
        .collect();
    Some((port, clients))
}
