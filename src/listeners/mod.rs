//! Shared accept-loop plumbing for the four listeners (§5).

pub mod admin;
pub mod client;
pub mod server_channel;
pub mod status;

use crate::shutdown::Shutdown;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// Short accept timeout shared by every listener (§5) so a shutdown flag is
/// checked promptly even with no pending connections.
const ACCEPT_POLL: Duration = Duration::from_secs(1);

/// Runs `listener`'s accept loop until `shutdown` is triggered, spawning
/// `handle` on a fresh task per accepted connection. A handler panic or
/// error never tears down the loop itself (§7 propagation policy).
pub async fn run_accept_loop<F, Fut>(listener: TcpListener, shutdown: Shutdown, handle: F)
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        if shutdown.is_triggered() {
            return;
        }
        tokio::select! {
            _ = shutdown.wait() => return,
            accepted = tokio::time::timeout(ACCEPT_POLL, listener.accept()) => {
                match accepted {
                    Ok(Ok((stream, addr))) => {
                        let handle = handle.clone();
                        tokio::spawn(async move { handle(stream, addr).await; });
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "accept failed");
                    }
                    Err(_) => {
                        // Accept timeout: loop around to re-check shutdown.
                    }
                }
            }
        }
    }
}
