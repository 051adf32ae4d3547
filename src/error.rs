//! Crate-wide error taxonomy.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by core LB operations, mirroring the §7 taxonomy.
///
/// `Protocol` and `Config` carry an already-composed message: the call site
/// writes the wire text once, and the error's `Display` is that text, so
/// logging and the line-protocol reply read from the same string. `Bind` is
/// the one variant `main` treats as fatal; the rest are logged and the
/// offending connection or command is rejected without affecting anything
/// else.
#[derive(Debug, Error)]
pub enum LbError {
    #[error("{0}")]
    Protocol(String),

    #[error("no schedulable server available")]
    NoCapacity,

    #[error("{0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, LbError>;
