//! Core value types shared by the registry, selector, and listeners.

use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// A registered server's address. Identity is structural equality of both
/// fields; once constructed an endpoint is never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerEndpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// One client seen by a server, as last reported via `!report`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveClient {
    pub name: String,
    pub ip: String,
}

/// Selection policy requested by a client, or used as the cluster default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Static,
    Dynamic,
    Sticky,
}

impl Mode {
    /// Parses a mode token case-insensitively; returns `None` for anything
    /// else so callers can fall back to the configured default.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "static" => Some(Mode::Static),
            "dynamic" => Some(Mode::Dynamic),
            "sticky" => Some(Mode::Sticky),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Static => "static",
            Mode::Dynamic => "dynamic",
            Mode::Sticky => "sticky",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record of one successful client-to-server assignment.
#[derive(Debug, Clone, Serialize)]
pub struct ClientAssignmentRecord {
    pub client_name: String,
    pub mode: Mode,
    pub assigned_at_ms: i64,
    pub server: ServerEndpoint,
    pub observed_client_remote: IpAddr,
}
