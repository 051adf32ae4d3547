//! The admin command grammar (§4.8): shared by both the ADMIN_PORT listener
//! and the stdin console, so both front ends execute identical semantics.

use crate::config::{clamp_ping_interval, clamp_weight, SharedConfig};
use crate::error::LbError;
use crate::model::{Mode, ServerEndpoint};
use crate::registry::ServerRegistry;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

pub struct AdminInterpreter {
    registry: Arc<ServerRegistry>,
    config: SharedConfig,
}

/// Parses `host:port` using the LAST colon, so bracketed/numeric IPv6
/// addresses don't split prematurely (§4.8).
fn parse_endpoint(s: &str) -> Option<ServerEndpoint> {
    let idx = s.rfind(':')?;
    let (host, port) = s.split_at(idx);
    let port = &port[1..];
    let addr: IpAddr = host.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some(ServerEndpoint::new(addr, port))
}

/// A malformed-but-recognized command (§7 ConfigError): no state mutation, a
/// single `ERROR: <message>` reply line.
fn config_err(message: impl Into<String>) -> Vec<String> {
    vec![format!("ERROR: {}", LbError::Config(message.into()))]
}

impl AdminInterpreter {
    pub fn new(registry: Arc<ServerRegistry>, config: SharedConfig) -> Self {
        Self { registry, config }
    }

    /// Executes one admin line and returns the response lines (without the
    /// trailing `END` sentinel, which the listener/console appends).
    pub async fn execute(&self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.trim().split_whitespace().collect();
        let Some(verb) = tokens.first() else {
            return vec![LbError::Protocol("Unknown command".to_string()).to_string()];
        };

        match verb.to_ascii_lowercase().as_str() {
            "servers" => self.cmd_servers().await,
            "live" => self.cmd_live().await,
            "status" => {
                let mut lines = self.cmd_servers().await;
                lines.extend(self.cmd_live().await);
                lines
            }
            "weights" => self.cmd_weights().await,
            "drained" => self.cmd_drained().await,
            "bans" => self.cmd_bans().await,
            "drain" => self.cmd_set_drained(&tokens, true).await,
            "undrain" => self.cmd_set_drained(&tokens, false).await,
            "setweight" => self.cmd_setweight(&tokens).await,
            "remove" => self.cmd_remove(&tokens).await,
            "ban" => self.cmd_ban(&tokens, true).await,
            "unban" => self.cmd_ban(&tokens, false).await,
            "set" => self.cmd_set(&tokens).await,
            "mode" => self.cmd_mode(&tokens).await,
            "clear" => {
                self.registry.clear_history().await;
                vec!["OK".to_string()]
            }
            other => vec![LbError::Protocol(format!("Unknown command: {other}")).to_string()],
        }
    }

    async fn cmd_servers(&self) -> Vec<String> {
        let snapshot = self.registry.snapshot().await;
        snapshot
            .servers
            .iter()
            .map(|s| {
                let rtt = s
                    .rtt_ms
                    .map(|ms| ms.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!(
                    "{} rtt={} weight={} live={} requests={} health={}% drained={}",
                    s.endpoint,
                    rtt,
                    s.weight,
                    s.live_clients.len(),
                    s.request_count,
                    s.health_score,
                    s.drained,
                )
            })
            .collect()
    }

    async fn cmd_live(&self) -> Vec<String> {
        let snapshot = self.registry.snapshot().await;
        snapshot
            .servers
            .iter()
            .map(|s| {
                if s.live_clients.is_empty() {
                    format!("{}: (none)", s.endpoint)
                } else {
                    let joined = s
                        .live_clients
                        .iter()
                        .map(|c| format!("{}@{}", c.name, c.ip))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("{}: {}", s.endpoint, joined)
                }
            })
            .collect()
    }

    async fn cmd_weights(&self) -> Vec<String> {
        let snapshot = self.registry.snapshot().await;
        snapshot
            .servers
            .iter()
            .filter(|s| s.weight != 1)
            .map(|s| format!("{} weight={}", s.endpoint, s.weight))
            .collect()
    }

    async fn cmd_drained(&self) -> Vec<String> {
        let snapshot = self.registry.snapshot().await;
        snapshot
            .servers
            .iter()
            .filter(|s| s.drained)
            .map(|s| s.endpoint.to_string())
            .collect()
    }

    async fn cmd_bans(&self) -> Vec<String> {
        let cfg = self.config.load();
        let mut ips: Vec<String> = cfg.banned_ips.iter().map(|ip| ip.to_string()).collect();
        ips.sort();
        let mut names: Vec<String> = cfg.banned_names.iter().cloned().collect();
        names.sort();
        vec![
            format!("ips: {}", if ips.is_empty() { "none".to_string() } else { ips.join(", ") }),
            format!("names: {}", if names.is_empty() { "none".to_string() } else { names.join(", ") }),
        ]
    }

    async fn cmd_set_drained(&self, tokens: &[&str], drained: bool) -> Vec<String> {
        let Some(target) = tokens.get(1) else {
            return config_err("missing target");
        };
        if target.eq_ignore_ascii_case("all") {
            self.registry.set_drained(None, drained).await;
            return vec!["OK".to_string()];
        }
        let Some(endpoint) = parse_endpoint(target) else {
            return config_err(format!("invalid endpoint {target}"));
        };
        if self.registry.set_drained(Some(&endpoint), drained).await {
            info!(%endpoint, drained, "admin toggled drain");
            vec!["OK".to_string()]
        } else {
            config_err(format!("unknown endpoint {target}"))
        }
    }

    async fn cmd_setweight(&self, tokens: &[&str]) -> Vec<String> {
        let (Some(target), Some(weight_token)) = (tokens.get(1), tokens.get(2)) else {
            return config_err("usage: setweight <host:port> <N>");
        };
        let Some(endpoint) = parse_endpoint(target) else {
            return config_err(format!("invalid endpoint {target}"));
        };
        let Ok(requested) = weight_token.parse::<i64>() else {
            return config_err(format!("invalid weight {weight_token}"));
        };
        if self.registry.set_weight(&endpoint, clamp_weight(requested)).await {
            vec!["OK".to_string()]
        } else {
            config_err(format!("unknown endpoint {target}"))
        }
    }

    async fn cmd_remove(&self, tokens: &[&str]) -> Vec<String> {
        let Some(target) = tokens.get(1) else {
            return config_err("usage: remove <host:port>");
        };
        let Some(endpoint) = parse_endpoint(target) else {
            return config_err(format!("invalid endpoint {target}"));
        };
        self.registry.remove(&endpoint).await;
        vec!["OK".to_string()]
    }

    async fn cmd_ban(&self, tokens: &[&str], ban: bool) -> Vec<String> {
        let (Some(kind), Some(value)) = (tokens.get(1), tokens.get(2)) else {
            return config_err("usage: ban|unban <ip|name> <value>");
        };
        match kind.to_ascii_lowercase().as_str() {
            "ip" => {
                let Ok(addr) = value.parse::<IpAddr>() else {
                    return config_err(format!("invalid ip {value}"));
                };
                self.config.rcu(move |c| {
                    let mut next = c.clone();
                    if ban {
                        next.banned_ips.insert(addr);
                    } else {
                        next.banned_ips.remove(&addr);
                    }
                    next
                });
                vec!["OK".to_string()]
            }
            "name" => {
                let value = value.to_string();
                self.config.rcu(move |c| {
                    let mut next = c.clone();
                    if ban {
                        next.banned_names.insert(value.clone());
                    } else {
                        next.banned_names.remove(&value);
                    }
                    next
                });
                vec!["OK".to_string()]
            }
            other => config_err(format!("unknown ban kind {other}")),
        }
    }

    async fn cmd_set(&self, tokens: &[&str]) -> Vec<String> {
        let (Some(key), Some(value)) = (tokens.get(1), tokens.get(2)) else {
            return config_err("usage: set <ping|maxconn|evict> <value>");
        };
        match key.to_ascii_lowercase().as_str() {
            "ping" => {
                let Ok(ms) = value.parse::<u64>() else {
                    return config_err(format!("invalid value {value}"));
                };
                let clamped = clamp_ping_interval(ms);
                self.config.rcu(move |c| {
                    let mut next = c.clone();
                    next.ping_interval_ms = clamped;
                    next
                });
                vec!["OK".to_string()]
            }
            "maxconn" => {
                let Ok(n) = value.parse::<u32>() else {
                    return config_err(format!("invalid value {value}"));
                };
                self.config.rcu(move |c| {
                    let mut next = c.clone();
                    next.max_per_server = Some(n);
                    next
                });
                vec!["OK".to_string()]
            }
            "evict" => {
                let Ok(ms) = value.parse::<u64>() else {
                    return config_err(format!("invalid value {value}"));
                };
                self.config.rcu(move |c| {
                    let mut next = c.clone();
                    next.eviction_timeout_ms = ms;
                    next
                });
                vec!["OK".to_string()]
            }
            other => config_err(format!("unknown set target {other}")),
        }
    }

    async fn cmd_mode(&self, tokens: &[&str]) -> Vec<String> {
        let (Some(scope), Some(value)) = (tokens.get(1), tokens.get(2)) else {
            return config_err("usage: mode default <static|dynamic>");
        };
        if !scope.eq_ignore_ascii_case("default") {
            return config_err(format!("unknown mode scope {scope}"));
        }
        let mode = match value.to_ascii_lowercase().as_str() {
            "static" => Mode::Static,
            "dynamic" => Mode::Dynamic,
            "sticky" => return config_err("sticky is not a valid default mode"),
            other => return config_err(format!("unknown mode {other}")),
        };
        self.config.rcu(move |c| {
            let mut next = c.clone();
            next.default_mode = mode;
            next
        });
        vec!["OK".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use std::net::Ipv4Addr;

    fn interpreter() -> AdminInterpreter {
        AdminInterpreter::new(
            Arc::new(ServerRegistry::new()),
            SharedConfig::new(GlobalConfig::default()),
        )
    }

    #[test]
    fn parses_host_port_using_last_colon() {
        let ep = parse_endpoint("10.0.0.1:9001").unwrap();
        assert_eq!(ep.addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(ep.port, 9001);
    }

    #[tokio::test]
    async fn unknown_verb_yields_unknown_line() {
        let interp = interpreter();
        let lines = interp.execute("frobnicate").await;
        assert_eq!(lines, vec!["Unknown command: frobnicate".to_string()]);
    }

    #[tokio::test]
    async fn setweight_on_unknown_endpoint_reports_error_without_mutating() {
        let interp = interpreter();
        let lines = interp.execute("setweight 10.0.0.9:9999 5").await;
        assert_eq!(lines, vec!["ERROR: unknown endpoint 10.0.0.9:9999".to_string()]);
    }

    #[tokio::test]
    async fn setweight_clamps_negative_values_to_one() {
        let registry = Arc::new(ServerRegistry::new());
        let endpoint = crate::model::ServerEndpoint::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            9001,
        );
        registry.register(endpoint).await;
        let interp = AdminInterpreter::new(registry.clone(), SharedConfig::new(GlobalConfig::default()));
        interp.execute("setweight 10.0.0.1:9001 -5").await;
        assert_eq!(registry.weighted_ring().len(), 1);
    }

    #[tokio::test]
    async fn mode_default_rejects_sticky() {
        let interp = interpreter();
        let lines = interp.execute("mode default sticky").await;
        assert_eq!(lines, vec!["ERROR: sticky is not a valid default mode".to_string()]);
    }

    #[tokio::test]
    async fn set_ping_below_floor_is_clamped() {
        let interp = interpreter();
        interp.execute("set ping 10").await;
        assert_eq!(interp.config.load().ping_interval_ms, 200);
    }

    #[tokio::test]
    async fn ban_then_unban_name_round_trips() {
        let interp = interpreter();
        interp.execute("ban name mallory").await;
        assert!(interp.config.load().banned_names.contains("mallory"));
        interp.execute("unban name mallory").await;
        assert!(!interp.config.load().banned_names.contains("mallory"));
    }
}
