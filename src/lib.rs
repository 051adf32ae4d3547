pub mod admin;
pub mod config;
pub mod error;
pub mod evictor;
pub mod listeners;
pub mod model;
pub mod prober;
pub mod registry;
pub mod selector;
pub mod shutdown;

use chrono::Utc;
use config::{GlobalConfig, SharedConfig};
use error::{LbError, Result};
use evictor::Evictor;
use listeners::admin::AdminListener;
use listeners::client::ClientHandshakeListener;
use listeners::server_channel::ServerChannelListener;
use listeners::status::StatusEndpoint;
use prober::RttProber;
use registry::ServerRegistry;
use selector::Selector;
use shutdown::Shutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// The four independently-configurable listening ports (§6), matching the
/// reference defaults.
#[derive(Debug, Clone, Copy)]
pub struct Ports {
    pub client: u16,
    pub registration: u16,
    pub status: u16,
    pub admin: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            client: 11114,
            registration: 11115,
            status: 11116,
            admin: 11117,
        }
    }
}

/// Owns every shared piece of state and wires the four listeners plus the
/// prober and evictor background tasks together. This is the process's one
/// long-lived object; `main` builds one, starts it, and waits for shutdown.
pub struct Cluster {
    pub registry: Arc<ServerRegistry>,
    pub config: SharedConfig,
    pub selector: Arc<Selector>,
    pub shutdown: Shutdown,
    up_since_ms: i64,
}

impl Cluster {
    pub fn new(initial_config: GlobalConfig) -> Self {
        let registry = Arc::new(ServerRegistry::new());
        let config = SharedConfig::new(initial_config);
        let selector = Arc::new(Selector::new(registry.clone(), config.clone()));
        Self {
            registry,
            config,
            selector,
            shutdown: Shutdown::new(),
            up_since_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Binds all four listeners, returning `LbError::Bind` on the first
    /// failure (§7 Fatal), then spawns every accept loop and background task
    /// and returns immediately. Callers await `shutdown.wait()` or their own
    /// termination signal.
    pub async fn start(&self, ports: Ports) -> Result<()> {
        let client_listener = bind(ports.client).await?;
        let reg_listener = bind(ports.registration).await?;
        let status_listener = bind(ports.status).await?;
        let admin_listener = bind(ports.admin).await?;

        info!(?ports, "all listeners bound");

        let client = ClientHandshakeListener::new(self.selector.clone(), self.config.clone());
        tokio::spawn(client.serve(client_listener, self.shutdown.clone()));

        let server_channel = ServerChannelListener::new(self.registry.clone());
        tokio::spawn(server_channel.serve(reg_listener, self.shutdown.clone()));

        let status = StatusEndpoint::new(self.registry.clone(), self.config.clone(), self.up_since_ms);
        tokio::spawn(status.serve(status_listener, self.shutdown.clone()));

        let interpreter = Arc::new(admin::AdminInterpreter::new(
            self.registry.clone(),
            self.config.clone(),
        ));
        let admin_front = AdminListener::new(interpreter);
        tokio::spawn(admin_front.serve(admin_listener, self.shutdown.clone()));

        let prober = RttProber::new(self.registry.clone(), self.config.clone(), self.shutdown.clone());
        tokio::spawn(async move { prober.run().await });

        let evictor = Evictor::new(self.registry.clone(), self.config.clone(), self.shutdown.clone());
        tokio::spawn(async move { evictor.run().await });

        Ok(())
    }

    pub fn admin_interpreter(&self) -> admin::AdminInterpreter {
        admin::AdminInterpreter::new(self.registry.clone(), self.config.clone())
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }
}

async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).await.map_err(|source| {
        error!(%addr, error = %source, "failed to bind listener");
        LbError::Bind { addr, source }
    })
}
