use clap::Parser;
use lb::admin::AdminInterpreter;
use lb::config::{clamp_ping_interval, GlobalConfig};
use lb::error::LbError;
use lb::model::Mode;
use lb::shutdown::Shutdown;
use lb::{Cluster, Ports};
use std::io::{self, BufRead, Write};
use tracing::{error, info};

/// CLI flags supply the initial `GlobalConfig` and port layout; every field
/// here stays admin-mutable afterwards via `set`/`mode`.
#[derive(Parser)]
#[command(name = "lb", version, about = "Load balancer for a dynamic server pool")]
struct Args {
    /// Client handshake port.
    #[arg(long, default_value_t = 11114)]
    client_port: u16,

    /// Server registration/report port.
    #[arg(long, default_value_t = 11115)]
    reg_port: u16,

    /// Status JSON feed port.
    #[arg(long, default_value_t = 11116)]
    status_port: u16,

    /// Admin command port.
    #[arg(long, default_value_t = 11117)]
    admin_port: u16,

    /// Selection mode assumed for clients that omit one: static or dynamic.
    #[arg(long, default_value = "static")]
    default_mode: String,

    /// Initial RTT probe period; floored at 200ms.
    #[arg(long, default_value_t = 2000)]
    ping_interval_ms: u64,

    /// Initial server liveness timeout before eviction.
    #[arg(long, default_value_t = 15_000)]
    eviction_timeout_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lb=info")),
        )
        .init();

    let args = Args::parse();

    let default_mode = match Mode::parse(&args.default_mode) {
        Some(Mode::Static) => Mode::Static,
        Some(Mode::Dynamic) => Mode::Dynamic,
        _ => {
            let err = LbError::Config(format!(
                "--default-mode must be 'static' or 'dynamic', got {:?}",
                args.default_mode
            ));
            error!(error = %err, "invalid startup configuration");
            std::process::exit(2);
        }
    };

    let config = GlobalConfig {
        default_mode,
        ping_interval_ms: clamp_ping_interval(args.ping_interval_ms),
        eviction_timeout_ms: args.eviction_timeout_ms,
        ..GlobalConfig::default()
    };

    let ports = Ports {
        client: args.client_port,
        registration: args.reg_port,
        status: args.status_port,
        admin: args.admin_port,
    };

    info!("════════════════════════════════════════════════════════════");
    info!("  lb starting");
    info!("════════════════════════════════════════════════════════════");

    let cluster = Cluster::new(config);
    if let Err(e) = cluster.start(ports).await {
        error!(error = %e, "startup aborted");
        std::process::exit(1);
    }
    info!(?ports, "load balancer running, admin console on stdin");

    let interpreter = cluster.admin_interpreter();
    let console_shutdown = cluster.shutdown.clone();
    tokio::task::spawn_blocking(move || run_console(interpreter, console_shutdown));

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested");
    cluster.shutdown();
}

/// Reads one admin command per line from stdin, sharing the same grammar as
/// ADMIN_PORT. Runs on a blocking thread since stdin has no async API.
fn run_console(interpreter: AdminInterpreter, shutdown: Shutdown) {
    let rt = tokio::runtime::Handle::current();
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        if shutdown.is_triggered() {
            return;
        }
        let Ok(line) = line else { return };
        if line.trim().is_empty() {
            continue;
        }

        let responses = rt.block_on(interpreter.execute(&line));
        for response in responses {
            let _ = writeln!(stdout, "{response}");
        }
        let _ = writeln!(stdout, "END");
        let _ = stdout.flush();
    }
}
