//! `overlord-coordinator`: runs C4/C5/C6/C7 and the discovery broadcaster
//! half of C8.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use overlord::config::CoordinatorConfig;
use overlord::coordinator::{bridge, conn_server, Registry};
use tokio::net::TcpListener;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser, Debug)]
#[command(name = "overlord-coordinator", about = "Remote fleet control plane coordinator")]
struct Cli {
    /// Override the agent TCP listen address (host:port).
    #[arg(long)]
    agent_listen_addr: Option<String>,
    /// Override the HTTP/WebSocket browser bridge listen address.
    #[arg(long)]
    http_listen_addr: Option<String>,
    /// Broadcast address to use for LAN discovery; omit to disable.
    #[arg(long)]
    discovery_broadcast_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    overlord::logging::init("overlord-coordinator");

    let cli = Cli::parse();
    let mut config = CoordinatorConfig::load().context("loading coordinator config")?;
    if let Some(addr) = cli.agent_listen_addr {
        config.agent_listen_addr = addr;
    }
    if let Some(addr) = cli.http_listen_addr {
        config.http_listen_addr = addr;
    }
    if cli.discovery_broadcast_addr.is_some() {
        config.discovery_broadcast_addr = cli.discovery_broadcast_addr;
    }
    config.save().ok();

    {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::flag;
        flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
        flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
        flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    }

    let registry = Arc::new(Registry::new());

    if config.discovery_broadcast_addr.is_some() {
        let agent_port = parse_port(&config.agent_listen_addr).unwrap_or(overlord::constants::DEFAULT_AGENT_PORT);
        tokio::spawn(async move {
            if let Err(e) = overlord::discovery::broadcast_loop(agent_port).await {
                log::warn!("discovery broadcaster stopped: {e}");
            }
        });
    }

    let http_registry = Arc::clone(&registry);
    let http_listen_addr = config.http_listen_addr.clone();
    tokio::spawn(async move {
        let state = bridge::AppState { registry: http_registry };
        let app = bridge::router(state);
        let listener = TcpListener::bind(&http_listen_addr).await.expect("binding HTTP listener");
        log::info!("HTTP/WS browser bridge listening on {http_listen_addr}");
        axum::serve(listener, app).await.expect("HTTP server failed");
    });

    let agent_listener = TcpListener::bind(&config.agent_listen_addr)
        .await
        .with_context(|| format!("binding agent listener on {}", config.agent_listen_addr))?;
    log::info!("agent connection listener on {}", config.agent_listen_addr);

    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        tokio::select! {
            accepted = agent_listener.accept() => {
                let (stream, peer) = accepted?;
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    conn_server::run(stream, peer, registry).await;
                });
            }
            () = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
        }
    }
    log::info!("shutdown signal received, exiting");
    Ok(())
}

fn parse_port(addr: &str) -> Option<u16> {
    addr.rsplit(':').next()?.parse().ok()
}
