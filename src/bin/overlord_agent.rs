//! `overlord-agent`: runs C3 end to end (connect loop, registration,
//! secondary session handlers, LAN discovery listener, local IPC server).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use overlord::config::AgentConfig;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser, Debug)]
#[command(name = "overlord-agent", about = "Remote fleet control plane agent")]
struct Cli {
    /// Explicit coordinator address (host:port); tried before discovery.
    #[arg(long)]
    coordinator_addr: Option<String>,
    /// Disable the LAN discovery listener.
    #[arg(long)]
    no_discovery: bool,
    /// Path to the free-form JSON properties file sent at registration.
    #[arg(long)]
    properties_path: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    overlord::logging::init("overlord-agent");

    let cli = Cli::parse();
    let mut config = AgentConfig::load().context("loading agent config")?;
    if let Some(addr) = cli.coordinator_addr {
        config.coordinator_addr = Some(addr);
    }
    if cli.no_discovery {
        config.discovery_enabled = false;
    }
    if let Some(path) = cli.properties_path {
        config.properties_path = Some(path);
    }
    config.save().ok();

    {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::flag;
        flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
        flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
        flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    }
    tokio::spawn(async {
        loop {
            if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
                log::info!("shutdown signal received, exiting");
                std::process::exit(0);
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    });

    overlord::agent::run(config).await
}
