//! # gardend: Garden API server
//!
//! Restores persisted containers, serves the HTTP API, and destroys idle
//! containers once their grace time runs out.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use garden_common::config::GardenConfig;
use garden_common::constants;
use garden_runtime::engine::Garden;
use ipnet::Ipv4Net;

/// Garden container manager server.
#[derive(Parser, Debug)]
#[command(name = constants::SERVER_BIN_NAME, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags override its values.
    #[arg(long, env = "GARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, env = "GARDEN_LISTEN")]
    listen: Option<SocketAddr>,

    /// Directory holding container state.
    #[arg(long, env = "GARDEN_DEPOT")]
    depot: Option<PathBuf>,

    /// Rootfs used when a container does not name one.
    #[arg(long, env = "GARDEN_DEFAULT_ROOTFS")]
    default_rootfs: Option<PathBuf>,

    /// Pool for dynamically allocated container subnets.
    #[arg(long, env = "GARDEN_NETWORK_POOL")]
    network_pool: Option<Ipv4Net>,

    /// First port handed out for `NetIn` mappings.
    #[arg(long, env = "GARDEN_PORT_POOL_START")]
    port_pool_start: Option<u16>,

    /// Number of ports handed out for `NetIn` mappings.
    #[arg(long, env = "GARDEN_PORT_POOL_SIZE")]
    port_pool_size: Option<u16>,

    /// Address reported as each container's external IP.
    #[arg(long, env = "GARDEN_EXTERNAL_IP")]
    external_ip: Option<Ipv4Addr>,

    /// Grace time in seconds for containers that do not request one.
    #[arg(long, env = "GARDEN_DEFAULT_GRACE_TIME")]
    default_grace_time: Option<u64>,

    /// Maximum number of containers.
    #[arg(long, env = "GARDEN_MAX_CONTAINERS")]
    max_containers: Option<u64>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "GARDEN_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<GardenConfig> {
        let mut config = match &self.config {
            Some(path) => GardenConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => GardenConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(depot) = self.depot {
            config.depot_dir = depot;
        }
        if self.default_rootfs.is_some() {
            config.default_rootfs = self.default_rootfs;
        }
        if let Some(pool) = self.network_pool {
            config.network_pool = pool;
        }
        if let Some(start) = self.port_pool_start {
            config.port_pool_start = start;
        }
        if let Some(size) = self.port_pool_size {
            config.port_pool_size = size;
        }
        if let Some(ip) = self.external_ip {
            config.external_ip = ip;
        }
        if self.default_grace_time.is_some() {
            config.default_grace_time_secs = self.default_grace_time;
        }
        if let Some(max) = self.max_containers {
            config.max_containers = max;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    let config = args.into_config()?;
    let listen_addr = config.listen_addr;

    let garden = Arc::new(Garden::new(config).context("starting engine")?);
    let _ = garden.restore().await.context("restoring containers")?;

    let reaper = garden_server::spawn_reaper(
        Arc::clone(&garden),
        Duration::from_secs(constants::REAPER_INTERVAL_SECS),
    );

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    garden_server::serve(listener, Arc::clone(&garden), shutdown_signal()).await?;

    reaper.abort();
    garden.shutdown().await;
    Ok(())
}
