#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use waypoint_gateway::config::GatewayConfig;
use waypoint_gateway::server::bootstrap;

#[derive(Parser)]
#[command(name = "waypoint-gateway", about = "Edge API gateway for a microservice backend")]
struct Cli {
    /// Path to gateway config file (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address, overrides `server.listen`
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (health, routes, metrics, reload)
    #[arg(long)]
    admin_listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    bootstrap::init_tracing();

    let config = GatewayConfig::load(&cli.config)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(n) = config.server.worker_threads {
        builder.worker_threads(n.max(1));
    }
    let rt = builder.enable_all().build()?;

    rt.block_on(bootstrap::run(bootstrap::BootstrapArgs {
        config,
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
