//! Main binary for the fleet gateway daemon

use clap::Parser;
use fleet_core::Config;
use fleet_gateway::{server, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "CPU LLM serving control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path (YAML); environment variables override
    /// defaults when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind address override, e.g. 0.0.0.0:8080
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Log level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Master node to join on startup, as host:port
    #[arg(long, value_name = "ADDR")]
    join: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration file");
            Config::from_file(path)?
        }
        None => Config::from_env(),
    };

    let bind: SocketAddr = match &cli.bind {
        Some(addr) => addr.parse()?,
        None => format!("0.0.0.0:{}", config.server_port).parse()?,
    };

    let state = AppState::new(config)?;
    state.spawn_background();

    info!(
        models = state.catalog.list_active().len(),
        node = state.cluster.node_id(),
        "Fleet control plane starting"
    );

    if let Some(master) = &cli.join {
        match master.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse()?;
                if let Err(e) = state.cluster.join(host, port).await {
                    warn!(master = %master, error = %e, "Cluster join failed, continuing standalone");
                }
            }
            None => warn!(master = %master, "Invalid --join address, expected host:port"),
        }
    }

    server::serve(state, bind).await?;
    Ok(())
}
