//! spasm-coordinator binary
//!
//! Run with:
//! ```bash
//! cargo run -p spasm-coordinator --bin spasm-coordinator -- --config network.json --base-data base.json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use spasm_coordinator::{load_base_data, metrics, BaseData, CoordinatorService};
use spasm_core::{GroupKind, NetworkConfig, Signal, StatusLog};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "spasm-coordinator")]
#[command(about = "Run pseudonymized queries over the spasm data servers")]
struct Args {
    /// Network configuration (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Candidate pool to sample cohorts from (JSON object of id -> record)
    #[arg(long)]
    base_data: Option<PathBuf>,

    /// Override the loopback address from the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the key-exchange group (modp4096, modp2048)
    #[arg(long)]
    group: Option<GroupKind>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("spasm_coordinator=info".parse()?)
                .add_directive("spasm=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = NetworkConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config = config.with_loopback_address(listen);
    }
    if let Some(group) = args.group {
        config = config.with_group(group);
    }

    if let Some(addr) = args.metrics_addr {
        metrics::init_prometheus_recorder(addr)?;
        tracing::info!("Metrics on http://{}/metrics", addr);
    }

    let base_data = match &args.base_data {
        Some(path) => load_base_data(path)?,
        None => BaseData::new(),
    };
    tracing::info!(candidates = base_data.len(), "Loaded base data");

    let signal = Signal::new();
    let service = CoordinatorService::builder(config.clone())
        .base_data(base_data)
        .status(StatusLog::new("coordinator"))
        .signal(&signal)
        .build()?;

    let stop = signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            stop.trigger();
        }
    });

    tracing::info!("Coordinator accepting queries on {}", config.loopback_address);
    service.run().await?;

    Ok(())
}
