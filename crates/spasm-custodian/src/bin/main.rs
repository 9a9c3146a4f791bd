//! spasm-custodian binary
//!
//! Run with:
//! ```bash
//! cargo run -p spasm-custodian -- --config network.json --id ds-1 --data ds-1.json
//! ```

use std::path::PathBuf;

use clap::Parser;
use spasm_core::{GroupKind, NetworkConfig, Signal, StatusLog};
use spasm_custodian::{CustodianBuilder, MemoryStore, RecordStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "spasm-custodian")]
#[command(about = "Serve a partition of records to the spasm coordinator")]
struct Args {
    /// Network configuration (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Id of this data server in the configuration
    #[arg(long)]
    id: String,

    /// Records of this data server (JSON object of id -> record)
    #[arg(long)]
    data: Option<PathBuf>,

    /// Override the key-exchange group (modp4096, modp2048)
    #[arg(long)]
    group: Option<GroupKind>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("spasm_custodian=info".parse()?)
                .add_directive("spasm=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = NetworkConfig::load(&args.config)?;
    if let Some(group) = args.group {
        config = config.with_group(group);
    }

    let store = match &args.data {
        Some(path) => MemoryStore::load(path)?,
        None => MemoryStore::new(),
    };
    tracing::info!(id = %args.id, records = store.len(), "Loaded records");

    let signal = Signal::new();
    let custodian = CustodianBuilder::new(config, args.id.clone())
        .status(StatusLog::new(format!("custodian {}", args.id)))
        .signal(&signal)
        .build(store)?;

    let stop = signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            stop.trigger();
        }
    });

    tracing::info!("Data server {} listening on {}", args.id, custodian.address());
    custodian.run().await?;

    Ok(())
}
