//! spasm-query: submit an analysis query to a running coordinator
//!
//! Run with:
//! ```bash
//! cargo run -p spasm-coordinator --bin spasm-query -- --addr 127.0.0.1:5000 'age>=50' 'sex=F'
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use spasm_coordinator::LoopbackClient;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "spasm-query")]
#[command(about = "Query the spasm coordinator through its loopback address")]
struct Args {
    /// Coordinator loopback address
    #[arg(long, default_value = "127.0.0.1:5000")]
    addr: SocketAddr,

    /// Seconds to wait for the result
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Conditions such as `age>=50`, combined with AND
    conditions: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("spasm_query=warn".parse()?))
        .init();

    let args = Args::parse();
    let mut client = LoopbackClient::connect(args.addr, Duration::from_secs(args.timeout_secs)).await?;

    let rows = client.query(&args.conditions.join("\n")).await?;
    if rows.is_empty() {
        println!("[REFUSED] Cohort too small or no matching records");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&rows)?);
    println!("[OK] {} subjects", rows.len());

    Ok(())
}
