use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use meshseek::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "meshseek")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the RPC server binds.
    #[arg(short, long, default_value = "0.0.0.0:7000")]
    listen: String,

    /// Address peers use to reach this node. Defaults to the bound address;
    /// required when listening on a wildcard address.
    #[arg(short, long)]
    advertise: Option<String>,

    #[arg(short, long, default_value = "meshseek-data")]
    data_dir: PathBuf,

    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<String>,

    /// Number of RPC worker tasks.
    #[arg(short, long, default_value = "1")]
    workers: usize,

    /// Seconds between sync cycles once caught up.
    #[arg(long, default_value = "60")]
    sync_interval: u64,

    /// Seconds between status log lines.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig {
        listen_addr: args.listen,
        advertise_addr: args.advertise,
        data_dir: args.data_dir,
        rpc_workers: args.workers,
        sync_interval: Duration::from_secs(args.sync_interval),
        bootstrap: args.bootstrap,
        ..NodeConfig::default()
    };
    let seeds = config.bootstrap.clone();

    let node = Node::start(config).await?;
    info!("Node identity: {}", node.identity().await?);

    for seed in &seeds {
        info!("Bootstrapping from {}", seed);
        match node.bootstrap(seed).await {
            Ok(queried) => info!(queried, "Bootstrap complete"),
            Err(e) => warn!(error = %e, "Bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let status = node.status().await;
                info!(
                    peers = node.peers().await.len(),
                    results_ts = status.results_timestamp,
                    metadata_ts = status.metadata_timestamp,
                    bootstrapping = node.is_bootstrapping().await,
                    "status snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
