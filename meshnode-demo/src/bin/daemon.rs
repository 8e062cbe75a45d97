use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use meshnode::{Node, NodeConfig};
use meshnode_demo::{Echo, EchoService};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Config file.
    #[arg(short, long, default_value = "/etc/meshnode/node.json")]
    pub config: PathBuf,

    /// Log filter, overrides `RUST_LOG`.
    #[arg(long)]
    pub log: Option<String>,

    /// Additional listen address.
    #[arg(short, long)]
    pub listen: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let filter = match &args.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = if args.config.exists() {
        match NodeConfig::load(&args.config) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("{e}");
                std::process::exit(1);
            }
        }
    } else {
        tracing::warn!("{} not found, using defaults", args.config.display());
        NodeConfig::default()
    };
    config.listeners.extend(args.listen);

    let node = match Node::builder(config)
        .api(|registry| Arc::new(Echo::default()).export(registry))
        .start()
        .await
    {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("cannot start node: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        "node {} serving {} methods on {:?}",
        node.identity(),
        node.dispatcher().descriptors().len(),
        node.listeners().list()
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = node.join() => {}
    }
    node.stop();
    node.join().await;
}
