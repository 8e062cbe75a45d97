use std::path::PathBuf;

use clap::Parser;
use meshnode::ControlClient;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Control socket of the local node.
    #[arg(short, long, default_value = "/run/meshnode/node.sock")]
    pub socket: PathBuf,

    /// Uuid of the node that should answer. Defaults to the local node.
    #[arg(short, long)]
    pub target: Option<String>,

    /// `namespace.method`, e.g. `node.getConnections`.
    #[arg(default_value = "node.getAvailableMethods")]
    pub method: String,

    /// Positional parameters. Valid JSON is passed as is, anything else as
    /// a string.
    pub params: Vec<String>,
}

fn parse_param(param: &str) -> Value {
    serde_json::from_str(param).unwrap_or_else(|_| Value::String(param.to_string()))
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut client = match ControlClient::connect(&args.socket).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    client.set_target(args.target.clone());

    let params: Vec<Value> = args.params.iter().map(|p| parse_param(p)).collect();
    match client.request(&args.method, params).await {
        Ok(result) => {
            let output =
                serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
            println!("{output}");
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    client.close();
}
