//! Meshwork command line client.
//!
//! Joins the mesh configured through `MESHWORK__*` variables as a client-only
//! node, runs one command and leaves.

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use meshwork::infrastructure::config::Settings;
use meshwork::infrastructure::telemetry::TelemetryBuilder;
use meshwork::store::EtcdStore;
use meshwork::{MeshClient, MeshNode, NodeOptions};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "meshwork")]
#[command(about = "Call and inspect a meshwork service mesh")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call an entry and print its result; stream results print one per line
    Call {
        /// Entry path, e.g. `billing/invoice/create`
        entry: String,
        /// Positional arguments as JSON values
        args: Vec<String>,
        /// Attempts for a unary call
        #[arg(long, default_value_t = 1)]
        retry: u32,
    },
    /// List announced entries under a prefix
    Dir {
        /// Entry prefix; the root when omitted
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Print every schema served by one node, without the coordination store
    Describe {
        /// `host:port` of the node
        host: String,
    },
}

/// Reads each argument as JSON, falling back to a plain string.
fn parse_args(raw: &[String]) -> Vec<Value> {
    raw.iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new().context("Failed to load configuration")?;

    TelemetryBuilder::from_settings(&settings.telemetry, env!("CARGO_PKG_VERSION"))
        .with_instance(settings.node.name.as_deref())
        .with_plain_logs()
        .init()?;

    let options = NodeOptions::from_settings(&settings)?;
    if let Commands::Describe { host } = &cli.command {
        let client = MeshClient::new(host.clone(), options.security.clone());
        for (entry, schema) in client.schemas().await? {
            println!("{entry} ({}) {}", schema.kind(), schema.to_json()?);
        }
        return Ok(());
    }

    let store = EtcdStore::connect(&settings.store).await?;
    let grace = options.drain_grace;
    let node = MeshNode::new(options, Arc::new(store));
    info!(node = %node.name(), "Joined mesh as client");

    let result = run(&node, cli.command).await;
    node.destroy(grace).await;
    result
}

async fn run(node: &MeshNode, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Call { entry, args, retry } => {
            let mut results = node.query().path(&entry).call(parse_args(&args)).retry(retry);
            while let Some(item) = results.next().await {
                println!("{}", item?);
            }
        }
        Commands::Dir { prefix } => {
            for child in node.dir(&prefix).await? {
                println!("{child}");
            }
        }
        Commands::Describe { .. } => {}
    }
    Ok(())
}
