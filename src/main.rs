//! GraMitra sync daemon
//!
//! Runs the authority-side sync role: opens the record store, accepts
//! operations from embedded callers, and logs accepted-change traffic.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! gramitra-sync
//!
//! # Start with custom config
//! gramitra-sync --config /path/to/config.toml
//!
//! # Start with custom data directory
//! gramitra-sync --data-dir /var/lib/gramitra
//! ```

use clap::Parser;
use gramitra_sync::{AuthorityConfig, AuthorityNode, Config, RecordStore, RecordStoreConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gramitra-sync")]
#[command(about = "Offline-tolerant sync engine for the GraMitra civic-reporting app")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(long, env = "GRAMITRA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Node identity reported in logs
    #[arg(long, env = "GRAMITRA_NODE_ID")]
    node_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("gramitra_sync=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }

    info!(
        node_id = %config.node_id,
        data_dir = %config.data_dir.display(),
        "Starting gramitra-sync authority node"
    );

    let store = Arc::new(
        RecordStore::open(RecordStoreConfig {
            db_path: config.record_db_path(),
            cache_size: config.cache_size,
        })
        .await?,
    );

    let node = Arc::new(AuthorityNode::new(
        store,
        AuthorityConfig {
            broadcast_capacity: config.broadcast_capacity,
            pull_batch: config.pull_batch,
        },
    ));

    info!(
        entities = node.list_entities()?.len(),
        accepted = node.accepted_count(),
        "Record store ready"
    );

    // Log accepted-change traffic for operators
    let mut changes = node.subscribe();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            info!(
                seq = change.seq,
                entity_id = %change.entity.entity_id,
                kind = change.operation.entity_kind().as_str(),
                version = change.new_version,
                "Change accepted"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
