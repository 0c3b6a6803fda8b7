//! Demo entry point: stream logical replication changes to stdout.
//!
//! Loads the YAML configuration, wires a [`StdoutSink`], and runs the
//! producer until SIGINT. Real deployments are expected to provide their
//! own binary with a custom sink; this one exists so the pipeline can be
//! exercised end to end against a database.

use anyhow::Result;
use clap::Parser;
use pg_streamline::{Config, Producer, StdoutSink};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "pg-streamline",
    about = "Stream PostgreSQL logical replication changes to stdout",
    version
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "pg-streamline-config.yaml")]
    config: String,

    /// Publication to subscribe to (repeatable; pgoutput only)
    #[arg(short, long = "publication")]
    publications: Vec<String>,

    /// pgoutput protocol version
    #[arg(long, default_value_t = 1)]
    proto_version: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = Config::from_yaml_file(&args.config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    let producer = Producer::new(config, Arc::new(StdoutSink::new()), shutdown)?;

    match producer
        .start_replication(&args.publications, args.proto_version)
        .await
    {
        Ok(()) => {
            info!("replication completed");
            Ok(())
        }
        Err(e) => {
            error!("replication failed: {e}");
            Err(e.into())
        }
    }
}
