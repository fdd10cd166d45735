use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use txroute::application::engine::RouteEngine;
use txroute::config::EngineConfig;
use txroute::domain::ports::SharedAccountStore;
use txroute::infrastructure::in_memory::InMemoryAccountStore;
use txroute::interfaces::csv::balance_writer::BalanceWriter;
use txroute::interfaces::csv::message_reader::MessageReader;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration (accounts, channels, routes) as JSON
    config: PathBuf,

    /// Input messages CSV file with `channel` and `body` columns
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// How long to wait for routed messages to finish before shutting down
    #[arg(long, default_value_t = 30_000)]
    drain_timeout_ms: u64,
}

fn open_store(db_path: Option<PathBuf>) -> Result<SharedAccountStore> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let store = txroute::infrastructure::rocksdb::RocksDbAccountStore::open(&path)
                .into_diagnostic()?;
            info!(path = %path.display(), "using RocksDB storage");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            warn!(
                "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            Ok(Arc::new(InMemoryAccountStore::new()))
        }
        None => Ok(Arc::new(InMemoryAccountStore::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_path(&cli.config).into_diagnostic()?;
    let store = open_store(cli.db_path)?;

    let engine = RouteEngine::from_config(&config, store)
        .await
        .into_diagnostic()?;
    engine.start();

    let file = File::open(&cli.input).into_diagnostic()?;
    let reader = MessageReader::new(file);
    let mut routed = 0u64;
    for submission in reader.submissions().into_diagnostic()? {
        let (channel, message) = match submission {
            Ok(submission) => submission.into_message(),
            Err(e) => {
                warn!(error = %e, "skipping unreadable row");
                continue;
            }
        };
        let is_routed = engine.is_routed(&channel);
        match engine.submit_message(&channel, message) {
            Ok(_) if is_routed => routed += 1,
            Ok(_) => warn!(channel = %channel, "no route consumes this channel"),
            Err(e) => warn!(channel = %channel, error = %e, "submission rejected"),
        }
    }

    let drain_timeout = Duration::from_millis(cli.drain_timeout_ms);
    if !engine.wait_for_idle(drain_timeout).await {
        warn!(
            submitted = routed,
            processed = engine.processed_count(),
            outstanding = engine.channels().outstanding(),
            "drain timeout elapsed before all messages were processed"
        );
    }
    engine.shutdown().await;

    for (channel, depth) in engine.channels().depths() {
        if depth > 0 {
            info!(channel = %channel, depth, "messages left on channel");
        }
    }

    let accounts = engine.ledger().accounts().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = BalanceWriter::new(stdout.lock());
    writer.write_accounts(accounts).into_diagnostic()?;

    Ok(())
}
