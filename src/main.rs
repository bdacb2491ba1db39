use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use jobfeed_sync::config;
use jobfeed_sync::db::{self, SqliteStore};
use jobfeed_sync::feed::HttpFeedClient;
use jobfeed_sync::model::{RunConfig, SyncOutcome};
use jobfeed_sync::sync::SyncDriver;

#[derive(Debug, Parser)]
#[command(author, version, about = "Synchronize the job listing feed into the local store")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Stop after this many listings have been written
    #[arg(long)]
    limit: Option<usize>,

    /// Discard the stored cursor before starting
    #[arg(long)]
    reset: bool,

    /// With --reset, start at the oldest page instead of the newest
    #[arg(long, requires = "reset")]
    start_from_beginning: bool,

    /// Skip listings last modified before this date (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Start at this feed page id
    #[arg(long)]
    start_page_id: Option<String>,

    /// Override sync.workers from the config file
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(Some(&args.config))?;
    if let Some(workers) = args.workers.filter(|w| *w > 0) {
        cfg.sync.workers = workers;
    }
    cfg.ensure_dirs()?;

    let run = RunConfig::new(
        args.limit,
        args.reset,
        args.start_from_beginning,
        args.start_date,
        args.start_page_id,
    )?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool);

    let client = HttpFeedClient::from_config(&cfg).context("building feed client")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current batch");
            signal_token.cancel();
        }
    });

    info!(workers = cfg.sync.workers, "starting jobfeed-sync");
    let driver = SyncDriver::new(Arc::new(client), &store, &store, cfg.fetch_settings());
    let report = driver.run(&run, &shutdown).await;

    if report.outcome == SyncOutcome::Failed {
        let reason = report
            .failure
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".into());
        anyhow::bail!("feed sync failed: {}", reason);
    }
    Ok(())
}
