use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use jobfeed_sync::config;
use jobfeed_sync::db;
use jobfeed_sync::feed::{FeedClient, HttpFeedClient};
use jobfeed_sync::model::{FeedCursor, FeedMetadata};
use jobfeed_sync::sync;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Find the first feed page with listings modified on or after a date"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Target date (YYYY-MM-DD)
    #[arg(long)]
    date: NaiveDate,

    /// Give up after scanning this many pages
    #[arg(long, default_value = "10000")]
    max_pages: u64,

    /// Store the found page as the resume cursor
    #[arg(long)]
    save: bool,
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
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let target = args
        .date
        .and_hms_opt(0, 0, 0)
        .context("invalid target date")?
        .and_utc();
    let client = HttpFeedClient::from_config(&cfg)?;

    info!(target = %target, "scanning feed from the first page");
    let found = sync::find_start_page(
        &client as &dyn FeedClient,
        target,
        &cfg.fetch_settings(),
        args.max_pages,
    )
    .await?;

    let Some((page_id, page_index)) = found else {
        println!("No page with listings modified on or after {}", args.date);
        return Ok(());
    };
    println!("{}", page_id);
    info!(page = %page_id, index = page_index, "found start page");

    if args.save {
        let pool = db::init_pool(&cfg.database_url()).await?;
        db::run_migrations(&pool).await?;
        db::save_feed_state(
            &pool,
            &FeedCursor::at_page(page_id.clone(), page_index),
            &FeedMetadata::default(),
        )
        .await?;
        info!(page = %page_id, "saved as resume cursor");
    } else {
        println!("Run with --start-page-id {} to start there", page_id);
    }
    Ok(())
}
