use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use jobfeed_sync::config;
use jobfeed_sync::db;
use jobfeed_sync::feed::{FeedClient, HttpFeedClient, PageRequest};
use jobfeed_sync::sync;

#[derive(Parser, Debug)]
#[command(about = "Print the stored resume state and a summary of one feed page")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Inspect the first page instead of the last one
    #[arg(long)]
    first: bool,

    /// Inspect this page id instead of the first or last page
    #[arg(long)]
    page_id: Option<String>,

    /// Only print the stored state, do not call the feed
    #[arg(long)]
    offline: bool,
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match db::load_feed_state(&pool).await? {
        Some(state) => {
            println!("Stored cursor:");
            println!("  page id:     {}", state.cursor.page_id.as_deref().unwrap_or("-"));
            println!("  page index:  {}", state.cursor.page_index);
            println!("  item offset: {}", state.cursor.item_offset);
            if let Some(at) = state.metadata.last_fetched_at {
                println!("  fetched at:  {}", at.to_rfc3339());
            }
        }
        None => println!("No stored cursor"),
    }
    let last_sync = db::get_system_parameter(&pool, db::LAST_SYNC_PARAM).await?;
    println!("Last sync:     {}", last_sync.as_deref().unwrap_or("never"));
    println!("Stored jobs:   {}", db::count_jobs(&pool).await?);

    if args.offline {
        return Ok(());
    }

    let client = HttpFeedClient::from_config(&cfg)?;
    let request = match (args.page_id, args.first) {
        (Some(id), _) => PageRequest::Id(id),
        (None, true) => PageRequest::First,
        (None, false) => PageRequest::Last,
    };
    let page = sync::fetch_page(&client as &dyn FeedClient, &request, &cfg.fetch_settings()).await?;

    println!();
    println!("Page {} ({}):", page.id, request);
    println!("  items:     {}", page.items.len());
    println!("  next page: {}", page.next_id.as_deref().unwrap_or("-"));
    let dates: Vec<_> = page.items.iter().filter_map(|i| i.date_modified).collect();
    if let (Some(oldest), Some(newest)) = (dates.iter().min(), dates.iter().max()) {
        println!("  modified:  {} .. {}", oldest.to_rfc3339(), newest.to_rfc3339());
    }
    for item in page.items.iter().take(5) {
        println!(
            "  - {} {} {}",
            item.id,
            item.status.as_deref().unwrap_or("?"),
            item.title.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
