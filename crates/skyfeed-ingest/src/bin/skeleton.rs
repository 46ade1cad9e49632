//! Feed skeleton dump.
//!
//! Prints one page of a feed as `app.bsky.feed.getFeedSkeleton` JSON, read
//! straight from the feed database.
//!
//! # Usage
//!
//! ```bash
//! skyfeed-skeleton --db ./data/skyfeed.db rust
//!
//! # Next page
//! skyfeed-skeleton --db ./data/skyfeed.db rust --limit 30 --cursor '1700000000000::3f2a…'
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use skyfeed_ingest::{SqliteStore, get_skeleton};

/// Feed skeleton dump.
#[derive(Parser, Debug)]
#[command(name = "skyfeed-skeleton")]
#[command(about = "Print one page of a feed skeleton as JSON")]
#[command(version)]
struct Args {
    /// Feed name
    feed: String,

    /// SQLite database path
    #[arg(long, short, env = "SKYFEED_DB_PATH", default_value = "./data/skyfeed.db")]
    db: PathBuf,

    /// Page size (1-100, default 50)
    #[arg(long, short)]
    limit: Option<usize>,

    /// Cursor from a previous page
    #[arg(long)]
    cursor: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let store = SqliteStore::open(&args.db)
        .with_context(|| format!("Failed to open database at {}", args.db.display()))?;

    let page = get_skeleton(&store, &args.feed, args.limit, args.cursor.as_deref())
        .await
        .with_context(|| format!("Failed to read feed '{}'", args.feed))?;

    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}
