//! One-shot label reconciliation.
//!
//! Runs a single reconciliation pass against the feed database and prints
//! the report. Useful after an outage, or to drain a backlog faster than the
//! daemon's interval would.
//!
//! # Usage
//!
//! ```bash
//! # One pass with defaults (500 items, chunks of 25)
//! skyfeed-reconcile --db ./data/skyfeed.db
//!
//! # Keep going until nothing is left to reconcile
//! skyfeed-reconcile --db ./data/skyfeed.db --until-done
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use skyfeed_ingest::upstream::DEFAULT_APPVIEW_URL;
use skyfeed_ingest::{
    AppConfig, FeedStore, Gateway, IngestSettings, ReconcileJob, SqliteStore, UpstreamClient,
    XrpcClient,
};
use tracing_subscriber::EnvFilter;

/// One-shot label reconciliation.
#[derive(Parser, Debug)]
#[command(name = "skyfeed-reconcile")]
#[command(about = "Fetch moderation labels for stored posts that have none yet")]
#[command(version)]
struct Args {
    /// SQLite database path
    #[arg(long, short, env = "SKYFEED_DB_PATH", default_value = "./data/skyfeed.db")]
    db: PathBuf,

    /// Config file for gateway and reconcile settings (defaults if omitted)
    #[arg(long, short, env = "SKYFEED_CONFIG")]
    config: Option<PathBuf>,

    /// AppView XRPC base URL
    #[arg(long, env = "SKYFEED_APPVIEW_URL", default_value = DEFAULT_APPVIEW_URL)]
    appview_url: String,

    /// Override the number of items selected per pass
    #[arg(long)]
    batch_limit: Option<usize>,

    /// Repeat passes until a pass selects nothing or resolves nothing
    #[arg(long)]
    until_done: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,skyfeed_ingest=debug")),
        )
        .init();

    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => {
            AppConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?
                .settings
        }
        None => IngestSettings::default(),
    };
    if let Some(limit) = args.batch_limit {
        settings.reconcile.batch_limit = limit.max(1);
    }

    let store: Arc<dyn FeedStore> = Arc::new(
        SqliteStore::open(&args.db)
            .with_context(|| format!("Failed to open database at {}", args.db.display()))?,
    );
    let gateway = Arc::new(Gateway::new(settings.gateway.clone()));
    let api = XrpcClient::new(args.appview_url.clone(), Duration::from_secs(30))
        .context("Failed to build AppView client")?;
    let upstream = UpstreamClient::new(Arc::new(api), Arc::clone(&gateway));

    let job = ReconcileJob::new(store, upstream, settings.reconcile);

    let mut passes = 0usize;
    let mut written = 0usize;
    let mut failed_chunks = 0usize;

    loop {
        let report = job.run_once().await.context("Reconciliation pass failed")?;
        passes += 1;
        written += report.written;
        failed_chunks += report.chunks_failed;

        println!(
            "pass {passes}: selected={} chunks={} failed_chunks={} resolved={} written={} \
             write_failures={} ({:?})",
            report.selected,
            report.chunks,
            report.chunks_failed,
            report.resolved,
            report.written,
            report.write_failures,
            report.duration
        );

        if !args.until_done || report.selected == 0 || report.resolved == 0 {
            break;
        }
    }

    println!();
    println!("═══════════════════════════════════════════════════════");
    println!("Passes:             {passes}");
    println!("Labels written:     {written}");
    println!("Failed chunks:      {failed_chunks}");
    println!("Upstream requests:  {}", gateway.stats().total_requests);

    Ok(())
}
