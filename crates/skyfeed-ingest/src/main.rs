//! Skyfeed ingestion daemon.
//!
//! Connects to the Bluesky Jetstream, classifies every new post against the
//! configured feeds, stores accepted posts, and periodically reconciles
//! moderation labels.
//!
//! # Usage
//!
//! ```bash
//! # Run with feeds from ./feeds.toml and the database in ./data
//! skyfeed-ingest
//!
//! # Custom paths
//! skyfeed-ingest --config /etc/skyfeed/feeds.toml --db-path /var/lib/skyfeed/feeds.db
//!
//! # Every flag can also come from the environment (or a .env file)
//! SKYFEED_METRICS_PORT=0 skyfeed-ingest
//! ```
//!
//! # Graceful Shutdown
//!
//! On Ctrl+C the daemon:
//! 1. Closes the Jetstream connection
//! 2. Waits for in-flight event handlers to finish
//! 3. Stops classifier maintenance, reconciliation and the health monitor
//! 4. Exits cleanly

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use skyfeed_core::metrics::{init_metrics, start_metrics_server};
use skyfeed_ingest::source::DEFAULT_JETSTREAM_URL;
use skyfeed_ingest::upstream::DEFAULT_APPVIEW_URL;
use skyfeed_ingest::{
    AppConfig, ClassifierRuntime, FeedClassifier, FeedStore, Gateway, HealthTracker,
    IngestCoordinator, JetstreamConfig, JetstreamSource, ReconcileJob, SqliteStore, StreamSource,
    UpstreamClient, XrpcClient, health,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Skyfeed ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "skyfeed-ingest")]
#[command(about = "Jetstream ingestion and per-feed classification daemon")]
#[command(version)]
struct Args {
    /// Feed definitions and tuning (TOML)
    #[arg(long, short, env = "SKYFEED_CONFIG", default_value = "./feeds.toml")]
    config: PathBuf,

    /// SQLite database path
    #[arg(long, env = "SKYFEED_DB_PATH", default_value = "./data/skyfeed.db")]
    db_path: PathBuf,

    /// Jetstream subscribe endpoint
    #[arg(long, env = "SKYFEED_JETSTREAM_URL", default_value = DEFAULT_JETSTREAM_URL)]
    jetstream_url: String,

    /// Start from this Jetstream cursor (unix microseconds) instead of live
    #[arg(long, env = "SKYFEED_START_CURSOR")]
    start_cursor: Option<i64>,

    /// AppView XRPC base URL
    #[arg(long, env = "SKYFEED_APPVIEW_URL", default_value = DEFAULT_APPVIEW_URL)]
    appview_url: String,

    /// Per-request HTTP timeout in seconds
    #[arg(long, env = "SKYFEED_HTTP_TIMEOUT_SECS", default_value = "30")]
    http_timeout_secs: u64,

    /// Capacity of the event channel between the stream and the coordinator
    #[arg(long, env = "SKYFEED_CHANNEL_CAPACITY", default_value = "1024")]
    channel_capacity: usize,

    /// Disable periodic label reconciliation
    #[arg(long)]
    no_reconcile: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "SKYFEED_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
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

    tracing::info!("Skyfeed ingestion daemon starting...");

    let app = AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if app.feeds.is_empty() {
        bail!("No feeds defined in {}", args.config.display());
    }

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown signal received, stopping gracefully..."),
                Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
            }
            shutdown.cancel();
        });
    }

    tracing::info!("Configuration:");
    tracing::info!("  Database: {}", args.db_path.display());
    tracing::info!("  Jetstream: {}", args.jetstream_url);
    tracing::info!("  AppView: {}", args.appview_url);
    tracing::info!("  Feeds: {}", app.feeds.len());
    tracing::info!(
        "  Gateway: {} req / {:?}, {} concurrent, {} retries",
        app.settings.gateway.requests_per_window,
        app.settings.gateway.window,
        app.settings.gateway.max_concurrency,
        app.settings.gateway.max_retries
    );
    tracing::info!(
        "  Reconcile: {}",
        if args.no_reconcile { "disabled" } else { "enabled" }
    );

    // Shared components
    let store: Arc<dyn FeedStore> = Arc::new(
        SqliteStore::open(&args.db_path)
            .with_context(|| format!("Failed to open database at {}", args.db_path.display()))?,
    );
    let gateway = Arc::new(Gateway::new(app.settings.gateway.clone()));
    let api = XrpcClient::new(
        args.appview_url.clone(),
        Duration::from_secs(args.http_timeout_secs),
    )
    .context("Failed to build AppView client")?;
    let upstream = UpstreamClient::new(Arc::new(api), Arc::clone(&gateway));

    // Classifiers; a feed that fails to start is left out rather than
    // blocking the coordinator's readiness wait.
    let mut classifiers: Vec<Arc<ClassifierRuntime>> = Vec::new();
    for feed in app.feeds {
        let name = feed.name.clone();
        let runtime = Arc::new(ClassifierRuntime::new(
            feed,
            Arc::clone(&store),
            upstream.clone(),
            &shutdown,
        ));
        match runtime.start().await {
            Ok(_) => {
                tracing::info!(feed = %name, "Classifier started");
                classifiers.push(runtime);
            }
            Err(e) => tracing::error!(feed = %name, "Classifier failed to start: {}", e),
        }
    }
    if classifiers.is_empty() {
        bail!("No classifier could be started");
    }

    // Background tickers
    let tracker = Arc::new(HealthTracker::new());
    let health_monitor = health::spawn_monitor(
        Arc::clone(&tracker),
        app.settings.health.clone(),
        &shutdown,
    );

    let reconcile_ticker = if args.no_reconcile {
        None
    } else {
        let job = Arc::new(ReconcileJob::new(
            Arc::clone(&store),
            upstream.clone(),
            app.settings.reconcile.clone(),
        ));
        Some(job.run_periodic(&shutdown))
    };

    // Stream → coordinator
    let coordinator = Arc::new(IngestCoordinator::new(
        classifiers
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn FeedClassifier>)
            .collect(),
        Arc::clone(&store),
    ));
    let (sender, receiver) = mpsc::channel(args.channel_capacity.max(1));
    let coordinator_task = tokio::spawn(Arc::clone(&coordinator).run(receiver, shutdown.clone()));

    let source = JetstreamSource::new(
        JetstreamConfig {
            url: args.jetstream_url.clone(),
            start_cursor: args.start_cursor,
            ..Default::default()
        },
        Arc::clone(&tracker),
    );

    tracing::info!("Starting live ingestion...");
    if let Err(e) = source.run(sender, shutdown.clone()).await {
        tracing::error!("Stream source stopped: {}", e);
    }

    // Shutdown sequence
    tracing::info!("Shutting down...");
    shutdown.cancel();

    let stats = match coordinator_task.await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!("Coordinator task failed: {}", e);
            coordinator.stats()
        }
    };

    for classifier in &classifiers {
        classifier.close().await;
    }
    health_monitor.shutdown().await;
    if let Some(ticker) = reconcile_ticker {
        ticker.shutdown().await;
    }

    let source_stats = source.stats();
    let gateway_stats = gateway.stats();

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Messages received:    {}", source_stats.messages);
    tracing::info!("Invalid messages:     {}", source_stats.invalid);
    tracing::info!("Reconnects:           {}", source_stats.reconnects);
    tracing::info!("Events handled:       {}", stats.events);
    tracing::info!("Posts stored:         {}", stats.stored);
    tracing::info!("Posts discarded:      {}", stats.discarded);
    tracing::info!("Posts deleted:        {}", stats.deleted);
    tracing::info!("Store errors:         {}", stats.store_errors);
    tracing::info!("Upstream requests:    {}", gateway_stats.total_requests);
    tracing::info!("Circuit trips:        {}", gateway_stats.circuit_breaker_trips);

    Ok(())
}
