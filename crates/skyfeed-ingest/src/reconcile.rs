//! Batch label reconciliation.
//!
//! Moderation labels are often applied after a post is first seen on the
//! stream. This job picks the most recently indexed items that have never
//! been reconciled, looks them up in chunks through the gateway, and writes
//! the resolved label values back in one best-effort bulk write.
//!
//! A chunk whose lookup fails is left untouched, so its items are selected
//! again on the next run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::store::{FeedStore, LabelUpdate};
use crate::ticker::Ticker;
use crate::upstream::{MAX_GET_POSTS, UpstreamClient};

/// Reconciliation settings.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// URIs per lookup; capped at [`MAX_GET_POSTS`].
    pub chunk_size: usize,
    /// Items selected per run.
    pub batch_limit: usize,
    pub interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            chunk_size: MAX_GET_POSTS,
            batch_limit: 500,
            interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Items selected for reconciliation.
    pub selected: usize,
    pub chunks: usize,
    pub chunks_failed: usize,
    /// Items whose labels were resolved (including to no labels).
    pub resolved: usize,
    /// Rows actually updated by the bulk write.
    pub written: usize,
    pub write_failures: usize,
    pub duration: Duration,
}

/// Resolution state of one item within a run.
enum Resolution {
    Resolved(Vec<String>),
    /// The lookup for its chunk failed.
    Unresolved,
}

/// Repairs missing labels on stored items.
pub struct ReconcileJob {
    store: Arc<dyn FeedStore>,
    upstream: UpstreamClient,
    config: ReconcileConfig,
}

impl ReconcileJob {
    pub fn new(
        store: Arc<dyn FeedStore>,
        upstream: UpstreamClient,
        mut config: ReconcileConfig,
    ) -> Self {
        config.chunk_size = config.chunk_size.clamp(1, MAX_GET_POSTS);
        Self {
            store,
            upstream,
            config,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run one reconciliation pass.
    ///
    /// Lookup failures are counted in the report. Only store errors fail the
    /// whole run.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let started = Instant::now();
        let mut report = ReconcileReport::default();

        let items = self.store.items_missing_labels(self.config.batch_limit).await?;
        report.selected = items.len();

        if items.is_empty() {
            tracing::debug!("No items awaiting labels");
            report.duration = started.elapsed();
            return Ok(report);
        }

        let uris: Vec<String> = items.into_iter().map(|item| item.uri).collect();
        let mut table: HashMap<&str, Resolution> = HashMap::with_capacity(uris.len());

        for chunk in uris.chunks(self.config.chunk_size) {
            report.chunks += 1;

            match self.upstream.get_posts(chunk).await {
                Ok(posts) => {
                    let mut found: HashMap<&str, Vec<String>> = posts
                        .iter()
                        .map(|post| (post.uri.as_str(), post.label_values()))
                        .collect();

                    for uri in chunk {
                        // Posts missing from the response are taken down or
                        // deleted; they resolve to no labels.
                        let labels = found.remove(uri.as_str()).unwrap_or_default();
                        table.insert(uri, Resolution::Resolved(labels));
                    }
                }
                Err(e) => {
                    report.chunks_failed += 1;
                    counter!("reconcile_chunks_failed_total").increment(1);
                    tracing::warn!(
                        chunk = report.chunks,
                        uris = chunk.len(),
                        "Label lookup failed, chunk left for next run: {}",
                        e
                    );
                    for uri in chunk {
                        table.insert(uri, Resolution::Unresolved);
                    }
                }
            }
        }

        let updates: Vec<LabelUpdate> = uris
            .iter()
            .filter_map(|uri| match table.remove(uri.as_str()) {
                Some(Resolution::Resolved(labels)) => Some(LabelUpdate {
                    uri: uri.clone(),
                    labels,
                }),
                Some(Resolution::Unresolved) | None => None,
            })
            .collect();
        report.resolved = updates.len();

        if !updates.is_empty() {
            let written = self.store.bulk_set_labels(&updates).await?;
            report.written = written.applied;
            report.write_failures = written.failed;
            counter!("reconcile_items_updated_total").increment(written.applied as u64);
        }

        report.duration = started.elapsed();
        counter!("reconcile_runs_total").increment(1);
        histogram!("reconcile_duration_seconds").record(report.duration.as_secs_f64());

        tracing::info!(
            selected = report.selected,
            chunks = report.chunks,
            chunks_failed = report.chunks_failed,
            written = report.written,
            write_failures = report.write_failures,
            "Reconciliation run complete in {:?}",
            report.duration
        );

        Ok(report)
    }

    /// Run on a [`Ticker`] until `cancel` fires.
    pub fn run_periodic(self: Arc<Self>, cancel: &CancellationToken) -> Ticker {
        let ticker = Ticker::new("reconcile", self.config.interval, cancel);

        ticker.start(move || {
            let job = Arc::clone(&self);
            async move {
                if let Err(e) = job.run_once().await {
                    counter!("reconcile_run_errors_total").increment(1);
                    tracing::error!("Reconciliation run failed: {}", e);
                }
            }
        });

        ticker
    }
}
