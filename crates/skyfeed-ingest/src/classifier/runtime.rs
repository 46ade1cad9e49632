//! The generic classifier runtime, one instance per feed.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use skyfeed_core::{ContentItem, OverflowPolicy, TtlCache, now_millis};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::membership::{Membership, RefreshReport};
use super::patterns::{CompiledPatterns, build_match_string};
use super::{ClassifierConfig, ClassifierState, FeedClassifier};
use crate::store::FeedStore;
use crate::ticker::Ticker;
use crate::upstream::{PostView, UpstreamClient};
use crate::{Error, Result};

/// How many membership TTLs a cached list may outlive before it is pruned.
const MEMBERSHIP_PRUNE_FACTOR: u32 = 4;

/// Statistics from one maintenance run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Tags removed by the retention sweep.
    pub tags_expired: usize,
    /// Items deleted after losing their last tag.
    pub items_deleted: usize,
    /// `None` when the membership TTL had not elapsed.
    pub membership: Option<RefreshReport>,
    pub authors_added: usize,
    pub authors_removed: usize,
    /// Removals were held back because the allow-set was incomplete.
    pub removals_skipped: bool,
    pub posts_backfilled: usize,
    pub cache_entries_pruned: usize,
    /// Names of the sub-steps that failed.
    pub failed_steps: Vec<&'static str>,
}

struct Inner {
    config: ClassifierConfig,
    store: Arc<dyn FeedStore>,
    upstream: UpstreamClient,
    patterns: OnceLock<CompiledPatterns>,
    membership: Membership,
    match_cache: TtlCache<(String, String), bool>,
    state: watch::Sender<ClassifierState>,
    ticker: Ticker,
}

/// Classifier driven entirely by its [`ClassifierConfig`].
pub struct ClassifierRuntime {
    inner: Arc<Inner>,
}

impl ClassifierRuntime {
    /// Create a classifier. Maintenance stops when `shutdown` is cancelled.
    pub fn new(
        config: ClassifierConfig,
        store: Arc<dyn FeedStore>,
        upstream: UpstreamClient,
        shutdown: &CancellationToken,
    ) -> Self {
        let membership = Membership::new(
            config.name.clone(),
            config.allow_lists.clone(),
            config.block_lists.clone(),
            config.membership_ttl,
        );
        let match_cache = TtlCache::new(
            config.match_cache_capacity,
            config.match_cache_ttl,
            OverflowPolicy::ClearAll,
        );
        let ticker = Ticker::new(
            format!("classifier:{}", config.name),
            config.maintenance_interval,
            shutdown,
        );
        let (state, _) = watch::channel(ClassifierState::Uninitialized);

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                upstream,
                patterns: OnceLock::new(),
                membership,
                match_cache,
                state,
                ticker,
            }),
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ClassifierState {
        *self.inner.state.borrow()
    }

    pub fn membership(&self) -> &Membership {
        &self.inner.membership
    }

    /// Move `Uninitialized → Starting`. False if already starting or ready.
    fn begin_start(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == ClassifierState::Uninitialized {
                *state = ClassifierState::Starting;
                true
            } else {
                false
            }
        })
    }

    /// Run the one-time setup and become ready, without scheduling maintenance.
    pub async fn initialize(&self) -> Result<bool> {
        if !self.begin_start() {
            return Ok(false);
        }

        if let Err(e) = self.inner.setup().await {
            self.inner.state.send_replace(ClassifierState::Uninitialized);
            return Err(e);
        }

        self.inner.state.send_replace(ClassifierState::Ready);
        tracing::info!(feed = %self.inner.config.name, "Classifier ready");
        Ok(true)
    }

    /// Run every maintenance sub-step once.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.inner.periodic_task().await
    }

    /// Number of cached match verdicts.
    pub fn match_cache_len(&self) -> usize {
        self.inner.match_cache.len()
    }
}

#[async_trait]
impl FeedClassifier for ClassifierRuntime {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    async fn start(&self) -> Result<bool> {
        if !self.initialize().await? {
            return Ok(false);
        }

        let inner = Arc::clone(&self.inner);
        self.inner.ticker.start(move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.periodic_task().await;
            }
        });
        Ok(true)
    }

    fn is_ready(&self) -> bool {
        self.state() == ClassifierState::Ready
    }

    async fn wait_ready(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this only returns once ready.
        let _ = rx.wait_for(|s| *s == ClassifierState::Ready).await;
    }

    async fn filter_accepts(&self, item: &ContentItem) -> Result<bool> {
        self.inner.accepts(item)
    }

    async fn close(&self) {
        self.inner.ticker.shutdown().await;
        self.inner.match_cache.clear();
        tracing::info!(feed = %self.inner.config.name, "Classifier closed");
    }
}

impl Inner {
    fn feed(&self) -> &str {
        &self.config.name
    }

    async fn setup(&self) -> Result<()> {
        let compiled = CompiledPatterns::compile(&self.config.pattern_groups).map_err(|e| {
            Error::Classifier {
                feed: self.config.name.clone(),
                reason: format!("invalid pattern: {e}"),
            }
        })?;
        // Setup runs once per instance; a second value is impossible.
        let _ = self.patterns.set(compiled);

        self.resolve_static().await;

        let report = self.membership.refresh(&self.upstream).await;
        tracing::debug!(
            feed = %self.feed(),
            fetched = report.fetched,
            failed = report.failures(),
            "Initial membership refresh done"
        );

        Ok(())
    }

    /// Resolve the configured authors into the static sets. Returns how many
    /// handles are still unresolved.
    async fn resolve_static(&self) -> usize {
        let (allow, allow_unresolved) = self.resolve_authors(&self.config.allow_authors).await;
        let (block, block_unresolved) = self.resolve_authors(&self.config.block_authors).await;
        let unresolved = allow_unresolved + block_unresolved;
        self.membership.set_static(allow, block, unresolved);
        unresolved
    }

    /// DIDs pass through; handles are resolved. Unresolvable handles are
    /// skipped and counted.
    async fn resolve_authors(&self, authors: &[String]) -> (BTreeSet<String>, usize) {
        let mut dids = BTreeSet::new();
        let mut unresolved = 0;

        for author in authors {
            if author.starts_with("did:") {
                dids.insert(author.clone());
                continue;
            }

            match self.upstream.resolve_handle(author).await {
                Ok(did) => {
                    dids.insert(did);
                }
                Err(e) => {
                    tracing::warn!(
                        feed = %self.feed(),
                        handle = %author,
                        error = %e,
                        "Failed to resolve handle, skipping"
                    );
                    unresolved += 1;
                }
            }
        }

        (dids, unresolved)
    }

    fn accepts(&self, item: &ContentItem) -> Result<bool> {
        let sets = self.membership.snapshot();

        if sets.block.contains(&item.author) {
            return Ok(false);
        }
        if sets.allow.contains(&item.author) {
            counter!("classifier_accepted_total", "feed" => self.config.name.clone()).increment(1);
            return Ok(true);
        }

        let patterns = self.patterns.get().ok_or_else(|| Error::Classifier {
            feed: self.config.name.clone(),
            reason: "not started".to_string(),
        })?;
        if !patterns.can_accept() {
            return Ok(false);
        }

        let key = (item.uri.clone(), build_match_string(item));
        let accepted = match self.match_cache.get_fresh(&key) {
            Some(cached) => {
                counter!("classifier_match_cache_hits_total", "feed" => self.config.name.clone())
                    .increment(1);
                cached
            }
            None => {
                let accepted = patterns.evaluate(&key.1).is_accept();
                if self.match_cache.insert(key, accepted) > 0 {
                    counter!(
                        "classifier_match_cache_overflows_total",
                        "feed" => self.config.name.clone()
                    )
                    .increment(1);
                }
                accepted
            }
        };

        if accepted {
            counter!("classifier_accepted_total", "feed" => self.config.name.clone()).increment(1);
        }
        Ok(accepted)
    }

    fn step_failed(&self, report: &mut MaintenanceReport, step: &'static str, error: &Error) {
        tracing::warn!(feed = %self.feed(), step, error = %error, "Maintenance step failed");
        counter!(
            "classifier_maintenance_errors_total",
            "feed" => self.config.name.clone(),
            "step" => step
        )
        .increment(1);
        report.failed_steps.push(step);
    }

    /// Each sub-step is isolated: a failure is logged and the rest still run.
    async fn periodic_task(&self) -> MaintenanceReport {
        let started = Instant::now();
        let mut report = MaintenanceReport::default();

        match self.expire_old_tags().await {
            Ok((expired, deleted)) => {
                report.tags_expired = expired;
                report.items_deleted += deleted;
            }
            Err(e) => self.step_failed(&mut report, "retention", &e),
        }

        if self.membership.unresolved_handles() > 0 {
            let unresolved = self.resolve_static().await;
            if unresolved > 0 {
                let e = Error::Classifier {
                    feed: self.config.name.clone(),
                    reason: format!("{unresolved} handles unresolved"),
                };
                self.step_failed(&mut report, "handles", &e);
            }
        }

        if self.membership.needs_refresh() {
            let refresh = self.membership.refresh(&self.upstream).await;
            if refresh.missing > 0 {
                let e = Error::Classifier {
                    feed: self.config.name.clone(),
                    reason: format!("{} lists unavailable", refresh.missing),
                };
                self.step_failed(&mut report, "membership", &e);
            }
            report.membership = Some(refresh);
        }

        if let Err(e) = self.reconcile_authors(&mut report).await {
            self.step_failed(&mut report, "authors", &e);
        }

        let list_max_age = self
            .config
            .membership_ttl
            .saturating_mul(MEMBERSHIP_PRUNE_FACTOR);
        report.cache_entries_pruned =
            self.match_cache.prune_expired() + self.membership.prune(list_max_age);

        let elapsed = started.elapsed();
        histogram!(
            "classifier_maintenance_duration_seconds",
            "feed" => self.config.name.clone()
        )
        .record(elapsed.as_secs_f64());

        tracing::debug!(
            feed = %self.feed(),
            tags_expired = report.tags_expired,
            items_deleted = report.items_deleted,
            authors_added = report.authors_added,
            authors_removed = report.authors_removed,
            backfilled = report.posts_backfilled,
            failed_steps = report.failed_steps.len(),
            "Maintenance complete in {:?}",
            elapsed
        );

        report
    }

    async fn expire_old_tags(&self) -> Result<(usize, usize)> {
        let cutoff = now_millis() - self.config.retention.as_millis() as i64;
        let expired = self.store.remove_tag_older_than(self.feed(), cutoff).await?;
        let deleted = self.store.delete_untagged().await?;
        Ok((expired, deleted))
    }

    /// Sync persisted author records with the allow-set.
    ///
    /// Removed authors lose this feed's tag on their posts. Added authors are
    /// backfilled and recorded only once their backfill succeeds, so a failed
    /// backfill is retried on the next run. While a list or handle is
    /// unavailable the allow-set is partial, so removals wait for it.
    async fn reconcile_authors(&self, report: &mut MaintenanceReport) -> Result<()> {
        let sets = self.membership.snapshot();
        let persisted = self.store.distinct_authors(self.feed()).await?;

        let added: Vec<String> = sets.allow.difference(&persisted).cloned().collect();
        let removed: Vec<String> = if sets.complete {
            persisted.difference(&sets.allow).cloned().collect()
        } else {
            let pending = persisted.difference(&sets.allow).count();
            if pending > 0 {
                tracing::info!(
                    feed = %self.feed(),
                    pending,
                    "Allow-set incomplete, deferring author removals"
                );
            }
            report.removals_skipped = true;
            Vec::new()
        };

        for did in &removed {
            self.store.remove_tag_for_author(self.feed(), did).await?;
            self.store.delete_author(self.feed(), did).await?;
            report.authors_removed += 1;
        }
        if !removed.is_empty() {
            report.items_deleted += self.store.delete_untagged().await?;
            tracing::info!(feed = %self.feed(), "Removed {} authors", removed.len());
        }

        for did in &added {
            match self.backfill_author(did).await {
                Ok(stored) => {
                    self.store.upsert_author(self.feed(), did).await?;
                    report.authors_added += 1;
                    report.posts_backfilled += stored;
                }
                Err(e) => self.step_failed(report, "backfill", &e),
            }
        }

        Ok(())
    }

    async fn backfill_author(&self, did: &str) -> Result<usize> {
        if self.config.backfill_limit == 0 {
            return Ok(0);
        }

        let history = self
            .upstream
            .fetch_author_history(did, self.config.backfill_limit)
            .await?;

        let mut stored = 0;
        for view in history {
            if let Some(item) = self.backfill_item(&view).await? {
                self.store.upsert_by_uri(&item).await?;
                stored += 1;
            }
        }

        if stored > 0 {
            counter!("classifier_backfilled_total", "feed" => self.config.name.clone())
                .increment(stored as u64);
            tracing::debug!(feed = %self.feed(), author = %did, "Backfilled {} posts", stored);
        }
        Ok(stored)
    }

    /// Classify one historical post; `None` if this feed does not want it.
    ///
    /// An existing row keeps its other feed tags and its original `indexed_at`.
    async fn backfill_item(&self, view: &PostView) -> Result<Option<ContentItem>> {
        let draft = match view.to_draft() {
            Ok(draft) => draft,
            Err(e) => {
                tracing::debug!(feed = %self.feed(), uri = %view.uri, "Skipping post: {}", e);
                return Ok(None);
            }
        };

        let now = now_millis();
        let indexed_at = chrono::DateTime::parse_from_rfc3339(&draft.created_at)
            .map(|dt| dt.timestamp_millis().min(now))
            .unwrap_or(now);

        let mut item = draft.into_item(BTreeSet::new(), indexed_at);
        if !self.accepts(&item)? {
            return Ok(None);
        }

        if let Some(existing) = self.store.get_by_uri(&item.uri).await? {
            item.feed_tags = existing.feed_tags;
            item.indexed_at = existing.indexed_at;
        }
        item.feed_tags.insert(self.config.name.clone());
        item.labels = Some(view.label_values());

        Ok(Some(item))
    }
}
