//! Stream ingestion coordinator.
//!
//! Receives [`StreamEvent`]s and handles each one in its own task:
//!
//! - **Create**: wait (once) for every classifier to be ready, ask all of
//!   them concurrently whether they want the post, and store it tagged with
//!   the names of those that said yes. A post nobody wants is dropped.
//! - **Delete**: remove the stored item by URI.
//!
//! Handlers for different events may overlap. A classifier error only means
//! that classifier abstains for this event.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use metrics::counter;
use skyfeed_core::{ContentDraft, ContentItem, now_millis};
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::classifier::FeedClassifier;
use crate::source::StreamEvent;
use crate::store::FeedStore;

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Stored with these feed tags.
    Stored(BTreeSet<String>),
    /// No classifier wanted it.
    Discarded,
    /// Delete applied; `true` if the item existed.
    Deleted(bool),
    /// The store rejected the write.
    StoreFailed,
}

/// Counters for a coordinator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub events: u64,
    pub stored: u64,
    pub discarded: u64,
    pub deleted: u64,
    pub store_errors: u64,
    pub classifier_errors: u64,
    pub handler_panics: u64,
}

#[derive(Default)]
struct Counters {
    events: AtomicU64,
    stored: AtomicU64,
    discarded: AtomicU64,
    deleted: AtomicU64,
    store_errors: AtomicU64,
    classifier_errors: AtomicU64,
    handler_panics: AtomicU64,
}

/// Fans stream events out to classifiers and persists the result.
pub struct IngestCoordinator {
    classifiers: Vec<Arc<dyn FeedClassifier>>,
    store: Arc<dyn FeedStore>,
    ready: OnceCell<()>,
    counters: Counters,
}

impl IngestCoordinator {
    pub fn new(classifiers: Vec<Arc<dyn FeedClassifier>>, store: Arc<dyn FeedStore>) -> Self {
        Self {
            classifiers,
            store,
            ready: OnceCell::new(),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            events: self.counters.events.load(Ordering::Relaxed),
            stored: self.counters.stored.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            deleted: self.counters.deleted.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
            classifier_errors: self.counters.classifier_errors.load(Ordering::Relaxed),
            handler_panics: self.counters.handler_panics.load(Ordering::Relaxed),
        }
    }

    /// Consume events until the channel closes or `cancel` fires.
    ///
    /// Handlers still in flight at that point are awaited, not aborted.
    pub async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<StreamEvent>,
        cancel: CancellationToken,
    ) -> CoordinatorStats {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    self.check_handler(joined);
                }

                event = receiver.recv() => match event {
                    Some(event) => {
                        let this = Arc::clone(&self);
                        handlers.spawn(async move {
                            this.handle_event(event).await;
                        });
                    }
                    None => break,
                },
            }
        }

        if !handlers.is_empty() {
            tracing::info!("Waiting for {} in-flight event handlers", handlers.len());
        }
        while let Some(joined) = handlers.join_next().await {
            self.check_handler(joined);
        }

        let stats = self.stats();
        tracing::info!(
            events = stats.events,
            stored = stats.stored,
            discarded = stats.discarded,
            deleted = stats.deleted,
            store_errors = stats.store_errors,
            "Ingest coordinator stopped"
        );
        stats
    }

    fn check_handler(&self, joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            self.counters.handler_panics.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Event handler failed: {}", e);
        }
    }

    /// Handle one event to completion.
    pub async fn handle_event(&self, event: StreamEvent) -> Outcome {
        self.counters.events.fetch_add(1, Ordering::Relaxed);

        match event {
            StreamEvent::Create(draft) => self.handle_create(draft).await,
            StreamEvent::Delete { uri } => self.handle_delete(&uri).await,
        }
    }

    async fn handle_create(&self, draft: ContentDraft) -> Outcome {
        self.wait_until_ready().await;

        let mut item = draft.into_item(BTreeSet::new(), now_millis());
        let tags = self.classify(&item).await;

        if tags.is_empty() {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            counter!("ingest_posts_discarded_total").increment(1);
            return Outcome::Discarded;
        }

        item.feed_tags = tags.clone();
        match self.store.upsert_by_uri(&item).await {
            Ok(()) => {
                self.counters.stored.fetch_add(1, Ordering::Relaxed);
                counter!("ingest_posts_accepted_total").increment(1);
                tracing::debug!(uri = %item.uri, feeds = ?tags, "Stored post");
                Outcome::Stored(tags)
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                counter!("ingest_store_errors_total").increment(1);
                tracing::warn!(uri = %item.uri, "Failed to store post: {}", e);
                Outcome::StoreFailed
            }
        }
    }

    async fn handle_delete(&self, uri: &str) -> Outcome {
        match self.store.delete_by_uri(uri).await {
            Ok(existed) => {
                if existed {
                    self.counters.deleted.fetch_add(1, Ordering::Relaxed);
                    counter!("ingest_posts_deleted_total").increment(1);
                    tracing::debug!(uri = %uri, "Deleted post");
                }
                Outcome::Deleted(existed)
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                counter!("ingest_store_errors_total").increment(1);
                tracing::warn!(uri = %uri, "Failed to delete post: {}", e);
                Outcome::StoreFailed
            }
        }
    }

    /// Suspend until every classifier has reported ready. Only the first
    /// caller actually waits; later callers see the completed cell.
    async fn wait_until_ready(&self) {
        self.ready
            .get_or_init(|| async {
                join_all(self.classifiers.iter().map(|c| c.wait_ready())).await;
                tracing::info!("All {} classifiers ready", self.classifiers.len());
            })
            .await;
    }

    /// Names of the classifiers that accept `item`.
    pub async fn classify(&self, item: &ContentItem) -> BTreeSet<String> {
        let verdicts = join_all(self.classifiers.iter().map(|c| c.filter_accepts(item))).await;

        let mut tags = BTreeSet::new();
        for (classifier, verdict) in self.classifiers.iter().zip(verdicts) {
            match verdict {
                Ok(true) => {
                    tags.insert(classifier.name().to_string());
                }
                Ok(false) => {}
                Err(e) => {
                    self.counters.classifier_errors.fetch_add(1, Ordering::Relaxed);
                    counter!("classifier_errors_total", "feed" => classifier.name().to_string())
                        .increment(1);
                    tracing::warn!(
                        feed = %classifier.name(),
                        uri = %item.uri,
                        "Classifier failed, abstaining: {}",
                        e
                    );
                }
            }
        }
        tags
    }
}
