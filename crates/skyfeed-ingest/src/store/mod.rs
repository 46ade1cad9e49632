//! Feed storage and the query contract the pipeline relies on.
//!
//! Every component receives an `Arc<dyn FeedStore>` at construction time, so
//! tests can swap in an in-memory SQLite database.
//!
//! Contract highlights:
//!
//! - `upsert_by_uri` is idempotent: replaying the same URI replaces the
//!   record instead of duplicating it.
//! - `latest_by_tag` orders by `(indexed_at desc, id desc)` and pages with a
//!   strict tuple comparison against the cursor, so concatenated pages have no
//!   gaps or duplicates.
//! - An item whose last feed tag is removed must not survive: retention
//!   sweeps always pair `remove_tag_older_than` with `delete_untagged`.

mod schema;
mod sqlite;

use std::collections::BTreeSet;

use async_trait::async_trait;
use skyfeed_core::{ContentItem, Cursor};

use crate::Result;

pub use sqlite::SqliteStore;

/// One page of a tag query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPage {
    pub items: Vec<ContentItem>,
    /// Cursor for the next page; `None` when this page was not full.
    pub next_cursor: Option<Cursor>,
}

/// A resolved label value for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelUpdate {
    pub uri: String,
    pub labels: Vec<String>,
}

/// Outcome of a best-effort bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteReport {
    /// Operations that updated a row.
    pub applied: usize,
    /// Operations whose target no longer exists.
    pub missing: usize,
    /// Operations that failed; other operations were still applied.
    pub failed: usize,
}

/// Keyed content store with feed-tag queries.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Insert or replace the item keyed by its URI.
    ///
    /// Labels already written by reconciliation are kept when the incoming
    /// item has none. An item with no feed tags is removed instead of stored.
    async fn upsert_by_uri(&self, item: &ContentItem) -> Result<()>;

    async fn get_by_uri(&self, uri: &str) -> Result<Option<ContentItem>>;

    /// Remove an item regardless of its tags. Returns whether it existed.
    async fn delete_by_uri(&self, uri: &str) -> Result<bool>;

    /// Newest items tagged with `tag`, strictly after `cursor` in sort order.
    async fn latest_by_tag(
        &self,
        tag: &str,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<TagPage>;

    /// Authors recorded for a feed by previous reconciliations.
    async fn distinct_authors(&self, feed: &str) -> Result<BTreeSet<String>>;

    async fn upsert_author(&self, feed: &str, did: &str) -> Result<()>;

    /// Forget an author record. Returns whether it existed.
    async fn delete_author(&self, feed: &str, did: &str) -> Result<bool>;

    /// Drop `feed` from every item by `did`. Returns the number of tags removed.
    async fn remove_tag_for_author(&self, feed: &str, did: &str) -> Result<usize>;

    /// Drop `tag` from items indexed before `cutoff_millis`.
    async fn remove_tag_older_than(&self, tag: &str, cutoff_millis: i64) -> Result<usize>;

    /// Delete items left with no feed tags. Returns how many were deleted.
    async fn delete_untagged(&self) -> Result<usize>;

    /// Most recently indexed items whose labels are still unknown.
    async fn items_missing_labels(&self, limit: usize) -> Result<Vec<ContentItem>>;

    /// Apply label updates independently; one failure never undoes another.
    async fn bulk_set_labels(&self, ops: &[LabelUpdate]) -> Result<BulkWriteReport>;
}
