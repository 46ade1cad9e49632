//! Allow/block author sets and the list-membership cache behind them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use skyfeed_core::{OverflowPolicy, TtlCache};
use tokio::time::Instant;

use crate::upstream::UpstreamClient;

/// Effective author sets at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberSets {
    pub allow: BTreeSet<String>,
    pub block: BTreeSet<String>,
    /// Every configured handle resolved and every list has members cached.
    /// Removals driven by `allow` are only safe while this holds.
    pub complete: bool,
}

/// What one membership refresh did, list by list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Lists fetched from upstream.
    pub fetched: usize,
    /// Lists served from a fresh cache entry.
    pub cached: usize,
    /// Lists whose fetch failed and fell back to the last good value.
    pub stale: usize,
    /// Lists whose fetch failed with nothing cached.
    pub missing: usize,
}

impl RefreshReport {
    pub fn failures(&self) -> usize {
        self.stale + self.missing
    }
}

/// Membership state owned by one classifier.
pub struct Membership {
    feed: String,
    allow_lists: Vec<String>,
    block_lists: Vec<String>,
    ttl: Duration,
    static_allow: RwLock<BTreeSet<String>>,
    static_block: RwLock<BTreeSet<String>>,
    unresolved: AtomicUsize,
    lists: TtlCache<String, Arc<BTreeSet<String>>>,
    sets: RwLock<Arc<MemberSets>>,
    last_refresh: Mutex<Option<Instant>>,
}

impl Membership {
    pub fn new(
        feed: impl Into<String>,
        allow_lists: Vec<String>,
        block_lists: Vec<String>,
        ttl: Duration,
    ) -> Self {
        let capacity = (allow_lists.len() + block_lists.len()).max(1);
        Self {
            feed: feed.into(),
            allow_lists,
            block_lists,
            ttl,
            static_allow: RwLock::new(BTreeSet::new()),
            static_block: RwLock::new(BTreeSet::new()),
            unresolved: AtomicUsize::new(0),
            lists: TtlCache::new(capacity, ttl, OverflowPolicy::EvictOldest),
            sets: RwLock::new(Arc::new(MemberSets::default())),
            last_refresh: Mutex::new(None),
        }
    }

    /// Install the statically configured DIDs. `unresolved` counts the
    /// configured handles that could not be resolved to one.
    pub fn set_static(
        &self,
        allow: BTreeSet<String>,
        block: BTreeSet<String>,
        unresolved: usize,
    ) {
        *self.static_allow.write() = allow;
        *self.static_block.write() = block;
        self.unresolved.store(unresolved, Ordering::Relaxed);
        self.rebuild();
    }

    /// Configured handles still waiting to be resolved.
    pub fn unresolved_handles(&self) -> usize {
        self.unresolved.load(Ordering::Relaxed)
    }

    /// Current sets; cheap to call per event.
    pub fn snapshot(&self) -> Arc<MemberSets> {
        self.sets.read().clone()
    }

    /// Whether the TTL has elapsed since the last refresh.
    pub fn needs_refresh(&self) -> bool {
        self.last_refresh
            .lock()
            .is_none_or(|at| at.elapsed() >= self.ttl)
    }

    /// Re-pull every configured list, reusing fresh cache entries.
    ///
    /// Never fails as a whole: a list whose fetch fails keeps its last good
    /// members, and a list that was never fetched contributes nothing. The
    /// refresh only counts toward the TTL when no list is missing, so a
    /// missing list is retried on the next call.
    pub async fn refresh(&self, upstream: &UpstreamClient) -> RefreshReport {
        let mut report = RefreshReport::default();

        let lists: Vec<String> = self
            .allow_lists
            .iter()
            .chain(self.block_lists.iter())
            .cloned()
            .collect();

        for list in lists {
            if self.lists.get_fresh(&list).is_some() {
                report.cached += 1;
                continue;
            }

            match upstream.fetch_all_list_members(&list).await {
                Ok(members) => {
                    tracing::debug!(
                        feed = %self.feed,
                        list = %list,
                        "Fetched {} list members",
                        members.len()
                    );
                    self.lists.insert(list, Arc::new(members));
                    report.fetched += 1;
                }
                Err(e) => match self.lists.get_stale(&list) {
                    Some((members, age)) => {
                        tracing::warn!(
                            feed = %self.feed,
                            list = %list,
                            error = %e,
                            "List fetch failed, keeping {} members cached {:?} ago",
                            members.len(),
                            age
                        );
                        report.stale += 1;
                    }
                    None => {
                        tracing::warn!(
                            feed = %self.feed,
                            list = %list,
                            error = %e,
                            "List fetch failed with no cached members"
                        );
                        report.missing += 1;
                    }
                },
            }
        }

        if report.missing == 0 {
            *self.last_refresh.lock() = Some(Instant::now());
        }
        self.rebuild();
        report
    }

    /// Drop cached lists older than `max_age`.
    pub fn prune(&self, max_age: Duration) -> usize {
        let pruned = self.lists.prune_older_than(max_age);
        if pruned > 0 {
            self.rebuild();
        }
        pruned
    }

    /// Members of every cached list, and whether any list had nothing cached.
    fn members_of(&self, lists: &[String]) -> (BTreeSet<String>, bool) {
        let mut members = BTreeSet::new();
        let mut missing = false;
        for list in lists {
            match self.lists.get_stale(list) {
                Some((cached, _)) => members.extend(cached.iter().cloned()),
                None => missing = true,
            }
        }
        (members, missing)
    }

    fn rebuild(&self) {
        let (allow_members, allow_missing) = self.members_of(&self.allow_lists);
        let mut allow = self.static_allow.read().clone();
        allow.extend(allow_members);

        let (block_members, block_missing) = self.members_of(&self.block_lists);
        let mut block = self.static_block.read().clone();
        block.extend(block_members);

        let complete = !allow_missing && !block_missing && self.unresolved_handles() == 0;

        metrics::gauge!("classifier_allow_set_size", "feed" => self.feed.clone())
            .set(allow.len() as f64);
        metrics::gauge!("classifier_block_set_size", "feed" => self.feed.clone())
            .set(block.len() as f64);

        *self.sets.write() = Arc::new(MemberSets {
            allow,
            block,
            complete,
        });
    }
}
