//! Per-feed classification.
//!
//! Every feed is one [`ClassifierRuntime`] interpreting a data-driven
//! [`ClassifierConfig`]: ordered pattern groups plus allow/block author
//! sources. The coordinator only sees the [`FeedClassifier`] trait.
//!
//! # Decision order
//!
//! 1. Author in the block-set: reject.
//! 2. Author in the allow-set: accept, whatever the text says.
//! 3. Otherwise the normalized match string is checked against the pattern
//!    groups. Every `exclude` group runs first and any hit rejects; then the
//!    `include` groups run in order and the first hit accepts.
//!
//! # Lifecycle
//!
//! `Uninitialized → Starting → Ready`. A second `start` while starting or
//! after reaching `Ready` is a no-op returning `false`; `Ready` is sticky.
//! Once ready, maintenance runs immediately and then every
//! `maintenance_interval` after the previous run completes.

mod membership;
mod patterns;
mod runtime;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skyfeed_core::ContentItem;

use crate::Result;

pub use membership::{MemberSets, Membership, RefreshReport};
pub use patterns::{CompiledPatterns, Verdict, build_match_string};
pub use runtime::{ClassifierRuntime, MaintenanceReport};

/// Uniform contract between the coordinator and a feed.
#[async_trait]
pub trait FeedClassifier: Send + Sync {
    /// Feed name; also the tag stored on accepted items.
    fn name(&self) -> &str;

    /// Run one-time setup and schedule maintenance.
    ///
    /// Returns `Ok(false)` if the classifier is already starting or ready.
    async fn start(&self) -> Result<bool>;

    fn is_ready(&self) -> bool;

    /// Suspend until the classifier is ready.
    async fn wait_ready(&self);

    /// Whether this feed wants the item.
    async fn filter_accepts(&self, item: &ContentItem) -> Result<bool>;

    /// Stop maintenance and drop soft state.
    async fn close(&self);
}

/// Lifecycle state of a classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierState {
    Uninitialized,
    Starting,
    Ready,
}

/// Role of a pattern group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    /// Any hit rejects the item before include groups are consulted.
    Exclude,
    /// Any hit accepts the item.
    Include,
}

fn default_true() -> bool {
    true
}

/// An ordered list of regular expressions evaluated as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternGroup {
    pub kind: GroupKind,
    pub patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub case_insensitive: bool,
}

impl PatternGroup {
    pub fn include<S: Into<String>>(patterns: impl IntoIterator<Item = S>) -> Self {
        Self {
            kind: GroupKind::Include,
            patterns: patterns.into_iter().map(Into::into).collect(),
            case_insensitive: true,
        }
    }

    pub fn exclude<S: Into<String>>(patterns: impl IntoIterator<Item = S>) -> Self {
        Self {
            kind: GroupKind::Exclude,
            patterns: patterns.into_iter().map(Into::into).collect(),
            case_insensitive: true,
        }
    }
}

/// Everything that distinguishes one feed from another.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub name: String,
    /// Evaluated exclude-first, then include groups in order.
    pub pattern_groups: Vec<PatternGroup>,
    /// DIDs or handles; handles are resolved at start.
    pub allow_authors: Vec<String>,
    pub block_authors: Vec<String>,
    /// List AT-URIs whose members join the allow-set.
    pub allow_lists: Vec<String>,
    /// List AT-URIs whose members join the block-set.
    pub block_lists: Vec<String>,
    /// How long a fetched list is trusted.
    pub membership_ttl: Duration,
    pub maintenance_interval: Duration,
    pub match_cache_capacity: usize,
    /// Upper bound on how long a cached verdict is reused.
    pub match_cache_ttl: Duration,
    /// Feed tags on items older than this are expired.
    pub retention: Duration,
    /// Posts fetched per newly allowed author.
    pub backfill_limit: usize,
}

impl ClassifierConfig {
    /// Config with default intervals and no patterns or authors.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern_groups: Vec::new(),
            allow_authors: Vec::new(),
            block_authors: Vec::new(),
            allow_lists: Vec::new(),
            block_lists: Vec::new(),
            membership_ttl: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(15 * 60),
            match_cache_capacity: 10_000,
            match_cache_ttl: Duration::from_secs(10 * 60),
            retention: Duration::from_millis(skyfeed_core::DEFAULT_RETENTION_MILLIS as u64),
            backfill_limit: 50,
        }
    }
}
