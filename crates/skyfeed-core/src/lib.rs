//! Core types, cursors, caches and shared utilities for the skyfeed pipeline.
//!
//! This crate provides:
//! - The persisted content record ([`ContentItem`]) and its deterministic id
//! - The feed pagination cursor ([`Cursor`])
//! - A generic TTL cache with an explicit eviction policy ([`TtlCache`])
//! - Prometheus metrics helpers
//! - Shared error types

mod cursor;
mod error;
mod item;
pub mod metrics;
mod ttl_cache;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Collection NSID of the records this pipeline ingests.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Default retention window for feed tags: 7 days, in milliseconds.
pub const DEFAULT_RETENTION_MILLIS: i64 = 7 * 24 * 60 * 60 * 1000;

pub use cursor::{CURSOR_SEPARATOR, Cursor};
pub use error::{Error, Result};
pub use item::{ContentDraft, ContentItem, EmbedMeta, content_id, now_millis};
pub use ttl_cache::{OverflowPolicy, TtlCache};
