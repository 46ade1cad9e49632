//! Skyfeed ingestion pipeline components.
//!
//! This crate consumes the Bluesky Jetstream, decides which posts belong in
//! which custom feeds, and keeps the stored posts' moderation labels current.
//!
//! # Modules
//!
//! - [`source`] - Stream sources (Jetstream websocket)
//! - [`coordinator`] - Per-event fan-out to classifiers and persistence
//! - [`classifier`] - Data-driven per-feed classifier runtime
//! - [`gateway`] - Rate limiting, retries and circuit breaking for upstream calls
//! - [`upstream`] - AppView XRPC client behind the gateway
//! - [`reconcile`] - Batch label reconciliation
//! - [`store`] - Feed storage (SQLite) and the query contract
//! - [`skeleton`] - Feed skeleton pages built from the store
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Jetstream    │  wss://…/subscribe?wantedCollections=app.bsky.feed.post
//! └────────┬────────┘
//!          │ StreamEvent
//!          ▼
//! ┌─────────────────┐        ┌──────────────────┐
//! │IngestCoordinator│──────▶ │ ClassifierRuntime│  one per feed, joined per event
//! └────────┬────────┘        └────────┬─────────┘
//!          │ accepted items           │ lists, handles, backfill
//!          ▼                          ▼
//! ┌─────────────────┐        ┌──────────────────┐
//! │    FeedStore    │ ◀───── │     Gateway      │ ──▶ AppView XRPC
//! └────────┬────────┘        └────────▲─────────┘
//!          │                          │
//!          │                 ┌────────┴─────────┐
//!          └───────────────▶ │   ReconcileJob   │  labels for unreconciled items
//!                            └──────────────────┘
//! ```
//!
//! The gateway's breaker state is the only state shared between feeds and
//! the reconciliation job.

pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod health;
pub mod reconcile;
pub mod record;
pub mod skeleton;
pub mod source;
pub mod store;
pub mod ticker;
pub mod upstream;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use classifier::{ClassifierConfig, ClassifierRuntime, FeedClassifier, PatternGroup};
pub use config::{AppConfig, IngestSettings};
pub use coordinator::{CoordinatorStats, IngestCoordinator};
pub use gateway::{Gateway, GatewayConfig, GatewayStats};
pub use health::{HealthConfig, HealthTracker};
pub use reconcile::{ReconcileConfig, ReconcileJob, ReconcileReport};
pub use skeleton::{SkeletonPage, get_skeleton};
pub use source::{JetstreamConfig, JetstreamSource, StreamEvent, StreamSource};
pub use store::{FeedStore, SqliteStore};
pub use upstream::{UpstreamApi, UpstreamClient, XrpcClient};
