//! Configuration loading.
//!
//! Feeds and tuning knobs come from one TOML file. Every section is optional
//! and every field falls back to the component's `Default`. Durations are
//! written as integer `*_secs` (or `*_ms`) fields.
//!
//! ```toml
//! [gateway]
//! requests_per_window = 10
//! max_retries = 3
//!
//! [reconcile]
//! interval_secs = 600
//!
//! [[feed]]
//! name = "rust"
//! allow_authors = ["did:plc:abc", "ferris.bsky.social"]
//! allow_lists = ["at://did:plc:abc/app.bsky.graph.list/xyz"]
//!
//! [[feed.group]]
//! kind = "exclude"
//! patterns = ["\\bnsfw\\b"]
//!
//! [[feed.group]]
//! kind = "include"
//! patterns = ["\\brust(lang)?\\b", "\\bcargo\\b"]
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::classifier::{ClassifierConfig, CompiledPatterns, PatternGroup};
use crate::gateway::GatewayConfig;
use crate::health::HealthConfig;
use crate::reconcile::ReconcileConfig;
use crate::{Error, Result};

/// Settings shared by the long-running components.
#[derive(Debug, Clone, Default)]
pub struct IngestSettings {
    pub gateway: GatewayConfig,
    pub reconcile: ReconcileConfig,
    pub health: HealthConfig,
}

/// Everything loaded from a config file.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub settings: IngestSettings,
    pub feeds: Vec<ClassifierConfig>,
}

impl AppConfig {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Parse and validate config text.
    pub fn parse(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        file.into_config()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// File format
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    gateway: GatewaySection,
    #[serde(default)]
    reconcile: ReconcileSection,
    #[serde(default)]
    health: HealthSection,
    #[serde(default)]
    feed: Vec<FeedSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GatewaySection {
    requests_per_window: Option<u32>,
    window_ms: Option<u64>,
    max_concurrency: Option<usize>,
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    breaker_threshold: Option<u32>,
    breaker_cooldown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReconcileSection {
    chunk_size: Option<usize>,
    batch_limit: Option<usize>,
    interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HealthSection {
    check_interval_secs: Option<u64>,
    warn_after_secs: Option<u64>,
    critical_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FeedSection {
    name: String,
    #[serde(default)]
    group: Vec<PatternGroup>,
    #[serde(default)]
    allow_authors: Vec<String>,
    #[serde(default)]
    block_authors: Vec<String>,
    #[serde(default)]
    allow_lists: Vec<String>,
    #[serde(default)]
    block_lists: Vec<String>,
    membership_ttl_secs: Option<u64>,
    maintenance_interval_secs: Option<u64>,
    match_cache_capacity: Option<usize>,
    match_cache_ttl_secs: Option<u64>,
    retention_secs: Option<u64>,
    backfill_limit: Option<usize>,
}

fn nonzero(field: &str, value: Duration) -> Result<Duration> {
    if value.is_zero() {
        return Err(Error::Config(format!("{field} must be greater than zero")));
    }
    Ok(value)
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl ConfigFile {
    fn into_config(self) -> Result<AppConfig> {
        let settings = IngestSettings {
            gateway: self.gateway.into_config()?,
            reconcile: self.reconcile.into_config()?,
            health: self.health.into_config()?,
        };

        let mut names = HashSet::new();
        let mut feeds = Vec::with_capacity(self.feed.len());
        for section in self.feed {
            let feed = section.into_config()?;
            if !names.insert(feed.name.clone()) {
                return Err(Error::Config(format!("duplicate feed name '{}'", feed.name)));
            }
            feeds.push(feed);
        }

        Ok(AppConfig { settings, feeds })
    }
}

impl GatewaySection {
    fn into_config(self) -> Result<GatewayConfig> {
        let defaults = GatewayConfig::default();
        let config = GatewayConfig {
            requests_per_window: self.requests_per_window.unwrap_or(defaults.requests_per_window),
            window: nonzero("gateway.window_ms", millis_or(self.window_ms, defaults.window))?,
            max_concurrency: self.max_concurrency.unwrap_or(defaults.max_concurrency),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            base_delay: millis_or(self.base_delay_ms, defaults.base_delay),
            max_delay: millis_or(self.max_delay_ms, defaults.max_delay),
            breaker_threshold: self.breaker_threshold.unwrap_or(defaults.breaker_threshold),
            breaker_cooldown: nonzero(
                "gateway.breaker_cooldown_secs",
                secs_or(self.breaker_cooldown_secs, defaults.breaker_cooldown),
            )?,
        };

        if config.requests_per_window == 0 {
            return Err(Error::Config(
                "gateway.requests_per_window must be greater than zero".into(),
            ));
        }
        if config.max_concurrency == 0 {
            return Err(Error::Config(
                "gateway.max_concurrency must be greater than zero".into(),
            ));
        }
        if config.breaker_threshold == 0 {
            return Err(Error::Config(
                "gateway.breaker_threshold must be greater than zero".into(),
            ));
        }
        if config.base_delay > config.max_delay {
            return Err(Error::Config(
                "gateway.base_delay_ms exceeds gateway.max_delay_ms".into(),
            ));
        }
        Ok(config)
    }
}

impl ReconcileSection {
    fn into_config(self) -> Result<ReconcileConfig> {
        let defaults = ReconcileConfig::default();
        let config = ReconcileConfig {
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
            batch_limit: self.batch_limit.unwrap_or(defaults.batch_limit),
            interval: nonzero(
                "reconcile.interval_secs",
                secs_or(self.interval_secs, defaults.interval),
            )?,
        };

        if config.chunk_size == 0 || config.batch_limit == 0 {
            return Err(Error::Config(
                "reconcile.chunk_size and reconcile.batch_limit must be greater than zero".into(),
            ));
        }
        Ok(config)
    }
}

impl HealthSection {
    fn into_config(self) -> Result<HealthConfig> {
        let defaults = HealthConfig::default();
        let config = HealthConfig {
            check_interval: nonzero(
                "health.check_interval_secs",
                secs_or(self.check_interval_secs, defaults.check_interval),
            )?,
            warn_after: secs_or(self.warn_after_secs, defaults.warn_after),
            critical_after: secs_or(self.critical_after_secs, defaults.critical_after),
        };

        if config.warn_after > config.critical_after {
            return Err(Error::Config(
                "health.warn_after_secs exceeds health.critical_after_secs".into(),
            ));
        }
        Ok(config)
    }
}

impl FeedSection {
    fn into_config(self) -> Result<ClassifierConfig> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::Config("feed name must not be empty".into()));
        }

        CompiledPatterns::compile(&self.group)
            .map_err(|e| Error::Config(format!("feed '{name}': invalid pattern: {e}")))?;

        let defaults = ClassifierConfig::new(name.as_str());
        let field = |f: &str| format!("feed '{name}': {f}");

        let config = ClassifierConfig {
            pattern_groups: self.group,
            allow_authors: self.allow_authors,
            block_authors: self.block_authors,
            allow_lists: self.allow_lists,
            block_lists: self.block_lists,
            membership_ttl: nonzero(
                &field("membership_ttl_secs"),
                secs_or(self.membership_ttl_secs, defaults.membership_ttl),
            )?,
            maintenance_interval: nonzero(
                &field("maintenance_interval_secs"),
                secs_or(self.maintenance_interval_secs, defaults.maintenance_interval),
            )?,
            match_cache_capacity: self
                .match_cache_capacity
                .unwrap_or(defaults.match_cache_capacity),
            match_cache_ttl: nonzero(
                &field("match_cache_ttl_secs"),
                secs_or(self.match_cache_ttl_secs, defaults.match_cache_ttl),
            )?,
            retention: nonzero(
                &field("retention_secs"),
                secs_or(self.retention_secs, defaults.retention),
            )?,
            backfill_limit: self.backfill_limit.unwrap_or(defaults.backfill_limit),
            name,
        };

        if config.match_cache_capacity == 0 {
            return Err(Error::Config(format!(
                "feed '{}': match_cache_capacity must be greater than zero",
                config.name
            )));
        }
        if config.allow_authors.is_empty()
            && config.allow_lists.is_empty()
            && config.pattern_groups.is_empty()
        {
            tracing::warn!(
                feed = %config.name,
                "Feed has no allow-set and no patterns; it will accept nothing"
            );
        }
        Ok(config)
    }
}
