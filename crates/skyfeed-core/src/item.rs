//! Content records and their deterministic ids.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hash bytes kept for a content id (hex-encoded to twice as many chars).
const CONTENT_ID_BYTES: usize = 16;

/// Compute the content id for a record URI.
///
/// The id is the lowercase hex of the first 16 bytes of SHA-256(uri). It is a
/// pure function of the URI, so replays of the same record always map to the
/// same row.
pub fn content_id(uri: &str) -> String {
    let digest = Sha256::digest(uri.as_bytes());
    hex::encode(&digest[..CONTENT_ID_BYTES])
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Embed metadata distilled from a post's embed union.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedMeta {
    /// Embed `$type`, e.g. `app.bsky.embed.images`.
    pub kind: String,
    /// Alt texts of attached images or video.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_texts: Vec<String>,
    /// Target of an external link card.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_description: Option<String>,
    /// URI of a quoted record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_uri: Option<String>,
}

/// A post validated at the ingestion boundary, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDraft {
    pub uri: String,
    /// Author DID.
    pub author: String,
    pub text: String,
    /// `createdAt` as written by the author's client (RFC 3339).
    pub created_at: String,
    /// Hashtags from the record's `tags` field and tag facets, deduplicated.
    pub tags: Vec<String>,
    pub embed: Option<EmbedMeta>,
}

impl ContentDraft {
    /// Turn the draft into a persisted item with the given feed tags.
    pub fn into_item(self, feed_tags: BTreeSet<String>, indexed_at: i64) -> ContentItem {
        ContentItem {
            id: content_id(&self.uri),
            uri: self.uri,
            author: self.author,
            text: self.text,
            created_at: self.created_at,
            indexed_at,
            tags: self.tags,
            embed: self.embed,
            labels: None,
            feed_tags,
        }
    }
}

/// A stored content record.
///
/// Owned by the store once persisted; classifiers only read it and propose
/// feed tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    /// Record AT-URI, the natural key.
    pub uri: String,
    /// `content_id(uri)`, used as the pagination tie-break.
    pub id: String,
    pub author: String,
    pub text: String,
    pub created_at: String,
    /// Time of acceptance, Unix milliseconds.
    pub indexed_at: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<EmbedMeta>,
    /// Moderation label values; `None` until reconciled.
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    /// Names of the feeds this item belongs to.
    pub feed_tags: BTreeSet<String>,
}

impl ContentItem {
    /// Build an item outside the stream path (backfill, tests).
    pub fn new(
        uri: impl Into<String>,
        author: impl Into<String>,
        text: impl Into<String>,
        indexed_at: i64,
    ) -> Self {
        let uri = uri.into();
        Self {
            id: content_id(&uri),
            uri,
            author: author.into(),
            text: text.into(),
            created_at: chrono::DateTime::from_timestamp_millis(indexed_at)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default(),
            indexed_at,
            tags: Vec::new(),
            embed: None,
            labels: None,
            feed_tags: BTreeSet::new(),
        }
    }

    /// Builder-style helper to attach a feed tag.
    pub fn with_feed_tag(mut self, tag: impl Into<String>) -> Self {
        self.feed_tags.insert(tag.into());
        self
    }
}
