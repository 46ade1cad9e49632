//! Typed view of `app.bsky.feed.post` records.
//!
//! Both the Jetstream consumer and author backfill receive raw post records
//! as JSON. This module is the single place where that JSON becomes a
//! validated [`ContentDraft`].

use serde::Deserialize;
use serde_json::Value;
use skyfeed_core::{ContentDraft, EmbedMeta, POST_COLLECTION};

/// Build the AT-URI of a post from its repo DID and record key.
pub fn post_uri(did: &str, rkey: &str) -> String {
    format!("at://{did}/{POST_COLLECTION}/{rkey}")
}

/// The fields of a post record this pipeline reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub facets: Vec<Facet>,
    /// Kept untyped here; unknown embed types are ignored, not rejected.
    #[serde(default)]
    pub embed: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Facet {
    #[serde(default)]
    pub features: Vec<FacetFeature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacetFeature {
    #[serde(rename = "$type", default)]
    pub kind: String,
    #[serde(default)]
    pub tag: Option<String>,
}

const TAG_FEATURE: &str = "app.bsky.richtext.facet#tag";

#[derive(Deserialize)]
#[serde(tag = "$type")]
enum RawEmbed {
    #[serde(rename = "app.bsky.embed.images")]
    Images {
        #[serde(default)]
        images: Vec<RawImage>,
    },
    #[serde(rename = "app.bsky.embed.video")]
    Video {
        #[serde(default)]
        alt: Option<String>,
    },
    #[serde(rename = "app.bsky.embed.external")]
    External { external: RawExternal },
    #[serde(rename = "app.bsky.embed.record")]
    Record { record: RawStrongRef },
    #[serde(rename = "app.bsky.embed.recordWithMedia")]
    RecordWithMedia {
        record: RawRecordRef,
        media: Box<RawEmbed>,
    },
}

#[derive(Deserialize)]
struct RawImage {
    #[serde(default)]
    alt: String,
}

#[derive(Deserialize)]
struct RawExternal {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct RawStrongRef {
    uri: String,
}

#[derive(Deserialize)]
struct RawRecordRef {
    record: RawStrongRef,
}

impl RawEmbed {
    fn kind(&self) -> &'static str {
        match self {
            Self::Images { .. } => "app.bsky.embed.images",
            Self::Video { .. } => "app.bsky.embed.video",
            Self::External { .. } => "app.bsky.embed.external",
            Self::Record { .. } => "app.bsky.embed.record",
            Self::RecordWithMedia { .. } => "app.bsky.embed.recordWithMedia",
        }
    }

    fn fill(self, meta: &mut EmbedMeta) {
        match self {
            Self::Images { images } => {
                meta.alt_texts.extend(
                    images
                        .into_iter()
                        .map(|i| i.alt)
                        .filter(|alt| !alt.trim().is_empty()),
                );
            }
            Self::Video { alt } => {
                meta.alt_texts
                    .extend(alt.filter(|alt| !alt.trim().is_empty()));
            }
            Self::External { external } => {
                meta.external_uri = external.uri;
                meta.external_title = external.title;
                meta.external_description = external.description;
            }
            Self::Record { record } => {
                meta.record_uri = Some(record.uri);
            }
            Self::RecordWithMedia { record, media } => {
                meta.record_uri = Some(record.record.uri);
                media.fill(meta);
            }
        }
    }
}

/// Distill an embed union into [`EmbedMeta`]. Unknown or malformed embeds yield `None`.
pub fn embed_meta(embed: &Value) -> Option<EmbedMeta> {
    let raw: RawEmbed = serde_json::from_value(embed.clone()).ok()?;
    let mut meta = EmbedMeta {
        kind: raw.kind().to_string(),
        ..Default::default()
    };
    raw.fill(&mut meta);
    Some(meta)
}

impl PostRecord {
    /// Hashtags from the `tags` field and tag facets, deduplicated in order.
    pub fn hashtags(&self) -> Vec<String> {
        let facet_tags = self
            .facets
            .iter()
            .flat_map(|f| f.features.iter())
            .filter(|f| f.kind == TAG_FEATURE)
            .filter_map(|f| f.tag.clone());

        let mut seen = std::collections::HashSet::new();
        self.tags
            .iter()
            .cloned()
            .chain(facet_tags)
            .map(|t| t.trim_start_matches('#').to_string())
            .filter(|t| !t.is_empty())
            .filter(|t| seen.insert(t.to_lowercase()))
            .collect()
    }

    /// Validate the record and turn it into a draft.
    pub fn into_draft(self, uri: String, author: String) -> skyfeed_core::Result<ContentDraft> {
        if !uri.starts_with("at://") {
            return Err(skyfeed_core::Error::InvalidRecord {
                field: "uri",
                reason: format!("not an AT-URI: {uri}"),
            });
        }
        if !author.starts_with("did:") {
            return Err(skyfeed_core::Error::InvalidRecord {
                field: "author",
                reason: format!("not a DID: {author}"),
            });
        }
        if self.created_at.is_empty() {
            return Err(skyfeed_core::Error::InvalidRecord {
                field: "createdAt",
                reason: "missing".to_string(),
            });
        }

        let tags = self.hashtags();
        let embed = self.embed.as_ref().and_then(embed_meta);

        Ok(ContentDraft {
            uri,
            author,
            text: self.text,
            created_at: self.created_at,
            tags,
            embed,
        })
    }
}

/// Parse a raw record value and validate it into a draft.
pub fn draft_from_value(
    record: &Value,
    uri: String,
    author: String,
) -> skyfeed_core::Result<ContentDraft> {
    let record: PostRecord = serde_json::from_value(record.clone())?;
    record.into_draft(uri, author)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_post_uri() {
        assert_eq!(
            post_uri("did:plc:abc", "3kxyz"),
            "at://did:plc:abc/app.bsky.feed.post/3kxyz"
        );
    }

    #[test]
    fn test_draft_collects_tags_and_facets() {
        let record = json!({
            "$type": "app.bsky.feed.post",
            "text": "learning #Rust today",
            "createdAt": "2024-05-01T12:00:00Z",
            "tags": ["rustlang"],
            "facets": [{
                "index": {"byteStart": 9, "byteEnd": 14},
                "features": [
                    {"$type": "app.bsky.richtext.facet#tag", "tag": "Rust"},
                    {"$type": "app.bsky.richtext.facet#link", "uri": "https://example.com"}
                ]
            }, {
                "features": [{"$type": "app.bsky.richtext.facet#tag", "tag": "rustlang"}]
            }]
        });

        let draft = draft_from_value(
            &record,
            post_uri("did:plc:abc", "1"),
            "did:plc:abc".to_string(),
        )
        .unwrap();

        assert_eq!(draft.tags, vec!["rustlang".to_string(), "Rust".to_string()]);
        assert_eq!(draft.text, "learning #Rust today");
        assert!(draft.embed.is_none());
    }

    #[test]
    fn test_images_embed() {
        let embed = json!({
            "$type": "app.bsky.embed.images",
            "images": [
                {"alt": "a crab", "image": {}},
                {"alt": "", "image": {}}
            ]
        });
        let meta = embed_meta(&embed).unwrap();
        assert_eq!(meta.kind, "app.bsky.embed.images");
        assert_eq!(meta.alt_texts, vec!["a crab".to_string()]);
    }

    #[test]
    fn test_record_with_media_embed() {
        let embed = json!({
            "$type": "app.bsky.embed.recordWithMedia",
            "record": {
                "$type": "app.bsky.embed.record",
                "record": {"uri": "at://did:plc:x/app.bsky.feed.post/q", "cid": "bafy"}
            },
            "media": {
                "$type": "app.bsky.embed.external",
                "external": {
                    "uri": "https://rust-lang.org",
                    "title": "Rust",
                    "description": "A language"
                }
            }
        });
        let meta = embed_meta(&embed).unwrap();
        assert_eq!(meta.kind, "app.bsky.embed.recordWithMedia");
        assert_eq!(meta.record_uri.as_deref(), Some("at://did:plc:x/app.bsky.feed.post/q"));
        assert_eq!(meta.external_title.as_deref(), Some("Rust"));
    }

    #[test]
    fn test_unknown_embed_is_ignored() {
        assert!(embed_meta(&json!({"$type": "app.example.embed.poll"})).is_none());
    }

    #[test]
    fn test_invalid_records_rejected() {
        let record = json!({"text": "hi", "createdAt": "2024-05-01T12:00:00Z"});

        let bad_author =
            draft_from_value(&record, post_uri("did:plc:a", "1"), "alice".to_string());
        assert!(matches!(
            bad_author,
            Err(skyfeed_core::Error::InvalidRecord { field: "author", .. })
        ));

        let no_date = draft_from_value(
            &json!({"text": "hi"}),
            post_uri("did:plc:a", "1"),
            "did:plc:a".to_string(),
        );
        assert!(matches!(
            no_date,
            Err(skyfeed_core::Error::InvalidRecord { field: "createdAt", .. })
        ));

        let not_object = draft_from_value(
            &json!("text"),
            post_uri("did:plc:a", "1"),
            "did:plc:a".to_string(),
        );
        assert!(matches!(not_object, Err(skyfeed_core::Error::Json(_))));
    }
}
