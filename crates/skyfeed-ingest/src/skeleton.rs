//! Feed skeleton queries.
//!
//! A skeleton is one page of post URIs for a feed, newest first. It is
//! built straight from [`FeedStore::latest_by_tag`] and serializes to the
//! `app.bsky.feed.getFeedSkeleton` output shape.

use serde::{Deserialize, Serialize};
use skyfeed_core::Cursor;

use crate::Result;
use crate::store::FeedStore;

/// Page size when the caller does not ask for one.
pub const DEFAULT_SKELETON_LIMIT: usize = 50;

/// Largest page a caller may request.
pub const MAX_SKELETON_LIMIT: usize = 100;

/// One entry of a skeleton page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonItem {
    #[serde(rename = "post")]
    pub uri: String,
}

/// One page of a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonPage {
    #[serde(rename = "feed")]
    pub items: Vec<SkeletonItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Fetch one page of `feed`.
///
/// `limit` is clamped to `1..=100`. A cursor that does not parse is a client
/// error ([`crate::Error::is_client_error`]), never silently ignored.
pub async fn get_skeleton(
    store: &dyn FeedStore,
    feed: &str,
    limit: Option<usize>,
    cursor: Option<&str>,
) -> Result<SkeletonPage> {
    let limit = limit
        .unwrap_or(DEFAULT_SKELETON_LIMIT)
        .clamp(1, MAX_SKELETON_LIMIT);

    let cursor = cursor
        .map(str::parse::<Cursor>)
        .transpose()
        .map_err(crate::Error::from)?;

    let page = store.latest_by_tag(feed, limit, cursor.as_ref()).await?;

    Ok(SkeletonPage {
        items: page
            .items
            .into_iter()
            .map(|item| SkeletonItem { uri: item.uri })
            .collect(),
        cursor: page.next_cursor.map(|c| c.to_string()),
    })
}
