//! Upstream AppView API.
//!
//! [`UpstreamApi`] is the raw XRPC surface; [`XrpcClient`] implements it with
//! `reqwest`. Components never hold an `UpstreamApi` directly: they hold an
//! [`UpstreamClient`], which routes every call through the shared
//! [`Gateway`] and adds the paginating helpers.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::gateway::Gateway;
use crate::record;
use crate::{Error, Result};
use skyfeed_core::ContentDraft;

/// Public AppView endpoint.
pub const DEFAULT_APPVIEW_URL: &str = "https://public.api.bsky.app/xrpc";

/// `app.bsky.feed.getPosts` accepts at most this many URIs.
pub const MAX_GET_POSTS: usize = 25;

/// Largest page size the paginated endpoints accept.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Hard stop for list pagination.
const MAX_LIST_PAGES: usize = 100;

/// Hard stop for author-feed pagination.
const MAX_HISTORY_PAGES: usize = 20;

// =============================================================================
// View types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProfileViewBasic {
    pub did: String,
    #[serde(default)]
    pub handle: String,
}

/// A moderation label attached to a record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Label {
    pub val: String,
    #[serde(default)]
    pub src: Option<String>,
    /// Negation labels retract an earlier label.
    #[serde(default)]
    pub neg: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub uri: String,
    #[serde(default)]
    pub cid: String,
    pub author: ProfileViewBasic,
    pub record: serde_json::Value,
    #[serde(default)]
    pub indexed_at: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl PostView {
    /// Label values in effect: negated values are dropped, order kept.
    pub fn label_values(&self) -> Vec<String> {
        let negated: BTreeSet<&str> = self
            .labels
            .iter()
            .filter(|l| l.neg)
            .map(|l| l.val.as_str())
            .collect();

        let mut seen = BTreeSet::new();
        self.labels
            .iter()
            .filter(|l| !l.neg && !negated.contains(l.val.as_str()))
            .filter(|l| seen.insert(l.val.clone()))
            .map(|l| l.val.clone())
            .collect()
    }

    /// Validate the embedded record into a draft.
    pub fn to_draft(&self) -> skyfeed_core::Result<ContentDraft> {
        record::draft_from_value(&self.record, self.uri.clone(), self.author.did.clone())
    }
}

/// One page of an author's feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthorFeedPage {
    /// Posts authored by the actor (reposts excluded).
    pub posts: Vec<PostView>,
    pub cursor: Option<String>,
}

/// One page of list members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMembersPage {
    /// Member DIDs.
    pub members: Vec<String>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
struct GetPostsResponse {
    #[serde(default)]
    posts: Vec<PostView>,
}

#[derive(Deserialize)]
struct FeedViewPost {
    post: PostView,
    #[serde(default)]
    reason: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct GetAuthorFeedResponse {
    #[serde(default)]
    feed: Vec<FeedViewPost>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct ListItemView {
    subject: ProfileViewBasic,
}

#[derive(Deserialize)]
struct GetListResponse {
    #[serde(default)]
    items: Vec<ListItemView>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

// =============================================================================
// Raw API
// =============================================================================

/// Raw upstream operations. Implementations do not retry; the gateway does.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Hydrate up to [`MAX_GET_POSTS`] posts. Missing posts are simply absent.
    async fn get_posts(&self, uris: &[String]) -> Result<Vec<PostView>>;

    async fn get_author_feed(
        &self,
        actor: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<AuthorFeedPage>;

    async fn get_list_members(
        &self,
        list_uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ListMembersPage>;

    /// Handle to DID.
    async fn resolve_handle(&self, handle: &str) -> Result<String>;

    /// DID to handle.
    async fn resolve_did(&self, did: &str) -> Result<String>;
}

/// `reqwest` client for the AppView XRPC endpoints.
pub struct XrpcClient {
    http: reqwest::Client,
    base_url: String,
}

impl XrpcClient {
    /// Create a client for `base_url` (e.g. [`DEFAULT_APPVIEW_URL`]).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("skyfeed/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, nsid: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/{}", self.base_url, nsid);

        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("{nsid}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "{nsid} returned HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl UpstreamApi for XrpcClient {
    async fn get_posts(&self, uris: &[String]) -> Result<Vec<PostView>> {
        if uris.is_empty() {
            return Ok(Vec::new());
        }
        if uris.len() > MAX_GET_POSTS {
            return Err(Error::Upstream(format!(
                "getPosts accepts at most {MAX_GET_POSTS} uris, got {}",
                uris.len()
            )));
        }

        let query: Vec<(&str, String)> = uris.iter().map(|u| ("uris", u.clone())).collect();
        let response: GetPostsResponse = self.get("app.bsky.feed.getPosts", &query).await?;
        Ok(response.posts)
    }

    async fn get_author_feed(
        &self,
        actor: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<AuthorFeedPage> {
        let mut query = vec![
            ("actor", actor.to_string()),
            ("limit", limit.clamp(1, MAX_PAGE_SIZE).to_string()),
            ("filter", "posts_no_replies".to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let response: GetAuthorFeedResponse =
            self.get("app.bsky.feed.getAuthorFeed", &query).await?;

        Ok(AuthorFeedPage {
            posts: response
                .feed
                .into_iter()
                .filter(|f| f.reason.is_none())
                .map(|f| f.post)
                .collect(),
            cursor: response.cursor,
        })
    }

    async fn get_list_members(
        &self,
        list_uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ListMembersPage> {
        let mut query = vec![
            ("list", list_uri.to_string()),
            ("limit", limit.clamp(1, MAX_PAGE_SIZE).to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let response: GetListResponse = self.get("app.bsky.graph.getList", &query).await?;

        Ok(ListMembersPage {
            members: response.items.into_iter().map(|i| i.subject.did).collect(),
            cursor: response.cursor,
        })
    }

    async fn resolve_handle(&self, handle: &str) -> Result<String> {
        let handle = handle.trim_start_matches('@');
        let response: ResolveHandleResponse = self
            .get(
                "com.atproto.identity.resolveHandle",
                &[("handle", handle.to_string())],
            )
            .await?;
        Ok(response.did)
    }

    async fn resolve_did(&self, did: &str) -> Result<String> {
        let profile: ProfileViewBasic = self
            .get("app.bsky.actor.getProfile", &[("actor", did.to_string())])
            .await?;
        Ok(profile.handle)
    }
}

// =============================================================================
// Gated client
// =============================================================================

/// Upstream access routed through the shared gateway.
#[derive(Clone)]
pub struct UpstreamClient {
    api: Arc<dyn UpstreamApi>,
    gateway: Arc<Gateway>,
}

impl UpstreamClient {
    pub fn new(api: Arc<dyn UpstreamApi>, gateway: Arc<Gateway>) -> Self {
        Self { api, gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn get_posts(&self, uris: &[String]) -> Result<Vec<PostView>> {
        self.gateway.call(|| self.api.get_posts(uris)).await
    }

    pub async fn get_author_feed(
        &self,
        actor: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<AuthorFeedPage> {
        self.gateway
            .call(|| self.api.get_author_feed(actor, limit, cursor))
            .await
    }

    pub async fn get_list_members(
        &self,
        list_uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ListMembersPage> {
        self.gateway
            .call(|| self.api.get_list_members(list_uri, limit, cursor))
            .await
    }

    pub async fn resolve_handle(&self, handle: &str) -> Result<String> {
        self.gateway.call(|| self.api.resolve_handle(handle)).await
    }

    pub async fn resolve_did(&self, did: &str) -> Result<String> {
        self.gateway.call(|| self.api.resolve_did(did)).await
    }

    /// Every member DID of a list, following cursors to the end.
    ///
    /// Any failed page fails the whole fetch, and so does running past
    /// `MAX_LIST_PAGES`, so callers never mistake a partial list for the
    /// full one.
    pub async fn fetch_all_list_members(&self, list_uri: &str) -> Result<BTreeSet<String>> {
        let mut members = BTreeSet::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let page = self
                .get_list_members(list_uri, MAX_PAGE_SIZE, cursor.as_deref())
                .await?;

            let empty = page.members.is_empty();
            members.extend(page.members);

            match page.cursor {
                Some(next) if !empty => cursor = Some(next),
                _ => return Ok(members),
            }
        }

        Err(Error::Upstream(format!(
            "list {list_uri} exceeds {MAX_LIST_PAGES} pages ({} members so far)",
            members.len()
        )))
    }

    /// Up to `limit` of an author's most recent posts, newest first.
    ///
    /// Stops after `MAX_HISTORY_PAGES` pages even if fewer posts were found,
    /// since repost-only pages still carry a cursor.
    pub async fn fetch_author_history(&self, actor: &str, limit: usize) -> Result<Vec<PostView>> {
        let mut posts = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_HISTORY_PAGES {
            if posts.len() >= limit {
                break;
            }

            let want = (limit - posts.len()).min(MAX_PAGE_SIZE as usize) as u32;
            let page = self.get_author_feed(actor, want, cursor.as_deref()).await?;

            let had_cursor = page.cursor.is_some();
            posts.extend(page.posts);
            cursor = page.cursor;

            if !had_cursor {
                break;
            }
        }

        posts.truncate(limit);
        Ok(posts)
    }
}
