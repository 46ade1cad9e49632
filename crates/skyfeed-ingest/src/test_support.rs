//! Test doubles shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use skyfeed_core::ContentItem;

use crate::classifier::FeedClassifier;
use crate::upstream::{
    AuthorFeedPage, Label, ListMembersPage, PostView, ProfileViewBasic, UpstreamApi,
};
use crate::{Error, Result};

/// Build a post view the way the AppView returns it.
pub fn post_view(uri: &str, author: &str, text: &str, labels: &[&str]) -> PostView {
    PostView {
        uri: uri.to_string(),
        cid: "bafytest".to_string(),
        author: ProfileViewBasic {
            did: author.to_string(),
            handle: format!("{}.test", author.trim_start_matches("did:plc:")),
        },
        record: json!({
            "$type": "app.bsky.feed.post",
            "text": text,
            "createdAt": "2024-01-01T00:00:00Z",
        }),
        indexed_at: None,
        labels: labels
            .iter()
            .map(|val| Label {
                val: val.to_string(),
                src: None,
                neg: false,
            })
            .collect(),
    }
}

#[derive(Default)]
struct MockState {
    lists: HashMap<String, Vec<String>>,
    failing_lists: HashSet<String>,
    list_calls: HashMap<String, usize>,
    author_feeds: HashMap<String, Vec<PostView>>,
    author_feed_calls: usize,
    failing_authors: HashSet<String>,
    endless_authors: HashSet<String>,
    posts: HashMap<String, PostView>,
    poisoned_uris: HashSet<String>,
    get_posts_calls: usize,
    handles: HashMap<String, String>,
}

/// In-memory upstream with scriptable failures.
#[derive(Default)]
pub struct MockUpstream {
    state: Mutex<MockState>,
}

fn paginate<T: Clone>(all: &[T], limit: u32, cursor: Option<&str>) -> (Vec<T>, Option<String>) {
    let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
    let end = (start + limit as usize).min(all.len());
    let page = all.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
    let next = (end < all.len()).then(|| end.to_string());
    (page, next)
}

impl MockUpstream {
    pub fn set_list(&self, list_uri: &str, members: Vec<String>) {
        self.state.lock().lists.insert(list_uri.to_string(), members);
    }

    pub fn fail_list(&self, list_uri: &str) {
        self.state.lock().failing_lists.insert(list_uri.to_string());
    }

    pub fn heal_list(&self, list_uri: &str) {
        self.state.lock().failing_lists.remove(list_uri);
    }

    pub fn list_calls(&self, list_uri: &str) -> usize {
        self.state.lock().list_calls.get(list_uri).copied().unwrap_or(0)
    }

    pub fn set_author_feed(&self, did: &str, posts: Vec<PostView>) {
        self.state.lock().author_feeds.insert(did.to_string(), posts);
    }

    pub fn fail_author_feed(&self, did: &str) {
        self.state.lock().failing_authors.insert(did.to_string());
    }

    pub fn heal_author_feed(&self, did: &str) {
        self.state.lock().failing_authors.remove(did);
    }

    /// Every page of this author's feed is empty but carries a cursor.
    pub fn set_endless_author_feed(&self, did: &str) {
        self.state.lock().endless_authors.insert(did.to_string());
    }

    pub fn author_feed_calls(&self) -> usize {
        self.state.lock().author_feed_calls
    }

    pub fn add_post(&self, post: PostView) {
        self.state.lock().posts.insert(post.uri.clone(), post);
    }

    /// Any `get_posts` call that includes `uri` fails.
    pub fn poison_post(&self, uri: &str) {
        self.state.lock().poisoned_uris.insert(uri.to_string());
    }

    pub fn heal_posts(&self) {
        self.state.lock().poisoned_uris.clear();
    }

    pub fn get_posts_calls(&self) -> usize {
        self.state.lock().get_posts_calls
    }

    pub fn set_handle(&self, handle: &str, did: &str) {
        self.state
            .lock()
            .handles
            .insert(handle.to_string(), did.to_string());
    }
}

#[async_trait]
impl UpstreamApi for MockUpstream {
    async fn get_posts(&self, uris: &[String]) -> Result<Vec<PostView>> {
        let mut state = self.state.lock();
        state.get_posts_calls += 1;

        if uris.iter().any(|u| state.poisoned_uris.contains(u)) {
            return Err(Error::Upstream("HTTP 502".to_string()));
        }
        Ok(uris.iter().filter_map(|u| state.posts.get(u).cloned()).collect())
    }

    async fn get_author_feed(
        &self,
        actor: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<AuthorFeedPage> {
        let mut state = self.state.lock();
        state.author_feed_calls += 1;

        if state.failing_authors.contains(actor) {
            return Err(Error::Upstream("HTTP 500".to_string()));
        }
        if state.endless_authors.contains(actor) {
            let next = cursor.map_or(1, |c| c.parse::<usize>().unwrap_or(0) + 1);
            return Ok(AuthorFeedPage {
                posts: Vec::new(),
                cursor: Some(next.to_string()),
            });
        }

        let all = state.author_feeds.get(actor).cloned().unwrap_or_default();
        let (posts, cursor) = paginate(&all, limit, cursor);
        Ok(AuthorFeedPage { posts, cursor })
    }

    async fn get_list_members(
        &self,
        list_uri: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ListMembersPage> {
        let mut state = self.state.lock();
        *state.list_calls.entry(list_uri.to_string()).or_default() += 1;

        if state.failing_lists.contains(list_uri) {
            return Err(Error::Upstream("HTTP 503".to_string()));
        }
        let all = state.lists.get(list_uri).cloned().unwrap_or_default();
        let (members, cursor) = paginate(&all, limit, cursor);
        Ok(ListMembersPage { members, cursor })
    }

    async fn resolve_handle(&self, handle: &str) -> Result<String> {
        self.state
            .lock()
            .handles
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::Upstream(format!("handle not found: {handle}")))
    }

    async fn resolve_did(&self, did: &str) -> Result<String> {
        self.state
            .lock()
            .handles
            .iter()
            .find(|(_, d)| d.as_str() == did)
            .map(|(h, _)| h.clone())
            .ok_or_else(|| Error::Upstream(format!("profile not found: {did}")))
    }
}

/// Classifier with a fixed verdict, for coordinator tests.
pub struct StaticClassifier {
    name: String,
    verdict: Result<bool>,
    pub calls: AtomicUsize,
}

impl StaticClassifier {
    pub fn accepting(name: &str) -> Self {
        Self::with_verdict(name, Ok(true))
    }

    pub fn rejecting(name: &str) -> Self {
        Self::with_verdict(name, Ok(false))
    }

    pub fn failing(name: &str) -> Self {
        Self::with_verdict(
            name,
            Err(Error::Classifier {
                feed: name.to_string(),
                reason: "boom".to_string(),
            }),
        )
    }

    fn with_verdict(name: &str, verdict: Result<bool>) -> Self {
        Self {
            name: name.to_string(),
            verdict,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl FeedClassifier for StaticClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<bool> {
        Ok(true)
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn wait_ready(&self) {}

    async fn filter_accepts(&self, _item: &ContentItem) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.verdict {
            Ok(accept) => Ok(*accept),
            Err(e) => Err(Error::Classifier {
                feed: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn close(&self) {}
}
