//! Bluesky Jetstream websocket source.
//!
//! Subscribes with `wantedCollections=app.bsky.feed.post` and turns commit
//! messages into [`StreamEvent`]s. On disconnect it reconnects with capped
//! exponential backoff and resumes from the last seen `time_us`, rewound a
//! few seconds so nothing is skipped. Replayed creates are harmless because
//! storage upserts by URI.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use skyfeed_core::POST_COLLECTION;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::{SourceStats, StreamEvent, StreamSource};
use crate::health::HealthTracker;
use crate::record;
use crate::Result;

/// Default public Jetstream instance.
pub const DEFAULT_JETSTREAM_URL: &str = "wss://jetstream2.us-east.bsky.network/subscribe";

/// Configuration for the Jetstream source.
#[derive(Debug, Clone)]
pub struct JetstreamConfig {
    /// Subscribe endpoint, without query string.
    pub url: String,
    pub wanted_collections: Vec<String>,
    /// First reconnect delay; doubled up to `max_backoff`.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How far to rewind the cursor on reconnect.
    pub cursor_rewind: Duration,
    /// Start from this `time_us` instead of live.
    pub start_cursor: Option<i64>,
}

impl Default for JetstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_JETSTREAM_URL.to_string(),
            wanted_collections: vec![POST_COLLECTION.to_string()],
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            cursor_rewind: Duration::from_secs(5),
            start_cursor: None,
        }
    }
}

#[derive(Deserialize)]
struct JetstreamMessage {
    did: String,
    time_us: i64,
    kind: String,
    #[serde(default)]
    commit: Option<JetstreamCommit>,
}

#[derive(Deserialize)]
struct JetstreamCommit {
    operation: String,
    collection: String,
    rkey: String,
    #[serde(default)]
    record: Option<Value>,
}

/// A decoded Jetstream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub time_us: i64,
    /// `None` for messages this pipeline does not act on.
    pub event: Option<StreamEvent>,
}

/// Decode and validate one Jetstream text frame.
pub fn parse_message(text: &str) -> Result<ParsedMessage> {
    let message: JetstreamMessage = serde_json::from_str(text)?;
    let time_us = message.time_us;

    let commit = match (message.kind.as_str(), message.commit) {
        ("commit", Some(commit)) if commit.collection == POST_COLLECTION => commit,
        _ => return Ok(ParsedMessage { time_us, event: None }),
    };

    let uri = record::post_uri(&message.did, &commit.rkey);
    let event = match commit.operation.as_str() {
        "create" => {
            let Some(raw) = commit.record else {
                return Err(skyfeed_core::Error::InvalidRecord {
                    field: "record",
                    reason: format!("create without record: {uri}"),
                }
                .into());
            };
            Some(StreamEvent::Create(record::draft_from_value(
                &raw,
                uri,
                message.did,
            )?))
        }
        "delete" => Some(StreamEvent::Delete { uri }),
        _ => None,
    };

    Ok(ParsedMessage { time_us, event })
}

/// Why a single connection ended.
enum ConnectionEnd {
    Cancelled,
    ReceiverClosed,
    Closed,
}

#[derive(Default)]
struct Counters {
    messages: AtomicU64,
    events: AtomicU64,
    invalid: AtomicU64,
    reconnects: AtomicU64,
}

/// Jetstream consumer.
pub struct JetstreamSource {
    config: JetstreamConfig,
    health: Arc<HealthTracker>,
    last_time_us: AtomicI64,
    counters: Counters,
}

impl JetstreamSource {
    pub fn new(config: JetstreamConfig, health: Arc<HealthTracker>) -> Self {
        let start = config.start_cursor.unwrap_or(0);
        Self {
            config,
            health,
            last_time_us: AtomicI64::new(start),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &JetstreamConfig {
        &self.config
    }

    /// Last `time_us` seen, if any.
    pub fn cursor(&self) -> Option<i64> {
        let cursor = self.last_time_us.load(Ordering::Relaxed);
        (cursor > 0).then_some(cursor)
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            messages: self.counters.messages.load(Ordering::Relaxed),
            events: self.counters.events.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Subscribe URL, including the rewound resume cursor when one is known.
    pub fn subscribe_url(&self) -> String {
        let mut url = self.config.url.clone();
        let mut separator = if url.contains('?') { '&' } else { '?' };

        for collection in &self.config.wanted_collections {
            url.push(separator);
            url.push_str("wantedCollections=");
            url.push_str(collection);
            separator = '&';
        }

        if let Some(cursor) = self.cursor() {
            let rewind = self.config.cursor_rewind.as_micros() as i64;
            url.push(separator);
            url.push_str(&format!("cursor={}", (cursor - rewind).max(0)));
        }

        url
    }

    async fn run_connection(
        &self,
        sender: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<(ConnectionEnd, bool)> {
        let url = self.subscribe_url();
        tracing::info!("Connecting to Jetstream: {}", url);

        let (mut ws, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok((ConnectionEnd::Cancelled, false)),
            connected = tokio_tungstenite::connect_async(url.as_str()) => connected?,
        };

        self.health.connection_opened();
        let mut received_any = false;

        let end = loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    break ConnectionEnd::Cancelled;
                }
                message = ws.next() => message,
            };

            let text = match message {
                None => break ConnectionEnd::Closed,
                Some(Err(e)) => {
                    self.health.connection_closed();
                    return Err(e.into());
                }
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("Jetstream closed the connection: {:?}", frame);
                    break ConnectionEnd::Closed;
                }
                Some(Ok(_)) => continue,
            };

            received_any = true;
            self.counters.messages.fetch_add(1, Ordering::Relaxed);

            let parsed = match parse_message(&text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.counters.invalid.fetch_add(1, Ordering::Relaxed);
                    counter!("ingest_events_invalid_total").increment(1);
                    tracing::debug!("Skipping invalid Jetstream message: {}", e);
                    continue;
                }
            };

            self.last_time_us.fetch_max(parsed.time_us, Ordering::Relaxed);

            if let Some(event) = parsed.event {
                self.health.record_event();
                self.counters.events.fetch_add(1, Ordering::Relaxed);
                counter!("ingest_events_total").increment(1);

                if sender.send(event).await.is_err() {
                    break ConnectionEnd::ReceiverClosed;
                }
            }
        };

        self.health.connection_closed();
        Ok((end, received_any))
    }
}

#[async_trait]
impl StreamSource for JetstreamSource {
    fn name(&self) -> &'static str {
        "jetstream"
    }

    async fn run(
        &self,
        sender: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut backoff = self.config.initial_backoff;

        loop {
            match self.run_connection(&sender, &cancel).await {
                Ok((ConnectionEnd::Cancelled, _)) => break,
                Ok((ConnectionEnd::ReceiverClosed, _)) => {
                    tracing::info!("Event receiver closed, stopping Jetstream source");
                    break;
                }
                Ok((ConnectionEnd::Closed, received_any)) => {
                    if received_any {
                        backoff = self.config.initial_backoff;
                    }
                }
                Err(e) => {
                    tracing::warn!("Jetstream connection failed: {}", e);
                }
            }

            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            counter!("ingest_reconnects_total").increment(1);
            tracing::info!("Reconnecting to Jetstream in {:?}", backoff);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }

        let stats = self.stats();
        tracing::info!(
            messages = stats.messages,
            events = stats.events,
            invalid = stats.invalid,
            reconnects = stats.reconnects,
            "Jetstream source stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use futures::SinkExt;
    use serde_json::json;

    fn create_frame(did: &str, rkey: &str, time_us: i64, text: &str) -> String {
        json!({
            "did": did,
            "time_us": time_us,
            "kind": "commit",
            "commit": {
                "rev": "3l3qo2vuowo2b",
                "operation": "create",
                "collection": "app.bsky.feed.post",
                "rkey": rkey,
                "record": {
                    "$type": "app.bsky.feed.post",
                    "text": text,
                    "createdAt": "2024-09-09T19:46:02.102Z"
                },
                "cid": "bafyreidwaivazkwu67xztlmuobx35hs2lnfh3kolmgfmucldvhd3sgzcqi"
            }
        })
        .to_string()
    }

    #[test]
    fn test_parse_create() {
        let frame = create_frame("did:plc:alice", "3kabc", 1_725_911_162_329_308, "hello rust");
        let parsed = parse_message(&frame).unwrap();
        assert_eq!(parsed.time_us, 1_725_911_162_329_308);

        match parsed.event {
            Some(StreamEvent::Create(draft)) => {
                assert_eq!(draft.uri, "at://did:plc:alice/app.bsky.feed.post/3kabc");
                assert_eq!(draft.author, "did:plc:alice");
                assert_eq!(draft.text, "hello rust");
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_delete() {
        let frame = json!({
            "did": "did:plc:alice",
            "time_us": 10,
            "kind": "commit",
            "commit": {"operation": "delete", "collection": "app.bsky.feed.post", "rkey": "3kabc"}
        })
        .to_string();

        let parsed = parse_message(&frame).unwrap();
        assert_eq!(
            parsed.event,
            Some(StreamEvent::Delete {
                uri: "at://did:plc:alice/app.bsky.feed.post/3kabc".to_string()
            })
        );
    }

    #[test]
    fn test_parse_ignores_other_messages() {
        let identity = json!({
            "did": "did:plc:alice",
            "time_us": 11,
            "kind": "identity",
            "identity": {"did": "did:plc:alice", "handle": "alice.test"}
        })
        .to_string();
        let like = json!({
            "did": "did:plc:alice",
            "time_us": 12,
            "kind": "commit",
            "commit": {
                "operation": "create",
                "collection": "app.bsky.feed.like",
                "rkey": "x",
                "record": {}
            }
        })
        .to_string();

        assert_eq!(parse_message(&identity).unwrap().event, None);
        let parsed = parse_message(&like).unwrap();
        assert_eq!(parsed.event, None);
        assert_eq!(parsed.time_us, 12);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_message("not json").is_err());
        assert!(parse_message(r#"{"did": "did:plc:a"}"#).is_err());

        let no_record = json!({
            "did": "did:plc:alice",
            "time_us": 13,
            "kind": "commit",
            "commit": {"operation": "create", "collection": "app.bsky.feed.post", "rkey": "x"}
        })
        .to_string();
        assert!(matches!(parse_message(&no_record), Err(Error::Core(_))));

        let bad_record = json!({
            "did": "did:plc:alice",
            "time_us": 14,
            "kind": "commit",
            "commit": {
                "operation": "create",
                "collection": "app.bsky.feed.post",
                "rkey": "x",
                "record": {"text": "no date"}
            }
        })
        .to_string();
        assert!(parse_message(&bad_record).is_err());
    }

    #[test]
    fn test_subscribe_url_with_rewound_cursor() {
        let source = JetstreamSource::new(
            JetstreamConfig {
                url: "wss://example.test/subscribe".to_string(),
                ..Default::default()
            },
            Arc::new(HealthTracker::new()),
        );
        assert_eq!(
            source.subscribe_url(),
            "wss://example.test/subscribe?wantedCollections=app.bsky.feed.post"
        );

        source.last_time_us.store(10_000_000, Ordering::Relaxed);
        assert_eq!(
            source.subscribe_url(),
            "wss://example.test/subscribe?wantedCollections=app.bsky.feed.post&cursor=5000000"
        );
    }

    #[tokio::test]
    async fn test_streams_events_from_websocket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(create_frame("did:plc:a", "1", 100, "one")))
                .await
                .unwrap();
            ws.send(Message::Text("garbage".to_string())).await.unwrap();
            ws.send(Message::Text(create_frame("did:plc:a", "2", 200, "two")))
                .await
                .unwrap();
            // Keep the connection open until the client goes away
            while ws.next().await.is_some() {}
        });

        let health = Arc::new(HealthTracker::new());
        let source = Arc::new(JetstreamSource::new(
            JetstreamConfig {
                url: format!("ws://{addr}/subscribe"),
                ..Default::default()
            },
            Arc::clone(&health),
        ));
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let handle = {
            let source = Arc::clone(&source);
            let cancel = cancel.clone();
            tokio::spawn(async move { source.run(tx, cancel).await })
        };

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.uri(), "at://did:plc:a/app.bsky.feed.post/1");
        assert_eq!(second.uri(), "at://did:plc:a/app.bsky.feed.post/2");

        cancel.cancel();
        handle.await.unwrap().unwrap();

        let stats = source.stats();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.invalid, 1);
        assert_eq!(source.cursor(), Some(200));
        assert_eq!(health.events_seen(), 2);
        assert_eq!(health.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_stops_when_receiver_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(create_frame("did:plc:a", "1", 100, "one")))
                .await
                .unwrap();
            while ws.next().await.is_some() {}
        });

        let source = JetstreamSource::new(
            JetstreamConfig {
                url: format!("ws://{addr}/subscribe"),
                ..Default::default()
            },
            Arc::new(HealthTracker::new()),
        );
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        // Returns on its own, without cancellation and without reconnecting
        tokio::time::timeout(Duration::from_secs(5), source.run(tx, CancellationToken::new()))
            .await
            .expect("source should stop once the receiver is gone")
            .unwrap();
        assert_eq!(source.stats().reconnects, 0);
        assert_eq!(source.stats().events, 1);
    }
}
