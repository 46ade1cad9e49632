//! Stream sources.
//!
//! A source delivers typed [`StreamEvent`]s into a channel until it is
//! cancelled or the receiver goes away. Raw messages are validated here, at
//! the ingestion boundary; anything downstream only sees well-formed drafts.
//!
//! # Available Sources
//!
//! - [`JetstreamSource`] - Bluesky Jetstream websocket (live)

mod jetstream;

pub use jetstream::{
    DEFAULT_JETSTREAM_URL, JetstreamConfig, JetstreamSource, ParsedMessage, parse_message,
};

use async_trait::async_trait;
use skyfeed_core::ContentDraft;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// One event from the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A new post, validated into a draft.
    Create(ContentDraft),
    /// A post was deleted upstream.
    Delete { uri: String },
}

impl StreamEvent {
    pub fn uri(&self) -> &str {
        match self {
            Self::Create(draft) => &draft.uri,
            Self::Delete { uri } => uri,
        }
    }
}

/// A live source of stream events.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Human-readable name for this source (used in logs and metrics).
    fn name(&self) -> &'static str;

    /// Deliver events into `sender` until cancelled or the receiver closes.
    ///
    /// Reconnection is the source's own concern; it only returns on shutdown.
    async fn run(&self, sender: mpsc::Sender<StreamEvent>, cancel: CancellationToken) -> Result<()>;
}

/// Counters from a source run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Raw messages received.
    pub messages: u64,
    /// Events delivered downstream.
    pub events: u64,
    /// Messages rejected at the boundary.
    pub invalid: u64,
    pub reconnects: u64,
}
