//! Periodic task scheduling.
//!
//! A [`Ticker`] runs its task once immediately, then sleeps `interval` after
//! each run completes. Runs of the same ticker never overlap, and a slow run
//! simply delays the next one. Stopping cancels the sleep; a run already in
//! progress finishes first.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Non-overlapping periodic runner.
pub struct Ticker {
    name: String,
    interval: Duration,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    /// Create a ticker that also stops when `parent` is cancelled.
    pub fn new(name: impl Into<String>, interval: Duration, parent: &CancellationToken) -> Self {
        Self {
            name: name.into(),
            interval,
            cancel: parent.child_token(),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the loop. Returns false if this ticker was already started.
    pub fn start<F, Fut>(&self, mut task: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return false;
        }

        let cancel = self.cancel.clone();
        let interval = self.interval;
        let name = self.name.clone();

        *handle = Some(tokio::spawn(async move {
            tracing::debug!(ticker = %name, "Ticker started (interval {:?})", interval);

            while !cancel.is_cancelled() {
                task().await;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            tracing::debug!(ticker = %name, "Ticker stopped");
        }));

        true
    }

    /// Request the loop to stop after the current run.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(ticker = %self.name, "Ticker task failed: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
