//! Stream health tracking.
//!
//! The tracker records when the stream connection opened and when the last
//! event arrived. A periodic monitor turns that into gauges and log lines.
//! It never reconnects anything itself; reconnection belongs to the stream
//! source.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::gauge;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ticker::Ticker;

/// Thresholds for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    /// Idle time that triggers a warning.
    pub warn_after: Duration,
    /// Idle time that triggers an error.
    pub critical_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            warn_after: Duration::from_secs(5 * 60),
            critical_after: Duration::from_secs(20 * 60),
        }
    }
}

/// Result of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning { idle: Duration },
    Critical { idle: Duration },
}

#[derive(Default)]
struct Timestamps {
    created: Option<Instant>,
    last_event: Option<Instant>,
    connected_at: Option<Instant>,
}

/// Shared record of stream liveness.
pub struct HealthTracker {
    times: Mutex<Timestamps>,
    events: AtomicU64,
    connections: AtomicU64,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            times: Mutex::new(Timestamps {
                created: Some(Instant::now()),
                ..Default::default()
            }),
            events: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        }
    }

    pub fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
        self.times.lock().last_event = Some(Instant::now());
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.times.lock().connected_at = Some(Instant::now());
        gauge!("ingest_connected").set(1.0);
    }

    pub fn connection_closed(&self) {
        self.times.lock().connected_at = None;
        gauge!("ingest_connected").set(0.0);
    }

    pub fn events_seen(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn connections_opened(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Time since the last event, or since startup if none arrived yet.
    pub fn idle_for(&self) -> Duration {
        let times = self.times.lock();
        times
            .last_event
            .or(times.created)
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Age of the current connection, if connected.
    pub fn connection_age(&self) -> Option<Duration> {
        self.times.lock().connected_at.map(|at| at.elapsed())
    }

    pub fn check(&self, config: &HealthConfig) -> HealthStatus {
        let idle = self.idle_for();
        if idle >= config.critical_after {
            HealthStatus::Critical { idle }
        } else if idle >= config.warn_after {
            HealthStatus::Warning { idle }
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Start the periodic health check. Stops when `cancel` is cancelled.
pub fn spawn_monitor(
    tracker: Arc<HealthTracker>,
    config: HealthConfig,
    cancel: &CancellationToken,
) -> Ticker {
    let ticker = Ticker::new("health", config.check_interval, cancel);

    ticker.start(move || {
        let tracker = Arc::clone(&tracker);
        let config = config.clone();
        async move {
            report(&tracker, &config);
        }
    });

    ticker
}

fn report(tracker: &HealthTracker, config: &HealthConfig) {
    let idle = tracker.idle_for();
    let age = tracker.connection_age();

    gauge!("ingest_seconds_since_last_event").set(idle.as_secs_f64());
    gauge!("ingest_connection_age_seconds").set(age.map(|a| a.as_secs_f64()).unwrap_or(0.0));

    match tracker.check(config) {
        HealthStatus::Healthy => {
            tracing::debug!(
                events = tracker.events_seen(),
                "Stream healthy (last event {:?} ago)",
                idle
            );
        }
        HealthStatus::Warning { idle } => {
            tracing::warn!(
                connected_for = ?age,
                "No stream events for {:?}",
                idle
            );
        }
        HealthStatus::Critical { idle } => {
            tracing::error!(
                connected_for = ?age,
                connections = tracker.connections_opened(),
                "No stream events for {:?}; the stream looks stalled",
                idle
            );
        }
    }
}
