//! Rate-limited, circuit-broken gateway for upstream API calls.
//!
//! Every outbound call to the AppView goes through [`Gateway::call`]. The
//! gateway applies, in order:
//!
//! 1. **Circuit breaker**: after `breaker_threshold` consecutive failures all
//!    calls are rejected with [`Error::CircuitOpen`] for `breaker_cooldown`.
//!    The first call after the cool-down resets the counter and goes through
//!    (half-open by timeout, not by probe).
//! 2. **Fixed-window rate limit**: at most `requests_per_window` attempts start
//!    per `window`; later callers sleep until the window rolls over.
//! 3. **Concurrency limit**: at most `max_concurrency` attempts in flight.
//! 4. **Retry with backoff**: a failed attempt sleeps
//!    `min(base_delay * 2^attempt, max_delay)` and retries until the retry
//!    budget is spent, then surfaces [`Error::RateLimitExceeded`].
//!
//! A success decrements the failure counter by one instead of clearing it, so
//! a single lucky call does not erase a burst of failures.
//!
//! One `Arc<Gateway>` is shared process-wide. Breaker state is the only
//! mutable state shared between classifiers; its lock is never held across
//! an await point.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::{Error, Result};

/// Configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Attempts allowed to start per window.
    pub requests_per_window: u32,
    /// Length of the rate-limit window.
    pub window: Duration,
    /// Maximum attempts in flight at once.
    pub max_concurrency: usize,
    /// Retries used by [`Gateway::call`].
    pub max_retries: u32,
    /// First backoff delay; doubled per attempt.
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
    /// Consecutive failures that open the breaker.
    pub breaker_threshold: u32,
    /// How long the breaker stays open.
    pub breaker_cooldown: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 10,
            window: Duration::from_secs(1),
            max_concurrency: 5,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
        }
    }
}

/// Snapshot of gateway counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub circuit_breaker_trips: u64,
    pub consecutive_failures: u32,
    pub circuit_open: bool,
}

struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

struct WindowState {
    started_at: Instant,
    used: u32,
}

/// Shared gateway wrapping every upstream call.
pub struct Gateway {
    config: GatewayConfig,
    permits: Semaphore,
    breaker: Mutex<BreakerState>,
    window: Mutex<WindowState>,
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    trips: AtomicU64,
}

impl Gateway {
    /// Create a new gateway with the given configuration.
    pub fn new(config: GatewayConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrency.max(1));
        Self {
            config,
            permits,
            breaker: Mutex::new(BreakerState {
                consecutive_failures: 0,
                open_until: None,
            }),
            window: Mutex::new(WindowState {
                started_at: Instant::now(),
                used: 0,
            }),
            total_requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Run `op` with the default retry budget.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_with_retries(op, self.config.max_retries).await
    }

    /// Run `op`, retrying up to `retries_remaining` times.
    ///
    /// `op` is invoked once per attempt and must build a fresh future each time.
    pub async fn call_with_retries<T, F, Fut>(&self, mut op: F, retries_remaining: u32) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut remaining = retries_remaining;
        let mut attempt: u32 = 0;

        loop {
            self.check_circuit()?;
            self.acquire_window_slot().await;

            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| Error::Upstream("gateway closed".to_string()))?;

            // The breaker may have opened while we were queued.
            self.check_circuit()?;

            self.total_requests.fetch_add(1, Ordering::Relaxed);
            counter!("upstream_requests_total").increment(1);

            let result = op().await;
            drop(permit);

            match result {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    self.record_failure();

                    if remaining == 0 {
                        counter!("upstream_retries_exhausted_total").increment(1);
                        return Err(Error::RateLimitExceeded {
                            attempts: attempt + 1,
                            last_error: e.to_string(),
                        });
                    }

                    let delay = self.backoff_delay(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        retries_left = remaining,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "upstream call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;

                    remaining -= 1;
                    attempt += 1;
                }
            }
        }
    }

    /// Current counter snapshot.
    pub fn stats(&self) -> GatewayStats {
        let breaker = self.breaker.lock();
        GatewayStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            circuit_breaker_trips: self.trips.load(Ordering::Relaxed),
            consecutive_failures: breaker.consecutive_failures,
            circuit_open: breaker
                .open_until
                .is_some_and(|until| Instant::now() < until),
        }
    }

    /// Backoff before retry number `attempt + 1`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    /// Reject if the breaker is open; close it if the cool-down has passed.
    fn check_circuit(&self) -> Result<()> {
        let mut breaker = self.breaker.lock();

        if let Some(until) = breaker.open_until {
            let now = Instant::now();
            if now < until {
                counter!("upstream_circuit_rejections_total").increment(1);
                return Err(Error::CircuitOpen {
                    retry_after: until - now,
                });
            }

            breaker.open_until = None;
            breaker.consecutive_failures = 0;
            gauge!("upstream_consecutive_failures").set(0.0);
            tracing::info!("Circuit breaker cool-down elapsed, allowing traffic");
        }

        Ok(())
    }

    /// Wait until the current window has room for one more attempt.
    async fn acquire_window_slot(&self) {
        let started = Instant::now();

        loop {
            let wait = {
                let mut window = self.window.lock();
                let now = Instant::now();

                if now.duration_since(window.started_at) >= self.config.window {
                    window.started_at = now;
                    window.used = 0;
                }

                if window.used < self.config.requests_per_window {
                    window.used += 1;
                    None
                } else {
                    Some((window.started_at + self.config.window).saturating_duration_since(now))
                }
            };

            match wait {
                None => break,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }

        let waited = started.elapsed();
        if !waited.is_zero() {
            histogram!("upstream_wait_seconds").record(waited.as_secs_f64());
        }
    }

    fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        counter!("upstream_successes_total").increment(1);

        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_sub(1);
        gauge!("upstream_consecutive_failures").set(breaker.consecutive_failures as f64);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        counter!("upstream_failures_total").increment(1);

        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures += 1;
        gauge!("upstream_consecutive_failures").set(breaker.consecutive_failures as f64);

        if breaker.open_until.is_none()
            && breaker.consecutive_failures >= self.config.breaker_threshold
        {
            breaker.open_until = Some(Instant::now() + self.config.breaker_cooldown);
            self.trips.fetch_add(1, Ordering::Relaxed);
            counter!("upstream_circuit_trips_total").increment(1);
            tracing::warn!(
                "Circuit breaker opened after {} consecutive failures, cooling down for {:?}",
                breaker.consecutive_failures,
                self.config.breaker_cooldown
            );
        }
    }
}
