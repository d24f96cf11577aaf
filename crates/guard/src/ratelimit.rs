//! Per-principal fixed-window rate limiting.
//!
//! Guards the verification path from abuse: each principal gets a counter
//! in the shared backend that opens a window on its first increment and
//! resets when the window's TTL elapses
//! ([`KvBackend::increment_with_expiry`]).
//!
//! # Fail-open
//!
//! On any backend error the limiter allows the request: availability of the
//! rest of the pipeline takes priority over strict quota enforcement. Every
//! fail-open event is counted and logged so quotas can be tightened later.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use modhub_storage::KvBackend;

/// Default window length (1 minute).
pub const DEFAULT_WINDOW: std::time::Duration = std::time::Duration::from_secs(60);

/// Default number of requests allowed per window.
pub const DEFAULT_MAX_REQUESTS: u64 = 100;

/// Key prefix for rate-limit counters in the shared backend.
const RATE_KEY_PREFIX: &str = "rate:";

/// Configuration for the fixed-window rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Window length.
    window: std::time::Duration,
    /// Requests allowed per window per principal.
    max_requests: u64,
}

impl RateLimitConfig {
    /// Creates a new rate limit configuration.
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero or `max_requests` is zero.
    #[must_use]
    pub fn new(window: std::time::Duration, max_requests: u64) -> Self {
        assert!(!window.is_zero(), "window must be positive");
        assert!(max_requests >= 1, "max_requests must be at least 1");
        Self { window, max_requests }
    }

    /// Returns the window length.
    #[must_use]
    pub fn window(&self) -> std::time::Duration {
        self.window
    }

    /// Returns the per-window request allowance.
    #[must_use]
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { window: DEFAULT_WINDOW, max_requests: DEFAULT_MAX_REQUESTS }
    }
}

/// The outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// The principal's count within the current window (0 when the check
    /// failed open).
    pub count: u64,
    /// Upper bound on when the current window resets.
    pub reset_at: DateTime<Utc>,
}

/// Metrics tracked by the rate limiter.
#[derive(Debug, Default)]
struct RateLimitCounters {
    allowed: AtomicU64,
    rejected: AtomicU64,
    fail_open: AtomicU64,
}

/// Snapshot of rate limiter metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitMetricsSnapshot {
    /// Total requests that were allowed through.
    pub allowed: u64,
    /// Total requests that were rejected.
    pub rejected: u64,
    /// Total checks that failed open due to backend errors.
    pub fail_open: u64,
}

/// Fixed-window rate limiter over a shared backend.
pub struct RateLimiter {
    backend: Arc<dyn KvBackend>,
    config: RateLimitConfig,
    counters: RateLimitCounters,
}

impl RateLimiter {
    /// Creates a limiter over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>, config: RateLimitConfig) -> Self {
        Self { backend, config, counters: RateLimitCounters::default() }
    }

    /// Checks and consumes one request from the principal's window.
    ///
    /// Infallible by design: backend errors fail open with a metric and a
    /// warning rather than propagating.
    #[tracing::instrument(skip(self))]
    pub async fn check(&self, principal: &str) -> RateDecision {
        let key = format!("{RATE_KEY_PREFIX}{principal}");

        match self.backend.increment_with_expiry(key.as_bytes(), self.config.window).await {
            Ok(count) => {
                let allowed = count <= self.config.max_requests;
                let reset_at = Utc::now()
                    + chrono::Duration::from_std(self.config.window)
                        .unwrap_or_else(|_| chrono::Duration::minutes(1));

                if allowed {
                    self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        count,
                        max_requests = self.config.max_requests,
                        "rate limit exceeded"
                    );
                }

                RateDecision { allowed, count, reset_at }
            },
            Err(err) => {
                // Fail open: quota enforcement is best-effort, the pipeline
                // is not.
                self.counters.fail_open.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "rate limit backend error, failing open");
                let reset_at = Utc::now()
                    + chrono::Duration::from_std(self.config.window)
                        .unwrap_or_else(|_| chrono::Duration::minutes(1));
                RateDecision { allowed: true, count: 0, reset_at }
            },
        }
    }

    /// Returns a snapshot of the rate limiter metrics.
    #[must_use]
    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            fail_open: self.counters.fail_open.load(Ordering::Relaxed),
        }
    }
}
