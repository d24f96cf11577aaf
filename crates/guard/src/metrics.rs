//! Pipeline-level metrics.
//!
//! Counters for the decision pipeline as a whole. Tier-specific counters
//! live with their components ([`TierCache`](crate::cache::TierCache),
//! [`RateLimiter`](crate::ratelimit::RateLimiter),
//! [`CircuitBreaker`](crate::breaker::CircuitBreaker)); this module covers
//! what only the orchestrator sees.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracked by the Gatekeeper.
#[derive(Debug, Default)]
pub struct GateMetrics {
    total_requests: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    authority_calls: AtomicU64,
    authority_failures: AtomicU64,
    stale_served: AtomicU64,
}

/// Snapshot of Gatekeeper metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateMetricsSnapshot {
    /// Total authenticate calls.
    pub total_requests: u64,
    /// Decisions that allowed the request.
    pub allowed: u64,
    /// Decisions that denied the request.
    pub denied: u64,
    /// Calls made to the authoritative verifier.
    pub authority_calls: u64,
    /// Authoritative calls that failed at the transport level (including
    /// timeouts).
    pub authority_failures: u64,
    /// Requests served from stale cache while the authority was
    /// unreachable.
    pub stale_served: u64,
}

impl GateMetrics {
    pub(crate) fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_authority_call(&self) {
        self.authority_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_authority_failure(&self) {
        self.authority_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> GateMetricsSnapshot {
        GateMetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            authority_calls: self.authority_calls.load(Ordering::Relaxed),
            authority_failures: self.authority_failures.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = GateMetrics::default();
        metrics.record_request();
        metrics.record_request();
        metrics.record_allowed();
        metrics.record_denied();
        metrics.record_authority_call();
        metrics.record_authority_failure();
        metrics.record_stale_served();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.allowed, 1);
        assert_eq!(snap.denied, 1);
        assert_eq!(snap.authority_calls, 1);
        assert_eq!(snap.authority_failures, 1);
        assert_eq!(snap.stale_served, 1);
    }
}
