//! Health check types for storage backends.
//!
//! This module provides the [`HealthStatus`] enum and [`HealthMetadata`]
//! struct returned by [`KvBackend::health_check`](crate::KvBackend::health_check).
//! These types let backends report granular health beyond a binary signal.
//!
//! # Probe Types
//!
//! Kubernetes (and similar orchestrators) distinguish three health signals:
//!
//! - **Liveness** — process is alive and not deadlocked. Failure triggers a container restart.
//! - **Readiness** — backend can serve traffic. Failure removes the pod from the load balancer.
//! - **Startup** — initial warm-up is complete. Failure prevents traffic until ready.
//!
//! # Health States
//!
//! - **Healthy**: the backend is fully operational.
//! - **Degraded**: the backend can serve traffic with reduced capability (e.g. stale-cache fallback
//!   in use, elevated latency).
//! - **Unhealthy**: the backend cannot serve traffic reliably.

use std::{collections::HashMap, fmt, time::Duration};

/// The type of health probe to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthProbe {
    /// Process is alive and not deadlocked.
    Liveness,
    /// Backend can serve traffic (connection healthy, caches warm).
    Readiness,
    /// Initial warm-up is complete (first connection established).
    Startup,
}

impl fmt::Display for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Liveness => write!(f, "liveness"),
            Self::Readiness => write!(f, "readiness"),
            Self::Startup => write!(f, "startup"),
        }
    }
}

/// Health status returned by [`KvBackend::health_check`](crate::KvBackend::health_check).
///
/// Each variant carries [`HealthMetadata`] with timing and backend-specific
/// details.
#[derive(Debug, Clone)]
pub enum HealthStatus {
    /// Backend is fully operational.
    Healthy(HealthMetadata),
    /// Backend is operational but with reduced capability.
    ///
    /// The `String` describes the degradation reason.
    Degraded(HealthMetadata, String),
    /// Backend cannot serve traffic reliably.
    ///
    /// The `String` describes the failure reason.
    Unhealthy(HealthMetadata, String),
}

impl HealthStatus {
    /// Creates a `Healthy` status.
    #[must_use = "creating a status has no side effects"]
    pub fn healthy(metadata: HealthMetadata) -> Self {
        Self::Healthy(metadata)
    }

    /// Creates a `Degraded` status with a reason.
    #[must_use = "creating a status has no side effects"]
    pub fn degraded(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Degraded(metadata, reason.into())
    }

    /// Creates an `Unhealthy` status with a reason.
    #[must_use = "creating a status has no side effects"]
    pub fn unhealthy(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Unhealthy(metadata, reason.into())
    }

    /// Returns `true` if the backend is fully healthy.
    #[must_use = "health status predicates should be checked"]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy(_))
    }

    /// Returns `true` if the backend is degraded.
    #[must_use = "health status predicates should be checked"]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(..))
    }

    /// Returns `true` if the backend is unhealthy.
    #[must_use = "health status predicates should be checked"]
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(..))
    }

    /// Returns the metadata associated with this health status.
    #[must_use = "returns metadata by reference without side effects"]
    pub fn metadata(&self) -> &HealthMetadata {
        match self {
            Self::Healthy(m) | Self::Degraded(m, _) | Self::Unhealthy(m, _) => m,
        }
    }

    /// Returns the degradation or failure reason, if any.
    #[must_use = "returns the reason without side effects"]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Healthy(_) => None,
            Self::Degraded(_, reason) | Self::Unhealthy(_, reason) => Some(reason),
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy(_) => write!(f, "healthy"),
            Self::Degraded(_, reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(_, reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// Timing and backend details attached to a [`HealthStatus`].
#[derive(Debug, Clone)]
pub struct HealthMetadata {
    /// How long the health check took.
    pub check_duration: Duration,
    /// Identifier of the backend type (e.g. "memory").
    pub backend_type: &'static str,
    /// Backend-specific details (entry counts, connection info).
    pub details: HashMap<String, String>,
}

impl HealthMetadata {
    /// Creates metadata with no extra details.
    #[must_use = "creating metadata has no side effects"]
    pub fn new(check_duration: Duration, backend_type: &'static str) -> Self {
        Self { check_duration, backend_type, details: HashMap::new() }
    }

    /// Adds a backend-specific detail.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn predicates_match_variants() {
        let meta = HealthMetadata::new(Duration::from_millis(1), "memory");
        assert!(HealthStatus::healthy(meta.clone()).is_healthy());
        assert!(HealthStatus::degraded(meta.clone(), "slow").is_degraded());
        assert!(HealthStatus::unhealthy(meta, "down").is_unhealthy());
    }

    #[test]
    fn reason_exposed_for_non_healthy() {
        let meta = HealthMetadata::new(Duration::from_millis(1), "memory");
        assert_eq!(HealthStatus::healthy(meta.clone()).reason(), None);
        assert_eq!(HealthStatus::degraded(meta.clone(), "slow").reason(), Some("slow"));
        assert_eq!(HealthStatus::unhealthy(meta, "down").reason(), Some("down"));
    }

    #[test]
    fn display_includes_reason() {
        let meta = HealthMetadata::new(Duration::from_millis(1), "memory");
        assert_eq!(HealthStatus::degraded(meta, "stale fallback active").to_string(),
            "degraded: stale fallback active");
    }

    #[test]
    fn details_are_attached() {
        let meta = HealthMetadata::new(Duration::from_millis(2), "memory")
            .with_detail("entries", "42");
        assert_eq!(meta.details.get("entries").map(String::as_str), Some("42"));
    }
}
