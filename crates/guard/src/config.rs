//! Aggregated pipeline configuration.
//!
//! [`GuardConfig`] bundles the per-component configurations the
//! [`Gatekeeper`](crate::gatekeeper::Gatekeeper) needs. The defaults match
//! a moderate production deployment; every sub-config validates its own
//! invariants at construction time.

use std::time::Duration;

use modhub_storage::ConfigError;

use crate::{breaker::CircuitBreakerConfig, cache::TierCacheConfig, ratelimit::RateLimitConfig};

/// Default issuer claim required on every token.
pub const DEFAULT_ISSUER: &str = "modhub-auth";

/// Default bound on a single authoritative verification call.
pub const DEFAULT_AUTHORITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the full decision pipeline.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// The issuer claim tokens must carry.
    pub issuer: String,
    /// Bound on a single authoritative verification call. A timeout counts
    /// as a breaker failure, identical to a connection error.
    pub authority_timeout: Duration,
    /// Identity cache tiers.
    pub cache: TierCacheConfig,
    /// Circuit breaker on the authoritative path.
    pub breaker: CircuitBreakerConfig,
    /// Per-principal rate limiting.
    pub rate_limit: RateLimitConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_owned(),
            authority_timeout: DEFAULT_AUTHORITY_TIMEOUT,
            cache: TierCacheConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Validates cross-component settings.
    ///
    /// The sub-configs validate themselves at construction; this checks the
    /// fields owned directly by the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `authority_timeout` is zero or `issuer`
    /// is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.authority_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "authority_timeout",
                value: "0s".into(),
            });
        }
        if self.issuer.is_empty() {
            return Err(ConfigError::BelowMinimum {
                field: "issuer",
                min: "1 character".into(),
                value: "empty".into(),
            });
        }
        Ok(())
    }
}
