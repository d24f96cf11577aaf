//! # ModHub Trust-Boundary Validation Pipeline
//!
//! This crate turns an inbound bearer token into a verified
//! identity-and-permission decision. It is shared between the signing
//! authority (secret rotation, token issuance) and the enforcement point
//! (multi-tier caching, circuit breaking, rate limiting, permission
//! checks), and stays correct under secret rotation, partial backend
//! outages, burst traffic, and concurrent access — without ever granting
//! access on stale or forged credentials.
//!
//! # Components
//!
//! - [`secret`]: durable secret pair + rotation schedule
//! - [`token`]: token issuance, verification, identity contexts
//! - [`cache`]: two-tier identity cache with stale fallback
//! - [`breaker`]: circuit breaker on the authoritative path
//! - [`ratelimit`]: per-principal fixed-window limiting
//! - [`policy`]: route-to-permission matching
//! - [`gatekeeper`]: the orchestrator producing [`Decision`]s
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use modhub_guard::{
//!     Gatekeeper, GuardConfig, LocalAuthority, PolicyTable, SecretStore,
//!     TokenClaims, TokenIssuer, TokenKind, TokenVerifier,
//! };
//! use modhub_storage::{KvBackend, MemoryBackend};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
//! let secrets = Arc::new(SecretStore::new(Arc::clone(&backend)));
//! secrets.load_or_init().await?;
//!
//! let issuer = TokenIssuer::new(Arc::clone(&secrets));
//! let authority = LocalAuthority::shared(TokenVerifier::new(secrets, "modhub-auth"));
//! let policy = PolicyTable::new().with_rule("POST", "/modules/register", ["modules:register"]);
//!
//! let gate = Gatekeeper::new(backend, authority, policy, GuardConfig::default())?;
//!
//! let claims = TokenClaims::new(
//!     "user-42",
//!     TokenKind::Principal { session_id: None },
//!     "modhub-auth",
//!     Duration::from_secs(3600),
//! )
//! .with_permissions(["modules:register"]);
//! let token = issuer.issue(&claims).await?;
//!
//! let decision = gate.authenticate(Some(&token), "POST", "/modules/register").await;
//! assert!(decision.allowed);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Authoritative verification seam.
pub mod authority;
/// Circuit breaker on the authoritative path.
pub mod breaker;
/// Two-tier identity cache.
pub mod cache;
/// Aggregated pipeline configuration.
pub mod config;
/// Pipeline error types.
pub mod error;
/// One-way token fingerprints.
pub mod fingerprint;
/// The decision orchestrator.
pub mod gatekeeper;
/// Pipeline-level metrics.
pub mod metrics;
/// Route-to-permission policy matching.
pub mod policy;
/// Per-principal rate limiting.
pub mod ratelimit;
/// Secret storage and rotation.
pub mod secret;
/// Token issuance and verification.
pub mod token;

// Re-export key types for convenience
pub use authority::{AuthorityVerifier, LocalAuthority};
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use cache::{TierCache, TierCacheConfig};
pub use config::GuardConfig;
pub use error::{GuardError, Result};
pub use fingerprint::TokenFingerprint;
pub use gatekeeper::{Decision, DenyReason, Gatekeeper};
pub use policy::{PolicyRule, PolicyTable};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use secret::{RotationManager, Secret, SecretRotated, SecretStore, SecretValue};
pub use token::{IdentityContext, TokenClaims, TokenIssuer, TokenKind, TokenVerifier};
