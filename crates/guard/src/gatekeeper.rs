//! The authenticate-and-authorize orchestrator.
//!
//! [`Gatekeeper`] composes the rate limiter, cache tiers, circuit breaker,
//! authoritative verifier, and policy table into a single decision:
//!
//! ```text
//! request → token present? → rate limit → L1/L2 lookup
//!         → miss? breaker-gated authoritative call (bounded timeout)
//!              open/failing? stale cache, else BackendUnavailable
//!         → token expiry re-check (cache TTL may outlive token TTL)
//!         → policy check → Decision
//! ```
//!
//! Steps short-circuit on the first failure, every step emits a structured
//! outcome, and no path escapes as an error or panic — every failure maps
//! to an explicit [`Decision`] with a stable reason code.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use modhub_storage::{ConfigError, KvBackend};
use uuid::Uuid;

use crate::{
    authority::AuthorityVerifier,
    breaker::CircuitBreaker,
    cache::TierCache,
    config::GuardConfig,
    error::GuardError,
    fingerprint::TokenFingerprint,
    metrics::{GateMetrics, GateMetricsSnapshot},
    policy::PolicyTable,
    ratelimit::RateLimiter,
    token::IdentityContext,
};

/// Why a request was denied.
///
/// The stable [`code`](Self::code) is the caller-facing contract; the HTTP
/// layer maps codes to status codes (401/403/429) as it sees fit. No
/// variant leaks internal pipeline state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// No bearer token was presented.
    MissingToken,
    /// The token could not be decoded.
    MalformedToken,
    /// Signature verification failed.
    InvalidSignature,
    /// The token has expired.
    Expired,
    /// The token is not yet valid.
    NotYetValid,
    /// The token's kind claim is unrecognized.
    UnknownTokenKind,
    /// The token's issuer is not accepted.
    InvalidIssuer,
    /// A required claim is missing.
    MissingClaim,
    /// The identity lacks required permissions.
    InsufficientPermissions {
        /// The permissions the route requires.
        required: Vec<String>,
    },
    /// The principal's request quota is exhausted.
    RateLimited {
        /// When the current window resets.
        reset_at: DateTime<Utc>,
    },
    /// The authoritative path is unreachable and no usable cached decision
    /// exists.
    BackendUnavailable,
}

impl DenyReason {
    /// Returns the stable machine-readable reason code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::MalformedToken => "invalid_token_format",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "token_expired",
            Self::NotYetValid => "token_not_yet_valid",
            Self::UnknownTokenKind => "unknown_token_kind",
            Self::InvalidIssuer => "invalid_issuer",
            Self::MissingClaim => "missing_claim",
            Self::InsufficientPermissions { .. } => "insufficient_permissions",
            Self::RateLimited { .. } => "rate_limited",
            Self::BackendUnavailable => "backend_unavailable",
        }
    }
}

impl From<&GuardError> for DenyReason {
    fn from(err: &GuardError) -> Self {
        match err {
            GuardError::MissingToken => Self::MissingToken,
            GuardError::InvalidTokenFormat(_) => Self::MalformedToken,
            GuardError::InvalidSignature => Self::InvalidSignature,
            GuardError::Expired => Self::Expired,
            GuardError::NotYetValid => Self::NotYetValid,
            GuardError::UnknownTokenKind { .. } => Self::UnknownTokenKind,
            GuardError::InvalidIssuer(_) => Self::InvalidIssuer,
            GuardError::MissingClaim(_) => Self::MissingClaim,
            GuardError::InsufficientPermissions { required } => {
                Self::InsufficientPermissions { required: required.clone() }
            },
            GuardError::RateLimited { reset_at } => Self::RateLimited { reset_at: *reset_at },
            // Infrastructure failures surface only as unavailability — never
            // with internal detail.
            _ => Self::BackendUnavailable,
        }
    }
}

/// The outcome of one authenticate-and-authorize pass.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Why the request was denied; `None` when allowed.
    pub reason: Option<DenyReason>,
    /// The resolved identity; present on allow, and on permission denials
    /// where the identity itself was valid.
    pub identity: Option<IdentityContext>,
    /// Wall-clock time the decision took.
    pub latency: Duration,
    /// Correlation ID attached to every log line for this request.
    pub request_id: Uuid,
}

impl Decision {
    /// Returns the stable reason code, if denied.
    #[must_use]
    pub fn reason_code(&self) -> Option<&'static str> {
        self.reason.as_ref().map(DenyReason::code)
    }
}

/// The trust-boundary decision pipeline.
///
/// See the [module docs](self) for the step order and degradation rules.
pub struct Gatekeeper {
    cache: Arc<TierCache>,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    policy: PolicyTable,
    authority: Arc<dyn AuthorityVerifier>,
    authority_timeout: Duration,
    metrics: GateMetrics,
}

impl Gatekeeper {
    /// Builds a pipeline over the shared backend and authoritative verifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(
        shared: Arc<dyn KvBackend>,
        authority: Arc<dyn AuthorityVerifier>,
        policy: PolicyTable,
        config: GuardConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            cache: Arc::new(TierCache::new(Arc::clone(&shared), config.cache.clone())),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            limiter: RateLimiter::new(shared, config.rate_limit),
            policy,
            authority,
            authority_timeout: config.authority_timeout,
            metrics: GateMetrics::default(),
        })
    }

    /// Starts the background tasks: the cache sweeper and the breaker probe
    /// timer. The timers are independent schedules communicating only
    /// through the state they own.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn spawn_background_tasks(&self, probe_interval: Duration) {
        let _ = Arc::clone(&self.cache).spawn_sweeper();
        self.breaker.spawn_probe_timer(probe_interval);
    }

    /// Stops the background tasks.
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
        self.breaker.shutdown().await;
    }

    /// Authenticates and authorizes one request, rate-limited by the
    /// token's fingerprint.
    pub async fn authenticate(
        &self,
        token: Option<&str>,
        method: &str,
        path: &str,
    ) -> Decision {
        self.authenticate_inner(token, method, path, None).await
    }

    /// Like [`authenticate`](Self::authenticate), but rate-limited by an
    /// explicit principal key (for callers that resolve principals before
    /// entering the pipeline).
    pub async fn authenticate_with_rate_key(
        &self,
        token: Option<&str>,
        method: &str,
        path: &str,
        rate_key: &str,
    ) -> Decision {
        self.authenticate_inner(token, method, path, Some(rate_key)).await
    }

    #[tracing::instrument(skip(self, token, rate_key))]
    async fn authenticate_inner(
        &self,
        token: Option<&str>,
        method: &str,
        path: &str,
        rate_key: Option<&str>,
    ) -> Decision {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        self.metrics.record_request();

        // Step 1: token must be present.
        let Some(raw) = token.filter(|t| !t.is_empty()) else {
            return self.deny(DenyReason::MissingToken, None, started, request_id, method, path);
        };
        let fingerprint = TokenFingerprint::of(raw);

        // Step 2: rate limit. Backend errors fail open inside the limiter.
        let rate_key = rate_key.unwrap_or_else(|| fingerprint.as_str());
        let rate = self.limiter.check(rate_key).await;
        if !rate.allowed {
            return self.deny(
                DenyReason::RateLimited { reset_at: rate.reset_at },
                None,
                started,
                request_id,
                method,
                path,
            );
        }

        // Steps 3–4: cache lookup, then breaker-gated authoritative
        // resolution on a total miss.
        let identity = match self.cache.get(&fingerprint).await {
            Some(context) => context,
            None => match self.resolve_via_authority(raw, &fingerprint).await {
                Ok(context) => context,
                Err(reason) => {
                    return self.deny(reason, None, started, request_id, method, path);
                },
            },
        };

        // Step 5: expiry re-check, even on cache hits — cache TTLs may
        // outlive token TTLs in degenerate configs.
        if identity.is_expired(Utc::now()) {
            return self.deny(
                DenyReason::Expired,
                Some(identity),
                started,
                request_id,
                method,
                path,
            );
        }

        // Step 6: policy.
        let required = self.policy.required_permissions(method, path);
        if !self.policy.authorize(&identity, &required) {
            let required: Vec<String> = required.into_iter().collect();
            return self.deny(
                DenyReason::InsufficientPermissions { required },
                Some(identity),
                started,
                request_id,
                method,
                path,
            );
        }

        self.allow(identity, started, request_id, method, path)
    }

    /// Resolves an identity through the breaker-gated authoritative call.
    ///
    /// Terminal rejections are the answer (and count as breaker successes:
    /// the backend responded). Transport failures and timeouts count as
    /// breaker failures and fall back to stale cache, else
    /// [`DenyReason::BackendUnavailable`].
    async fn resolve_via_authority(
        &self,
        raw: &str,
        fingerprint: &TokenFingerprint,
    ) -> Result<IdentityContext, DenyReason> {
        if !self.breaker.allow_request() {
            tracing::warn!(fp = %fingerprint, "breaker open, skipping authoritative call");
            return self.stale_or_unavailable(fingerprint);
        }

        self.metrics.record_authority_call();
        match tokio::time::timeout(self.authority_timeout, self.authority.validate(raw)).await {
            Ok(Ok(context)) => {
                self.breaker.record_success();
                self.cache.put(fingerprint, context.clone()).await;
                if context.verified_with_previous {
                    tracing::info!(
                        sub = %context.subject,
                        "identity verified with previous secret; re-issuance advised"
                    );
                }
                Ok(context)
            },
            Ok(Err(err)) if err.is_terminal() => {
                // A definitive rejection means the authority is healthy.
                self.breaker.record_success();
                tracing::debug!(reason = err.reason_code(), "authoritative rejection");
                Err(DenyReason::from(&err))
            },
            Ok(Err(err)) => {
                self.metrics.record_authority_failure();
                self.breaker.record_failure();
                tracing::warn!(error = %err, "authoritative verification failed");
                self.stale_or_unavailable(fingerprint)
            },
            Err(_elapsed) => {
                // A timeout is identical to a connection error.
                self.metrics.record_authority_failure();
                self.breaker.record_failure();
                tracing::warn!(
                    timeout_ms = self.authority_timeout.as_millis() as u64,
                    "authoritative verification timed out"
                );
                self.stale_or_unavailable(fingerprint)
            },
        }
    }

    fn stale_or_unavailable(
        &self,
        fingerprint: &TokenFingerprint,
    ) -> Result<IdentityContext, DenyReason> {
        match self.cache.get_stale(fingerprint) {
            Some(context) => {
                self.metrics.record_stale_served();
                Ok(context)
            },
            None => Err(DenyReason::BackendUnavailable),
        }
    }

    fn allow(
        &self,
        identity: IdentityContext,
        started: Instant,
        request_id: Uuid,
        method: &str,
        path: &str,
    ) -> Decision {
        self.metrics.record_allowed();
        let latency = started.elapsed();
        tracing::info!(
            allowed = true,
            sub = %identity.subject,
            kind = identity.kind.name(),
            method,
            path,
            latency_ms = latency.as_millis() as u64,
            request_id = %request_id,
            "access decision"
        );
        Decision { allowed: true, reason: None, identity: Some(identity), latency, request_id }
    }

    fn deny(
        &self,
        reason: DenyReason,
        identity: Option<IdentityContext>,
        started: Instant,
        request_id: Uuid,
        method: &str,
        path: &str,
    ) -> Decision {
        self.metrics.record_denied();
        let latency = started.elapsed();
        tracing::info!(
            allowed = false,
            reason = reason.code(),
            method,
            path,
            latency_ms = latency.as_millis() as u64,
            request_id = %request_id,
            "access decision"
        );
        Decision { allowed: false, reason: Some(reason), identity, latency, request_id }
    }

    /// Returns the identity cache, for metrics and administrative
    /// invalidation.
    #[must_use]
    pub fn cache(&self) -> &Arc<TierCache> {
        &self.cache
    }

    /// Returns the circuit breaker, for health reporting.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Returns the rate limiter, for metrics.
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Returns a snapshot of the pipeline metrics.
    #[must_use]
    pub fn metrics_snapshot(&self) -> GateMetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use modhub_storage::MemoryBackend;

    use super::*;
    use crate::{
        authority::LocalAuthority,
        config::DEFAULT_ISSUER,
        secret::SecretStore,
        token::{TokenClaims, TokenIssuer, TokenKind, TokenVerifier},
    };

    async fn test_pipeline(policy: PolicyTable) -> (Gatekeeper, TokenIssuer) {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let secrets = Arc::new(SecretStore::new(Arc::clone(&backend)));
        secrets.load_or_init().await.unwrap();

        let issuer = TokenIssuer::new(Arc::clone(&secrets));
        let authority = LocalAuthority::shared(TokenVerifier::new(secrets, DEFAULT_ISSUER));
        let gate = Gatekeeper::new(backend, authority, policy, GuardConfig::default()).unwrap();
        (gate, issuer)
    }

    fn reader_claims() -> TokenClaims {
        TokenClaims::new(
            "user-1",
            TokenKind::Principal { session_id: None },
            DEFAULT_ISSUER,
            Duration::from_secs(3600),
        )
        .with_permissions(["posts:read"])
    }

    #[tokio::test]
    async fn valid_token_on_public_route_allowed() {
        let (gate, issuer) = test_pipeline(PolicyTable::new()).await;
        let token = issuer.issue(&reader_claims()).await.unwrap();

        let decision = gate.authenticate(Some(&token), "GET", "/posts").await;
        assert!(decision.allowed);
        assert_eq!(decision.reason_code(), None);
        assert_eq!(decision.identity.unwrap().subject, "user-1");
    }

    #[tokio::test]
    async fn missing_token_denied() {
        let (gate, _) = test_pipeline(PolicyTable::new()).await;

        let decision = gate.authenticate(None, "GET", "/posts").await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason_code(), Some("missing_token"));

        let decision = gate.authenticate(Some(""), "GET", "/posts").await;
        assert_eq!(decision.reason_code(), Some("missing_token"));
    }

    #[tokio::test]
    async fn garbage_token_denied_with_format_reason() {
        let (gate, _) = test_pipeline(PolicyTable::new()).await;

        let decision = gate.authenticate(Some("not-a-jwt"), "GET", "/posts").await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason_code(), Some("invalid_token_format"));
    }

    #[tokio::test]
    async fn second_request_served_from_cache() {
        let (gate, issuer) = test_pipeline(PolicyTable::new()).await;
        let token = issuer.issue(&reader_claims()).await.unwrap();

        let first = gate.authenticate(Some(&token), "GET", "/posts").await;
        let second = gate.authenticate(Some(&token), "GET", "/posts").await;
        assert!(first.allowed && second.allowed);

        // Only the first request reached the authority
        assert_eq!(gate.metrics_snapshot().authority_calls, 1);
        assert_eq!(gate.cache().metrics_snapshot().l1_hits, 1);
    }

    #[tokio::test]
    async fn insufficient_permissions_denied_with_identity() {
        let policy = PolicyTable::new()
            .with_rule("POST", "/posts", ["posts:read", "posts:write"]);
        let (gate, issuer) = test_pipeline(policy).await;
        let token = issuer.issue(&reader_claims()).await.unwrap();

        let decision = gate.authenticate(Some(&token), "POST", "/posts").await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason_code(), Some("insufficient_permissions"));
        match decision.reason.unwrap() {
            DenyReason::InsufficientPermissions { required } => {
                assert!(required.contains(&"posts:write".to_owned()));
            },
            other => panic!("expected InsufficientPermissions, got {other:?}"),
        }
        // The identity itself was valid and is surfaced for logging
        assert!(decision.identity.is_some());
    }

    #[tokio::test]
    async fn expired_cached_identity_denied() {
        let (gate, issuer) = test_pipeline(PolicyTable::new()).await;

        let mut claims = reader_claims();
        claims.exp = claims.iat + 1;
        let token = issuer.issue(&claims).await.unwrap();

        // Seed the cache directly, simulating a cache TTL outliving the
        // token TTL.
        let fp = TokenFingerprint::of(&token);
        let identity =
            crate::token::IdentityContext::from_claims(claims, false).unwrap();
        gate.cache().put(&fp, identity).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let decision = gate.authenticate(Some(&token), "GET", "/posts").await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason_code(), Some("token_expired"));
    }

    #[tokio::test]
    async fn system_token_passes_admin_policy() {
        let policy = PolicyTable::new().with_rule("POST", "/admin", ["admin:write"]);
        let (gate, issuer) = test_pipeline(policy).await;

        let claims = TokenClaims::new(
            "system",
            TokenKind::System,
            DEFAULT_ISSUER,
            Duration::from_secs(60),
        );
        let token = issuer.issue(&claims).await.unwrap();

        let decision = gate.authenticate(Some(&token), "POST", "/admin").await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn deny_reason_codes_round_trip_guard_errors() {
        let errors = [
            GuardError::MissingToken,
            GuardError::InvalidSignature,
            GuardError::Expired,
            GuardError::unknown_token_kind("robot"),
            GuardError::BackendUnavailable,
        ];
        for err in &errors {
            assert_eq!(DenyReason::from(err).code(), err.reason_code());
        }
    }
}
