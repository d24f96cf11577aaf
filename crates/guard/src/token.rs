//! Token issuance, verification, and the resolved identity context.
//!
//! Tokens are HS256 JWTs signed with the rotating shared secret from
//! [`SecretStore`](crate::secret::SecretStore). Three kinds exist:
//! principal (end-user), service (inter-service), and system
//! (administrative, implicit all-permissions).
//!
//! # Verification order
//!
//! 1. Structural checks without any secret: part count, base64 payload,
//!    JSON shape, known `kind`, required claims.
//! 2. Signature + claims check against the **current** secret.
//! 3. On signature failure only, retry against the **previous** secret if
//!    one is still inside its grace window. A previous-secret success is
//!    flagged on the returned identity so the caller can advise
//!    re-issuance — the token's own `exp` is unchanged.
//! 4. If both fail, the error from the current-secret attempt propagates,
//!    keeping error messages stable across the grace window.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::{
    error::{GuardError, Result},
    secret::{Secret, SecretStore},
};

/// The wildcard permission: holders pass every permission check.
pub const WILDCARD_PERMISSION: &str = "*";

/// The kind-specific portion of a token, tagged by the `kind` claim.
///
/// Exhaustive matching at the boundary where kind-specific fields are read
/// replaces any dispatch-by-inheritance: a new kind is a compile error at
/// every match site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenKind {
    /// An end-user identity.
    Principal {
        /// The login session this token belongs to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// A non-human inter-service identity.
    Service {
        /// Stable identifier of the calling service.
        service_id: String,
        /// Human-readable service name.
        service_name: String,
    },
    /// An administrative identity with implicit all-permissions.
    System,
}

impl TokenKind {
    /// Returns the kind's wire name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Principal { .. } => "principal",
            Self::Service { .. } => "service",
            Self::System => "system",
        }
    }
}

/// The claims carried by every token.
///
/// `kind` is flattened into the payload, so the wire form is e.g.:
///
/// ```json
/// {
///   "sub": "user-42",
///   "iss": "modhub-auth",
///   "aud": ["modhub"],
///   "exp": 1234567890,
///   "iat": 1234564290,
///   "roles": ["member"],
///   "permissions": ["posts:read"],
///   "kind": "principal",
///   "session_id": "sess-7"
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject — the identity this token represents.
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Audience services.
    #[serde(default)]
    pub aud: BTreeSet<String>,
    /// Expiration time (seconds since epoch).
    pub exp: u64,
    /// Issued at (seconds since epoch).
    pub iat: u64,
    /// Roles granted to the identity.
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Permissions granted to the identity.
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    /// Kind-specific fields, tagged by the `kind` claim.
    #[serde(flatten)]
    pub kind: TokenKind,
}

impl TokenClaims {
    /// Creates claims for the given subject and kind, valid for `ttl` from
    /// now.
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        kind: TokenKind,
        issuer: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now().timestamp().max(0) as u64;
        Self {
            sub: subject.into(),
            iss: issuer.into(),
            aud: BTreeSet::new(),
            exp: now + ttl.as_secs(),
            iat: now,
            roles: BTreeSet::new(),
            permissions: BTreeSet::new(),
            kind,
        }
    }

    /// Adds roles.
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Adds permissions.
    #[must_use]
    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions.extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Adds audience entries.
    #[must_use]
    pub fn with_audience<I, S>(mut self, audience: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aud.extend(audience.into_iter().map(Into::into));
        self
    }
}

/// The verified, resolved form of a token used downstream.
///
/// Immutable once produced; this is what the cache tiers store and what the
/// policy check runs against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentityContext {
    /// The identity this context represents.
    pub subject: String,
    /// Token kind plus kind-specific fields.
    pub kind: TokenKind,
    /// Roles granted to the identity.
    pub roles: BTreeSet<String>,
    /// Permissions granted to the identity.
    pub permissions: BTreeSet<String>,
    /// Issuer of the underlying token.
    pub issuer: String,
    /// Audience of the underlying token.
    pub audience: BTreeSet<String>,
    /// When the underlying token was issued.
    pub issued_at: DateTime<Utc>,
    /// When the underlying token expires. Checked on every decision, even
    /// on cache hits — cache TTLs may outlive token TTLs.
    pub expires_at: DateTime<Utc>,
    /// The token was verified with the previous secret. The caller may
    /// proactively trigger re-issuance; expiry is still `expires_at`.
    #[serde(default)]
    pub verified_with_previous: bool,
}

impl IdentityContext {
    /// Builds a context from verified claims.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidTokenFormat`] if the timestamps do not
    /// fit a valid datetime.
    pub fn from_claims(claims: TokenClaims, verified_with_previous: bool) -> Result<Self> {
        let issued_at = DateTime::from_timestamp(claims.iat as i64, 0)
            .ok_or_else(|| GuardError::invalid_token_format("iat is out of range"))?;
        let expires_at = DateTime::from_timestamp(claims.exp as i64, 0)
            .ok_or_else(|| GuardError::invalid_token_format("exp is out of range"))?;

        Ok(Self {
            subject: claims.sub,
            kind: claims.kind,
            roles: claims.roles,
            permissions: claims.permissions,
            issuer: claims.iss,
            audience: claims.aud,
            issued_at,
            expires_at,
            verified_with_previous,
        })
    }

    /// Returns `true` if the identity holds every required permission.
    ///
    /// System identities and holders of the wildcard permission pass every
    /// check.
    #[must_use]
    pub fn has_permissions(&self, required: &BTreeSet<String>) -> bool {
        if matches!(self.kind, TokenKind::System) {
            return true;
        }
        if self.permissions.contains(WILDCARD_PERMISSION) {
            return true;
        }
        required.iter().all(|p| self.permissions.contains(p))
    }

    /// Returns `true` if the underlying token has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Wire names of the known token kinds, for structural validation.
const KNOWN_KINDS: [&str; 3] = ["principal", "service", "system"];

/// Structural validation of a token, without any secret.
///
/// Catches malformed input and unknown kinds before any signature work so
/// their rejections are independent of the secret pair in force.
///
/// # Errors
///
/// - [`GuardError::InvalidTokenFormat`] — wrong part count, bad base64, bad JSON
/// - [`GuardError::MissingClaim`] — absent or empty `sub` / `kind`
/// - [`GuardError::UnknownTokenKind`] — a `kind` outside the known set
pub fn validate_structure(token: &str) -> Result<()> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(GuardError::invalid_token_format("JWT must have 3 parts separated by dots"));
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| GuardError::invalid_token_format(format!("failed to decode payload: {e}")))?;

    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes)
        .map_err(|e| GuardError::invalid_token_format(format!("failed to parse claims: {e}")))?;

    match payload.get("kind").and_then(|v| v.as_str()) {
        None => return Err(GuardError::missing_claim("kind")),
        Some(kind) if !KNOWN_KINDS.contains(&kind) => {
            return Err(GuardError::unknown_token_kind(kind));
        },
        Some(_) => {},
    }

    if payload.get("sub").and_then(|v| v.as_str()).is_none_or(str::is_empty) {
        return Err(GuardError::missing_claim("sub"));
    }

    Ok(())
}

/// Builds and signs tokens with the current secret.
#[derive(Clone)]
pub struct TokenIssuer {
    secrets: Arc<SecretStore>,
}

impl TokenIssuer {
    /// Creates an issuer over the given secret store.
    #[must_use]
    pub fn new(secrets: Arc<SecretStore>) -> Self {
        Self { secrets }
    }

    /// Signs the claims with the current secret.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if the current secret cannot be
    /// loaded, or [`GuardError::InvalidTokenFormat`] if encoding fails.
    #[tracing::instrument(skip(self, claims), fields(sub = %claims.sub, kind = claims.kind.name()))]
    pub async fn issue(&self, claims: &TokenClaims) -> Result<String> {
        let secret = self.secrets.current_secret().await?;
        let key = EncodingKey::from_secret(secret.value.expose().as_bytes());
        let token = encode(&Header::new(Algorithm::HS256), claims, &key)?;
        tracing::debug!("token issued");
        Ok(token)
    }
}

/// Validates a token's signature and claims against the accepted secret set.
#[derive(Clone)]
pub struct TokenVerifier {
    secrets: Arc<SecretStore>,
    issuer: String,
}

impl TokenVerifier {
    /// Creates a verifier that requires the given issuer claim.
    #[must_use]
    pub fn new(secrets: Arc<SecretStore>, issuer: impl Into<String>) -> Self {
        Self { secrets, issuer: issuer.into() }
    }

    /// Verifies a token and resolves it to an [`IdentityContext`].
    ///
    /// The dual-secret check is what makes rotation non-disruptive: tokens
    /// signed moments before a rotation remain valid until their own
    /// expiry, not until the next rotation.
    ///
    /// # Errors
    ///
    /// - [`GuardError::InvalidTokenFormat`] / [`GuardError::MissingClaim`] /
    ///   [`GuardError::UnknownTokenKind`] — structural rejection
    /// - [`GuardError::InvalidSignature`] — neither accepted secret matches
    /// - [`GuardError::Expired`] / [`GuardError::NotYetValid`] /
    ///   [`GuardError::InvalidIssuer`] — claim validation failure
    /// - [`GuardError::Storage`] — the secret pair cannot be loaded
    #[tracing::instrument(skip(self, token))]
    pub async fn verify(&self, token: &str) -> Result<IdentityContext> {
        validate_structure(token)?;

        let current = self.secrets.current_secret().await?;
        let current_err = match self.try_decode(token, &current) {
            Ok(claims) => return IdentityContext::from_claims(claims, false),
            Err(err) => err,
        };

        // Only a signature mismatch can be explained by rotation; every
        // other failure would repeat identically under the previous secret.
        if matches!(current_err, GuardError::InvalidSignature) {
            if let Some(previous) = self.secrets.previous_secret().await? {
                if let Ok(claims) = self.try_decode(token, &previous) {
                    tracing::warn!(
                        sub = %claims.sub,
                        "token verified with previous secret; re-issuance advised"
                    );
                    return IdentityContext::from_claims(claims, true);
                }
            }
        }

        // Propagate the current-secret error so messages stay stable across
        // the grace window.
        Err(current_err)
    }

    fn try_decode(&self, token: &str, secret: &Secret) -> Result<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);

        let key = DecodingKey::from_secret(secret.value.expose().as_bytes());
        let data = decode::<TokenClaims>(token, &key, &validation)?;
        Ok(data.claims)
    }
}
