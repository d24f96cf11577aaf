//! Pipeline error types.
//!
//! This module defines the errors produced while turning a bearer token into
//! an allow/deny decision. Authentication and authorization failures are
//! terminal and surface to the caller with a stable, machine-readable reason
//! code; infrastructure failures are absorbed by the pipeline wherever a safe
//! default exists and only escalate to
//! [`GuardError::BackendUnavailable`] when no usable answer remains.

use chrono::{DateTime, Utc};
use modhub_storage::StorageError;
use thiserror::Error;

/// Errors produced by the trust-boundary validation pipeline.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]` — new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GuardError {
    /// No bearer token was presented.
    #[error("Missing bearer token")]
    MissingToken,

    /// Malformed token — cannot be decoded.
    #[error("Invalid token format: {0}")]
    InvalidTokenFormat(String),

    /// Signature verification failed with every accepted secret.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Token has expired.
    #[error("Token expired")]
    Expired,

    /// Token not yet valid.
    #[error("Token not yet valid")]
    NotYetValid,

    /// The `kind` claim names no known token kind.
    #[error("Unknown token kind: {kind}")]
    UnknownTokenKind {
        /// The unrecognized kind value.
        kind: String,
    },

    /// Unknown or invalid issuer.
    #[error("Invalid issuer: {0}")]
    InvalidIssuer(String),

    /// Required claim is missing or empty.
    #[error("Missing claim: {0}")]
    MissingClaim(String),

    /// The identity does not hold every required permission.
    #[error("Insufficient permissions")]
    InsufficientPermissions {
        /// The permissions the route requires.
        required: Vec<String>,
    },

    /// The per-principal request quota for the current window is exhausted.
    #[error("Rate limit exceeded, resets at {reset_at}")]
    RateLimited {
        /// When the current window closes and the counter resets.
        reset_at: DateTime<Utc>,
    },

    /// The authoritative verification path is unreachable and no usable
    /// cached decision exists.
    #[error("Authoritative verification unavailable")]
    BackendUnavailable,

    /// Storage backend error.
    ///
    /// Wraps the original [`StorageError`] to preserve the full error source
    /// chain for debugging and structured logging.
    #[error("Storage error: {0}")]
    Storage(
        /// The underlying storage failure.
        #[source]
        StorageError,
    ),
}

impl GuardError {
    /// Creates an `InvalidTokenFormat` error.
    #[must_use]
    pub fn invalid_token_format(message: impl Into<String>) -> Self {
        Self::InvalidTokenFormat(message.into())
    }

    /// Creates an `UnknownTokenKind` error.
    #[must_use]
    pub fn unknown_token_kind(kind: impl Into<String>) -> Self {
        Self::UnknownTokenKind { kind: kind.into() }
    }

    /// Creates a `MissingClaim` error.
    #[must_use]
    pub fn missing_claim(claim: impl Into<String>) -> Self {
        Self::MissingClaim(claim.into())
    }

    /// Creates an `InsufficientPermissions` error from the required set.
    #[must_use]
    pub fn insufficient_permissions<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::InsufficientPermissions { required: required.into_iter().map(Into::into).collect() }
    }

    /// Returns the stable machine-readable reason code for this error.
    ///
    /// Codes are part of the public contract: rejections carry them to the
    /// caller, and they never change meaning across releases. No code leaks
    /// internal state (cache contents, breaker counters).
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidTokenFormat(_) => "invalid_token_format",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "token_expired",
            Self::NotYetValid => "token_not_yet_valid",
            Self::UnknownTokenKind { .. } => "unknown_token_kind",
            Self::InvalidIssuer(_) => "invalid_issuer",
            Self::MissingClaim(_) => "missing_claim",
            Self::InsufficientPermissions { .. } => "insufficient_permissions",
            Self::RateLimited { .. } => "rate_limited",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Returns `true` for terminal authentication/authorization rejections.
    ///
    /// Terminal errors are the caller's answer. Everything else is an
    /// infrastructure failure the pipeline may still degrade around.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Storage(_) | Self::BackendUnavailable)
    }
}

impl From<jsonwebtoken::errors::Error> for GuardError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidToken => Self::InvalidTokenFormat("invalid JWT structure".into()),
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidIssuer => Self::InvalidIssuer("issuer validation failed".into()),
            _ => Self::InvalidTokenFormat(format!("JWT error: {err}")),
        }
    }
}

impl From<StorageError> for GuardError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, GuardError>;
