//! The authoritative verification seam.
//!
//! On a total cache miss the Gatekeeper resolves the token through an
//! [`AuthorityVerifier`]. The in-process [`LocalAuthority`] wraps
//! [`TokenVerifier`] directly; deployments where validation lives in a
//! separate service implement the trait over their transport instead. The
//! Gatekeeper is the only caller, always goes through the circuit breaker,
//! and bounds every call with a timeout.

use std::sync::Arc;

use async_trait::async_trait;
use fail::fail_point;
use modhub_storage::StorageError;

use crate::{
    error::{GuardError, Result},
    token::{IdentityContext, TokenVerifier},
};

/// Authoritative token validation.
///
/// Implementations distinguish two failure classes through their error
/// values: terminal rejections ([`GuardError::is_terminal`]) are definitive
/// answers from a healthy authority, while [`GuardError::Storage`] failures
/// mean the authority could not be consulted and are subject to breaker
/// accounting and stale-cache fallback.
#[async_trait]
pub trait AuthorityVerifier: Send + Sync {
    /// Validates a raw token and resolves it to an identity.
    async fn validate(&self, token: &str) -> Result<IdentityContext>;
}

/// Same-process authority backed by the local [`TokenVerifier`].
pub struct LocalAuthority {
    verifier: TokenVerifier,
}

impl LocalAuthority {
    /// Creates an authority over the given verifier.
    #[must_use]
    pub fn new(verifier: TokenVerifier) -> Self {
        Self { verifier }
    }

    /// Convenience constructor boxing into the trait object the Gatekeeper
    /// takes.
    #[must_use]
    pub fn shared(verifier: TokenVerifier) -> Arc<dyn AuthorityVerifier> {
        Arc::new(Self::new(verifier))
    }
}

#[async_trait]
impl AuthorityVerifier for LocalAuthority {
    async fn validate(&self, token: &str) -> Result<IdentityContext> {
        fail_point!("authority-before-validate", |_| {
            Err(GuardError::Storage(StorageError::connection(
                "injected failure before authoritative validation",
            )))
        });
        self.verifier.verify(token).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use modhub_storage::MemoryBackend;

    use super::*;
    use crate::{
        secret::SecretStore,
        token::{TokenClaims, TokenIssuer, TokenKind},
    };

    #[tokio::test]
    async fn local_authority_delegates_to_verifier() {
        let secrets = Arc::new(SecretStore::new(Arc::new(MemoryBackend::new())));
        secrets.load_or_init().await.unwrap();

        let issuer = TokenIssuer::new(Arc::clone(&secrets));
        let authority = LocalAuthority::new(TokenVerifier::new(secrets, "modhub-auth"));

        let claims = TokenClaims::new(
            "user-1",
            TokenKind::Principal { session_id: None },
            "modhub-auth",
            Duration::from_secs(60),
        );
        let token = issuer.issue(&claims).await.unwrap();

        let identity = authority.validate(&token).await.unwrap();
        assert_eq!(identity.subject, "user-1");

        let result = authority.validate("garbage").await;
        assert!(result.is_err());
    }
}
