//! One-way token fingerprints for cache keying.
//!
//! Raw bearer tokens are credentials and must not be retained at rest, so
//! both cache tiers and the rate limiter key on a one-way fingerprint
//! instead: the SHA-256 of the raw token, hex-encoded and truncated.

use std::fmt;

use sha2::{Digest, Sha256};

/// Length of the hex-encoded fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// A one-way derived cache key for a raw token.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenFingerprint(String);

impl TokenFingerprint {
    /// Computes the fingerprint of a raw token.
    #[must_use]
    pub fn of(token: &str) -> Self {
        let digest = Sha256::digest(token.as_bytes());
        let mut hex = String::with_capacity(FINGERPRINT_LEN);
        for byte in digest.iter().take(FINGERPRINT_LEN / 2) {
            use fmt::Write;
            // Writing to a String cannot fail.
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Returns the fingerprint as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
