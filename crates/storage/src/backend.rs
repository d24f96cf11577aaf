//! Storage backend trait definition.
//!
//! This module defines the [`KvBackend`] trait, the core abstraction for the
//! shared state the trust-boundary pipeline keeps outside the process:
//! cached identity contexts, rate-limit counters, and the signing-secret
//! record.
//!
//! # Design Philosophy
//!
//! The trait provides a minimal key-value interface:
//! - **Keys and values are bytes**: no assumptions about serialization format
//! - **Async by default**: all operations are async for non-blocking I/O
//! - **TTL-aware**: values can expire without an explicit delete
//! - **Atomic primitives**: compare-and-set for safe concurrent secret
//!   rotation, increment-with-expiry for fixed-window rate counting
//!
//! Domain logic (what a cached identity means, what a rate window is) lives
//! in `modhub-guard`, not in the backends.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::StorageResult,
    health::{HealthProbe, HealthStatus},
};

/// Abstract key-value backend.
///
/// Backends are expected to be thread-safe (`Send + Sync`) and support
/// concurrent operations.
///
/// # Key Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](KvBackend::get) | Retrieve a single value by key |
/// | [`set`](KvBackend::set) | Store a key-value pair |
/// | [`set_with_ttl`](KvBackend::set_with_ttl) | Store with automatic expiration |
/// | [`delete`](KvBackend::delete) | Remove a key |
/// | [`compare_and_set`](KvBackend::compare_and_set) | Atomic compare-and-swap |
/// | [`increment_with_expiry`](KvBackend::increment_with_expiry) | Atomic windowed counter |
/// | [`health_check`](KvBackend::health_check) | Verify backend availability |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use modhub_storage::{KvBackend, MemoryBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// let value = backend.get(b"key").await.unwrap();
/// assert_eq!(value, Some(Bytes::from("value")));
/// # });
/// ```
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(bytes))` if the key exists and has not expired
    /// - `Ok(None)` if the key doesn't exist or its TTL has elapsed
    /// - `Err(...)` on storage errors
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair.
    ///
    /// If the key already exists, its value is overwritten and any existing
    /// TTL is cleared (the key becomes non-expiring).
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Stores a key-value pair that expires after `ttl`.
    ///
    /// After the TTL elapses the key reads as absent, even if the backend
    /// has not yet physically removed it.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Removes a key. Removing a non-existent key is not an error.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Atomically sets a key's value if it matches the expected current value.
    ///
    /// # Semantics
    ///
    /// - **`expected: None`** — insert-if-absent. Succeeds only when the key does not exist (or has
    ///   expired). Fails with [`Conflict`](crate::StorageError::Conflict) if any value is present.
    /// - **`expected: Some(value)`** — update-if-unchanged. Succeeds only when the current value is
    ///   an exact byte-for-byte match. Fails with [`Conflict`](crate::StorageError::Conflict) if
    ///   the key is absent or holds a different value.
    ///
    /// On success any existing TTL on the key is cleared.
    ///
    /// The comparison is exact byte equality with no normalization. Callers
    /// serializing structured data must ensure deterministic byte output
    /// (struct types serialize deterministically with `serde_json`;
    /// `HashMap`s do not).
    ///
    /// This is the primitive that makes concurrent secret rotation safe:
    /// two instances racing to rotate will have exactly one writer win, and
    /// the loser observes [`Conflict`](crate::StorageError::Conflict) and
    /// re-reads the freshly written record.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Atomically increments a counter, installing an expiry on first use.
    ///
    /// If the key is absent (or expired), the counter is initialized to 1
    /// and the expiry is set to `now + ttl`. If the key exists, the counter
    /// is incremented and the existing expiry is left untouched. Returns the
    /// post-increment count.
    ///
    /// This gives fixed-window counting in a single round-trip: the first
    /// request in a window opens it, and the window closes on its own when
    /// the TTL elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Serialization`](crate::StorageError::Serialization) if the
    /// existing value is not a decimal-encoded counter.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn increment_with_expiry(&self, key: &[u8], ttl: Duration) -> StorageResult<u64>;

    /// Verifies backend availability.
    ///
    /// The probe type determines what "available" means; see [`HealthProbe`].
    #[must_use = "health status must be inspected"]
    async fn health_check(&self, probe: HealthProbe) -> StorageResult<HealthStatus>;
}
