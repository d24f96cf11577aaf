//! In-memory storage backend implementation.
//!
//! This module provides [`MemoryBackend`], an in-memory implementation of
//! [`KvBackend`] suitable for testing and development.
//!
//! # Features
//!
//! - **Thread-safe**: uses [`parking_lot::RwLock`] for concurrent access
//! - **TTL support**: a background task cleans up expired keys; expired keys read as absent before
//!   cleanup runs
//! - **Atomic primitives**: compare-and-set and increment-with-expiry execute under a single write
//!   lock
//!
//! # Example
//!
//! ```
//! use modhub_storage::{KvBackend, MemoryBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"greeting".to_vec(), b"hello".to_vec()).await.unwrap();
//!     let value = backend.get(b"greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - TTL cleanup runs every second, so physical expiration is not precise (logical expiration is —
//!   reads check the deadline)

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{select, sync::watch, time::sleep};

use crate::{
    backend::KvBackend,
    error::{StorageError, StorageResult},
    health::{HealthMetadata, HealthProbe, HealthStatus},
};

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the cleanup task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        // Sending is a best-effort signal; the receiver may already be gone.
        let _ = self.shutdown_tx.send(());
    }
}

/// In-memory storage backend using [`BTreeMap`].
///
/// Primarily intended for testing, but usable for development or
/// single-process deployments where persistence is not required.
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data store.
///
/// # Shutdown
///
/// The background TTL cleanup task stops automatically when all clones of
/// the `MemoryBackend` are dropped (via the internal `ShutdownGuard`).
/// You can also call [`shutdown`](Self::shutdown) to stop the task explicitly.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
    ttl_data: Arc<RwLock<BTreeMap<Vec<u8>, Instant>>>,
    /// Shared ownership of the shutdown sender. When the last clone drops,
    /// the sender is dropped, which closes the watch channel and signals the
    /// cleanup task to exit.
    shutdown_guard: Arc<ShutdownGuard>,
}

impl MemoryBackend {
    /// Creates a new in-memory storage backend.
    ///
    /// Also spawns a background task that periodically removes expired keys.
    /// The task stops automatically when all clones of the backend are
    /// dropped.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let backend = Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            ttl_data: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        let backend_clone = backend.clone();
        tokio::spawn(async move {
            backend_clone.cleanup_expired_keys(shutdown_rx).await;
        });

        backend
    }

    /// Background task to clean up expired keys.
    ///
    /// Runs every second, scanning for and removing keys whose TTL has
    /// elapsed. Exits when the shutdown signal is received.
    async fn cleanup_expired_keys(&self, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            select! {
                _ = sleep(Duration::from_secs(1)) => {}
                _ = shutdown_rx.changed() => {
                    return;
                }
            }

            let now = Instant::now();
            let mut expired_keys = Vec::new();

            // Find expired keys under a read lock
            {
                let ttl_guard = self.ttl_data.read();
                for (key, expiry) in ttl_guard.iter() {
                    if *expiry <= now {
                        expired_keys.push(key.clone());
                    }
                }
            }

            // Remove them in one critical section
            if !expired_keys.is_empty() {
                tracing::trace!(count = expired_keys.len(), "removing expired keys");
                let mut data_guard = self.data.write();
                let mut ttl_guard = self.ttl_data.write();
                for key in expired_keys {
                    data_guard.remove(&key);
                    ttl_guard.remove(&key);
                }
            }
        }
    }

    /// Explicitly signals the background TTL cleanup task to stop.
    ///
    /// Optional — the task also stops when all clones are dropped. Use this
    /// when deterministic shutdown timing matters (e.g. in tests).
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Checks if a key has expired.
    fn is_expired(&self, key: &[u8]) -> bool {
        let ttl_guard = self.ttl_data.read();
        if let Some(expiry) = ttl_guard.get(key) {
            return *expiry <= Instant::now();
        }
        false
    }

    /// Returns the number of live (non-expired) keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let data = self.data.read();
        data.keys().filter(|k| !self.is_expired(k)).count()
    }

    /// Returns `true` if no live keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        if self.is_expired(key) {
            return Ok(None);
        }

        let data = self.data.read();
        Ok(data.get(key).cloned())
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        let mut data = self.data.write();
        data.insert(key.clone(), Bytes::from(value));

        // set without TTL clears any existing TTL
        {
            let mut ttl_guard = self.ttl_data.write();
            ttl_guard.remove(&key);
        }

        Ok(())
    }

    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        let mut data = self.data.write();
        let mut ttl_data = self.ttl_data.write();

        let expiry = Instant::now() + ttl;

        data.insert(key.clone(), Bytes::from(value));
        ttl_data.insert(key, expiry);

        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        data.remove(key);

        {
            let mut ttl_guard = self.ttl_data.write();
            ttl_guard.remove(key);
        }

        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        let mut data = self.data.write();

        let current = if self.is_expired(key) { None } else { data.get(key).cloned() };

        let matches = match (expected, &current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur[..],
            _ => false,
        };

        if !matches {
            return Err(StorageError::Conflict);
        }

        data.insert(key.to_vec(), Bytes::from(new_value));

        // Clear any existing TTL on this key
        let mut ttl_guard = self.ttl_data.write();
        ttl_guard.remove(key);

        Ok(())
    }

    async fn increment_with_expiry(&self, key: &[u8], ttl: Duration) -> StorageResult<u64> {
        let mut data = self.data.write();
        let mut ttl_guard = self.ttl_data.write();

        let expired = ttl_guard.get(key).is_some_and(|expiry| *expiry <= Instant::now());

        let current = if expired { None } else { data.get(key) };

        let count = match current {
            Some(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    StorageError::serialization_with_source("counter is not valid UTF-8", e)
                })?;
                let n: u64 = text.parse().map_err(|e| {
                    StorageError::serialization_with_source("counter is not a decimal integer", e)
                })?;
                n + 1
            },
            None => 1,
        };

        data.insert(key.to_vec(), Bytes::from(count.to_string()));

        // Only the first increment in a window installs the expiry; later
        // increments leave the window's deadline untouched.
        if count == 1 {
            ttl_guard.insert(key.to_vec(), Instant::now() + ttl);
        }

        Ok(count)
    }

    async fn health_check(&self, _probe: HealthProbe) -> StorageResult<HealthStatus> {
        let start = Instant::now();
        let entries = self.data.read().len();
        let metadata = HealthMetadata::new(start.elapsed(), "memory")
            .with_detail("entries", entries.to_string());
        Ok(HealthStatus::healthy(metadata))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let backend = MemoryBackend::new();
        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        assert_eq!(backend.get(b"k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get(b"nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent_before_cleanup() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();

        assert!(backend.get(b"k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Logical expiry: the cleanup task may not have run yet
        assert_eq!(backend.get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_clears_existing_ttl() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl(b"k".to_vec(), b"v1".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        backend.set(b"k".to_vec(), b"v2".to_vec()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.get(b"k").await.unwrap(), Some(Bytes::from("v2")));
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let backend = MemoryBackend::new();
        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        backend.delete(b"k").await.unwrap();
        assert_eq!(backend.get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_insert_if_absent() {
        let backend = MemoryBackend::new();

        backend.compare_and_set(b"lock", None, b"holder-1".to_vec()).await.unwrap();

        let result = backend.compare_and_set(b"lock", None, b"holder-2".to_vec()).await;
        assert!(matches!(result, Err(StorageError::Conflict)));
        assert_eq!(backend.get(b"lock").await.unwrap(), Some(Bytes::from("holder-1")));
    }

    #[tokio::test]
    async fn cas_update_if_unchanged() {
        let backend = MemoryBackend::new();
        backend.set(b"version".to_vec(), b"1".to_vec()).await.unwrap();

        backend.compare_and_set(b"version", Some(b"1"), b"2".to_vec()).await.unwrap();

        let result = backend.compare_and_set(b"version", Some(b"1"), b"3".to_vec()).await;
        assert!(matches!(result, Err(StorageError::Conflict)));
        assert_eq!(backend.get(b"version").await.unwrap(), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn cas_treats_expired_key_as_absent() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl(b"k".to_vec(), b"old".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Insert-if-absent succeeds on an expired key
        backend.compare_and_set(b"k", None, b"new".to_vec()).await.unwrap();
        assert_eq!(backend.get(b"k").await.unwrap(), Some(Bytes::from("new")));
    }

    #[tokio::test]
    async fn increment_initializes_and_counts() {
        let backend = MemoryBackend::new();

        assert_eq!(
            backend.increment_with_expiry(b"rate:a", Duration::from_secs(60)).await.unwrap(),
            1
        );
        assert_eq!(
            backend.increment_with_expiry(b"rate:a", Duration::from_secs(60)).await.unwrap(),
            2
        );
        assert_eq!(
            backend.increment_with_expiry(b"rate:a", Duration::from_secs(60)).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn increment_window_resets_after_expiry() {
        let backend = MemoryBackend::new();

        let first =
            backend.increment_with_expiry(b"rate:b", Duration::from_millis(20)).await.unwrap();
        assert_eq!(first, 1);
        let second =
            backend.increment_with_expiry(b"rate:b", Duration::from_millis(20)).await.unwrap();
        assert_eq!(second, 2);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Window expired: the counter starts over
        let after =
            backend.increment_with_expiry(b"rate:b", Duration::from_millis(20)).await.unwrap();
        assert_eq!(after, 1);
    }

    #[tokio::test]
    async fn increment_does_not_extend_window() {
        let backend = MemoryBackend::new();

        backend.increment_with_expiry(b"rate:c", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Second increment inside the window must not push the deadline out
        backend.increment_with_expiry(b"rate:c", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // 60ms since windowStart > 50ms window: the counter must have reset
        let count =
            backend.increment_with_expiry(b"rate:c", Duration::from_millis(50)).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn increment_rejects_non_counter_value() {
        let backend = MemoryBackend::new();
        backend.set(b"rate:d".to_vec(), b"not-a-number".to_vec()).await.unwrap();

        let result = backend.increment_with_expiry(b"rate:d", Duration::from_secs(60)).await;
        assert!(matches!(result, Err(StorageError::Serialization { .. })));
    }

    #[tokio::test]
    async fn health_check_reports_healthy() {
        let backend = MemoryBackend::new();
        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();

        let status = backend.health_check(HealthProbe::Readiness).await.unwrap();
        assert!(status.is_healthy());
        assert_eq!(status.metadata().backend_type, "memory");
    }

    #[tokio::test]
    async fn cleanup_task_physically_removes_expired_keys() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;

        let data = backend.data.read();
        assert!(!data.contains_key(&b"k".to_vec()), "cleanup task should remove expired keys");
    }

    #[tokio::test]
    async fn clones_share_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();

        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        assert_eq!(clone.get(b"k").await.unwrap(), Some(Bytes::from("v")));
    }
}
