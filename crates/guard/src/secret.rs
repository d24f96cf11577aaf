//! Signing-secret storage and rotation.
//!
//! The pipeline signs and verifies tokens with a shared HMAC secret that
//! rotates on a fixed schedule. [`SecretStore`] owns the in-process view of
//! the `(current, previous)` secret pair and persists it durably through a
//! [`KvBackend`]; [`RotationManager`] owns the rotation schedule and
//! announces each rotation to in-process subscribers.
//!
//! # Rotation protocol
//!
//! ```text
//! tick (or manual trigger)
//!   → generate new secret (64 random bytes, base64url)
//!   → compare-and-set the persisted record {new, previous: old}
//!       Ok        → swap the in-memory pair atomically
//!       Conflict  → another instance rotated first; adopt its record
//!       other err → the old current stays authoritative; retry next tick
//! ```
//!
//! Readers always observe a coherent pre- or post-rotation pair — the pair
//! is swapped under a single write lock, never field by field.
//!
//! # Grace window
//!
//! After a rotation the previous secret remains accepted until the
//! configured retention (which must cover the maximum token lifetime) has
//! elapsed, so tokens signed moments before a rotation stay valid until
//! their own expiry. [`SecretStore::previous_secret`] hides the previous
//! value once the window closes.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use modhub_storage::{KvBackend, StorageError};
use parking_lot::{Mutex, RwLock};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::error::{GuardError, Result};

/// Default interval between scheduled rotations (30 minutes).
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default retention of the previous secret after a rotation (24 hours).
///
/// Must be at least the maximum token lifetime, otherwise tokens signed just
/// before a rotation could be rejected before their own expiry.
pub const DEFAULT_PREVIOUS_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default backend key under which the secret record is persisted.
pub const DEFAULT_RECORD_KEY: &str = "auth/signing-secret";

/// Slack beyond the rotation interval before a secret counts as stale.
const STALE_SLACK: Duration = Duration::from_secs(5 * 60);

/// Slack beyond the rotation interval before rotation health degrades to a
/// warning.
const WARN_SLACK: Duration = Duration::from_secs(2 * 60);

/// Number of random bytes in a generated secret.
const SECRET_BYTES: usize = 64;

/// A signing secret value.
///
/// Wraps the secret string in [`Zeroizing`] so the bytes are scrubbed from
/// memory on drop, and redacts `Debug` output so secrets never reach logs.
#[derive(Clone)]
pub struct SecretValue(Zeroizing<String>);

impl SecretValue {
    /// Wraps an existing secret string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Generates a cryptographically strong random secret.
    #[must_use]
    pub fn generate() -> Self {
        use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

        let mut bytes = Zeroizing::new([0u8; SECRET_BYTES]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self(Zeroizing::new(URL_SAFE_NO_PAD.encode(&bytes[..])))
    }

    /// Exposes the secret material for signing or verification.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

impl PartialEq for SecretValue {
    fn eq(&self, other: &Self) -> bool {
        *self.0 == *other.0
    }
}

impl Eq for SecretValue {}

impl Serialize for SecretValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| Self(Zeroizing::new(s)))
    }
}

/// A signing secret together with its provenance.
#[derive(Clone, Debug)]
pub struct Secret {
    /// The secret material.
    pub value: SecretValue,
    /// When this secret was installed as current.
    pub created_at: DateTime<Utc>,
    /// The rotation interval in force when this secret was created.
    pub rotation_interval: Duration,
}

/// The persisted form of the secret pair.
///
/// Serialized as JSON and written through the backend's compare-and-set so
/// concurrent rotations across instances cannot tear the record.
#[derive(Debug, Serialize, Deserialize)]
struct SecretRecord {
    secret: SecretValue,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous_secret: Option<SecretValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous_created_at: Option<DateTime<Utc>>,
    rotation_interval_secs: u64,
}

/// In-memory view of the secret pair plus the raw bytes last observed in the
/// backend (the compare-and-set precondition for the next rotation).
struct PairState {
    current: Secret,
    previous: Option<Secret>,
    persisted: Vec<u8>,
}

/// Durable, versioned storage of the signing secret.
///
/// Holds at most two secrets: `current`, and `previous` during the grace
/// window following a rotation. All access goes through
/// [`current_secret`](Self::current_secret) /
/// [`previous_secret`](Self::previous_secret) / [`rotate`](Self::rotate); the
/// pair is never reachable as raw shared state. Backed by a [`KvBackend`] so
/// tests run against [`MemoryBackend`](modhub_storage::MemoryBackend) and
/// production against a real secret service.
pub struct SecretStore {
    backend: Arc<dyn KvBackend>,
    record_key: String,
    rotation_interval: Duration,
    previous_retention: Duration,
    pair: RwLock<Option<PairState>>,
}

impl SecretStore {
    /// Creates a store over the given backend with default settings.
    ///
    /// The first secret is created lazily on first access, or explicitly via
    /// [`load_or_init`](Self::load_or_init).
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            record_key: DEFAULT_RECORD_KEY.to_owned(),
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            previous_retention: DEFAULT_PREVIOUS_RETENTION,
            pair: RwLock::new(None),
        }
    }

    /// Sets the backend key under which the secret record is persisted.
    #[must_use]
    pub fn with_record_key(mut self, key: impl Into<String>) -> Self {
        self.record_key = key.into();
        self
    }

    /// Sets the rotation interval stamped into newly created secrets.
    #[must_use]
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = interval;
        self
    }

    /// Sets how long the previous secret stays accepted after a rotation.
    ///
    /// Must be at least the maximum token lifetime.
    #[must_use]
    pub fn with_previous_retention(mut self, retention: Duration) -> Self {
        self.previous_retention = retention;
        self
    }

    /// Returns the configured rotation interval.
    #[must_use]
    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    /// Loads the persisted secret record, creating and persisting a fresh
    /// secret if none exists yet.
    ///
    /// Safe to call more than once; subsequent calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if the backend cannot be read or the
    /// initial record cannot be persisted.
    #[tracing::instrument(skip(self))]
    pub async fn load_or_init(&self) -> Result<()> {
        if self.pair.read().is_some() {
            return Ok(());
        }

        match self.backend.get(self.record_key.as_bytes()).await? {
            Some(bytes) => {
                let state = self.parse_record(&bytes)?;
                tracing::info!(created_at = %state.current.created_at, "signing secret loaded");
                *self.pair.write() = Some(state);
                Ok(())
            },
            None => {
                let secret = SecretValue::generate();
                let now = Utc::now();
                let record = SecretRecord {
                    secret: secret.clone(),
                    created_at: now,
                    previous_secret: None,
                    previous_created_at: None,
                    rotation_interval_secs: self.rotation_interval.as_secs(),
                };
                let bytes = serde_json::to_vec(&record).map_err(|e| {
                    GuardError::Storage(StorageError::serialization_with_source(
                        "failed to encode secret record",
                        e,
                    ))
                })?;

                match self
                    .backend
                    .compare_and_set(self.record_key.as_bytes(), None, bytes.clone())
                    .await
                {
                    Ok(()) => {
                        tracing::info!("new signing secret generated and persisted");
                        *self.pair.write() = Some(PairState {
                            current: Secret {
                                value: secret,
                                created_at: now,
                                rotation_interval: self.rotation_interval,
                            },
                            previous: None,
                            persisted: bytes,
                        });
                        Ok(())
                    },
                    Err(StorageError::Conflict) => {
                        // Another instance initialized first; adopt its record.
                        self.reload().await
                    },
                    Err(e) => Err(GuardError::Storage(e)),
                }
            },
        }
    }

    /// Returns the current signing secret, initializing the store on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if initialization fails.
    pub async fn current_secret(&self) -> Result<Secret> {
        self.load_or_init().await?;
        let guard = self.pair.read();
        let state = guard.as_ref().ok_or_else(Self::uninitialized)?;
        Ok(state.current.clone())
    }

    /// Returns the previous signing secret, if one is still inside its grace
    /// window.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if initialization fails.
    pub async fn previous_secret(&self) -> Result<Option<Secret>> {
        self.load_or_init().await?;
        let guard = self.pair.read();
        let state = guard.as_ref().ok_or_else(Self::uninitialized)?;

        let Some(previous) = &state.previous else {
            return Ok(None);
        };

        // The grace window runs from the rotation that demoted this secret,
        // i.e. from the current secret's creation.
        let window_end = state.current.created_at
            + chrono::Duration::from_std(self.previous_retention)
                .unwrap_or_else(|_| chrono::Duration::days(1));
        if Utc::now() >= window_end {
            return Ok(None);
        }

        Ok(Some(previous.clone()))
    }

    /// Rotates the signing secret.
    ///
    /// Generates a fresh secret, persists `{new, previous: old}` with
    /// compare-and-set, and atomically swaps the in-memory pair. If another
    /// instance rotated concurrently, its record is adopted instead of
    /// retrying. On persistence failure the old current remains
    /// authoritative and the error is returned for the caller to log; the
    /// scheduled ticker retries on its next tick rather than hot-looping.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if the record cannot be persisted.
    #[tracing::instrument(skip(self))]
    pub async fn rotate(&self) -> Result<Secret> {
        self.load_or_init().await?;

        let (old_current, expected) = {
            let guard = self.pair.read();
            let state = guard.as_ref().ok_or_else(Self::uninitialized)?;
            (state.current.clone(), state.persisted.clone())
        };

        let new_value = SecretValue::generate();
        let now = Utc::now();
        let record = SecretRecord {
            secret: new_value.clone(),
            created_at: now,
            previous_secret: Some(old_current.value.clone()),
            previous_created_at: Some(old_current.created_at),
            rotation_interval_secs: self.rotation_interval.as_secs(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| {
            GuardError::Storage(StorageError::serialization_with_source(
                "failed to encode secret record",
                e,
            ))
        })?;

        match self
            .backend
            .compare_and_set(self.record_key.as_bytes(), Some(expected.as_slice()), bytes.clone())
            .await
        {
            Ok(()) => {
                let new_secret = Secret {
                    value: new_value,
                    created_at: now,
                    rotation_interval: self.rotation_interval,
                };
                *self.pair.write() = Some(PairState {
                    current: new_secret.clone(),
                    previous: Some(old_current),
                    persisted: bytes,
                });
                tracing::info!(rotated_at = %now, "signing secret rotated");
                Ok(new_secret)
            },
            Err(StorageError::Conflict) => {
                tracing::info!("concurrent rotation detected; adopting persisted record");
                self.reload().await?;
                self.current_secret().await
            },
            Err(e) => {
                tracing::warn!(error = %e, "secret rotation failed; current secret unchanged");
                Err(GuardError::Storage(e))
            },
        }
    }

    /// Returns the age of the current secret.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if initialization fails.
    pub async fn secret_age(&self) -> Result<Duration> {
        let current = self.current_secret().await?;
        let age = Utc::now().signed_duration_since(current.created_at);
        Ok(age.to_std().unwrap_or(Duration::ZERO))
    }

    /// Re-reads the persisted record and swaps the in-memory pair.
    async fn reload(&self) -> Result<()> {
        let bytes = self
            .backend
            .get(self.record_key.as_bytes())
            .await?
            .ok_or_else(|| GuardError::Storage(StorageError::not_found(&self.record_key)))?;
        let state = self.parse_record(&bytes)?;
        *self.pair.write() = Some(state);
        Ok(())
    }

    fn parse_record(&self, bytes: &[u8]) -> Result<PairState> {
        let record: SecretRecord = serde_json::from_slice(bytes).map_err(|e| {
            GuardError::Storage(StorageError::serialization_with_source(
                "failed to decode secret record",
                e,
            ))
        })?;

        let interval = Duration::from_secs(record.rotation_interval_secs);
        let previous = record.previous_secret.map(|value| Secret {
            value,
            created_at: record.previous_created_at.unwrap_or(record.created_at),
            rotation_interval: interval,
        });

        Ok(PairState {
            current: Secret { value: record.secret, created_at: record.created_at, rotation_interval: interval },
            previous,
            persisted: bytes.to_vec(),
        })
    }

    fn uninitialized() -> GuardError {
        GuardError::Storage(StorageError::internal("secret store not initialized"))
    }
}

/// Notification emitted after every successful rotation.
///
/// Carried on an in-process broadcast channel; the pipeline itself functions
/// correctly with zero subscribers (downstream verifiers simply observe the
/// new pair on their next verification).
#[derive(Clone, Debug)]
pub struct SecretRotated {
    /// The secret that was demoted to previous.
    pub old: SecretValue,
    /// The newly installed current secret.
    pub new: SecretValue,
    /// When the rotation completed.
    pub rotated_at: DateTime<Utc>,
}

/// Overall rotation health, derived from the current secret's age.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RotationHealth {
    /// The secret is within its expected age.
    Healthy,
    /// The secret is slightly overdue for rotation.
    Warning,
    /// The secret is well past its rotation deadline.
    Error,
}

/// A point-in-time summary of the rotation schedule.
#[derive(Clone, Debug)]
pub struct RotationStatus {
    /// Age of the current secret.
    pub secret_age: Duration,
    /// When the next scheduled rotation is due.
    pub next_rotation_at: DateTime<Utc>,
    /// Health classification by age.
    pub health: RotationHealth,
}

/// Owns the rotation schedule.
///
/// Runs [`SecretStore::rotate`] on a fixed interval from a background task,
/// exposes a manual trigger, and announces each successful rotation on a
/// broadcast channel. A failed rotation attempt is logged and retried on the
/// next scheduled tick, never immediately, so a degraded secret backend is
/// not hammered.
pub struct RotationManager {
    store: Arc<SecretStore>,
    interval: Duration,
    events: broadcast::Sender<SecretRotated>,
    cancel_token: CancellationToken,
    /// Wrapped in `Mutex` so `shutdown()` can take ownership via `&self`.
    ticker_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    rotations_completed: std::sync::atomic::AtomicU64,
    rotations_failed: std::sync::atomic::AtomicU64,
}

impl RotationManager {
    /// Creates a manager over the given store, using the store's rotation
    /// interval as the tick period.
    #[must_use]
    pub fn new(store: Arc<SecretStore>) -> Self {
        let interval = store.rotation_interval();
        let (events, _) = broadcast::channel(16);
        Self {
            store,
            interval,
            events,
            cancel_token: CancellationToken::new(),
            ticker_handle: Mutex::new(None),
            rotations_completed: std::sync::atomic::AtomicU64::new(0),
            rotations_failed: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Subscribes to rotation notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SecretRotated> {
        self.events.subscribe()
    }

    /// Starts the background rotation ticker.
    ///
    /// The first rotation happens one full interval after start, not
    /// immediately. The task stops when [`shutdown`](Self::shutdown) is
    /// called.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> Arc<Self> {
        let manager = Arc::clone(&self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.interval);
            // The first tick fires immediately; consume it so we start with
            // a full interval wait.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("rotation ticker shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = manager.rotate_now().await {
                            // Retry happens on the next scheduled tick.
                            tracing::warn!(error = %err, "scheduled rotation failed");
                        }
                    }
                }
            }
        });

        *self.ticker_handle.lock() = Some(handle);
        self
    }

    /// Rotates immediately, outside the schedule.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if persistence fails; the previous
    /// current secret stays authoritative.
    pub async fn rotate_now(&self) -> Result<Secret> {
        use std::sync::atomic::Ordering;

        match self.store.rotate().await {
            Ok(new_secret) => {
                self.rotations_completed.fetch_add(1, Ordering::Relaxed);

                // After a rotation, previous == the secret that was current.
                if let Ok(Some(old)) = self.store.previous_secret().await {
                    // Send fails only when there are no subscribers, which is
                    // a supported configuration.
                    let _ = self.events.send(SecretRotated {
                        old: old.value,
                        new: new_secret.value.clone(),
                        rotated_at: new_secret.created_at,
                    });
                }

                Ok(new_secret)
            },
            Err(err) => {
                self.rotations_failed.fetch_add(1, Ordering::Relaxed);
                Err(err)
            },
        }
    }

    /// Rotates immediately if the current secret is older than the interval
    /// plus slack. Returns whether a rotation was performed.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if the age cannot be determined or
    /// the rotation fails.
    pub async fn force_rotation_if_stale(&self) -> Result<bool> {
        let age = self.store.secret_age().await?;
        if age > self.interval + STALE_SLACK {
            tracing::warn!(age_secs = age.as_secs(), "signing secret is stale, forcing rotation");
            self.rotate_now().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Returns a point-in-time summary of the rotation schedule.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Storage`] if the store cannot be read.
    pub async fn status(&self) -> Result<RotationStatus> {
        let current = self.store.current_secret().await?;
        let age = Utc::now()
            .signed_duration_since(current.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        let health = if age > self.interval + STALE_SLACK {
            RotationHealth::Error
        } else if age > self.interval + WARN_SLACK {
            RotationHealth::Warning
        } else {
            RotationHealth::Healthy
        };

        let next_rotation_at = current.created_at
            + chrono::Duration::from_std(self.interval).unwrap_or_else(|_| chrono::Duration::minutes(30));

        Ok(RotationStatus { secret_age: age, next_rotation_at, health })
    }

    /// Returns `(completed, failed)` rotation counts since creation.
    #[must_use]
    pub fn rotation_counts(&self) -> (u64, u64) {
        use std::sync::atomic::Ordering;
        (
            self.rotations_completed.load(Ordering::Relaxed),
            self.rotations_failed.load(Ordering::Relaxed),
        )
    }

    /// Stops the background ticker and waits for it to exit.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.ticker_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "rotation ticker task panicked");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use modhub_storage::MemoryBackend;

    use super::*;

    fn test_store(backend: Arc<MemoryBackend>) -> SecretStore {
        SecretStore::new(backend)
            .with_rotation_interval(Duration::from_secs(1800))
            .with_previous_retention(Duration::from_secs(3600))
    }

    #[test]
    fn secret_value_debug_is_redacted() {
        let secret = SecretValue::new("super-secret-material");
        let debug = format!("{secret:?}");
        assert!(!debug.contains("super-secret-material"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn generated_secrets_are_distinct() {
        let a = SecretValue::generate();
        let b = SecretValue::generate();
        assert_ne!(a, b);
        // 64 bytes base64url-encoded without padding
        assert!(a.expose().len() >= 85);
    }

    #[test]
    fn secret_record_serde_round_trip() {
        let record = SecretRecord {
            secret: SecretValue::new("current"),
            created_at: Utc::now(),
            previous_secret: Some(SecretValue::new("previous")),
            previous_created_at: Some(Utc::now()),
            rotation_interval_secs: 1800,
        };
        let json = serde_json::to_string(&record).unwrap();
        let decoded: SecretRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.secret, record.secret);
        assert_eq!(decoded.previous_secret, record.previous_secret);
    }

    #[tokio::test]
    async fn load_or_init_creates_first_secret() {
        let backend = Arc::new(MemoryBackend::new());
        let store = test_store(Arc::clone(&backend));

        store.load_or_init().await.unwrap();
        let current = store.current_secret().await.unwrap();
        assert!(!current.value.expose().is_empty());
        assert!(store.previous_secret().await.unwrap().is_none());

        // The record must be persisted
        let stored = backend.get(DEFAULT_RECORD_KEY.as_bytes()).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn load_or_init_adopts_existing_record() {
        let backend = Arc::new(MemoryBackend::new());

        let first = test_store(Arc::clone(&backend));
        first.load_or_init().await.unwrap();
        let original = first.current_secret().await.unwrap();

        // A second store over the same backend sees the same secret
        let second = test_store(Arc::clone(&backend));
        let adopted = second.current_secret().await.unwrap();
        assert_eq!(adopted.value, original.value);
    }

    #[tokio::test]
    async fn rotate_moves_current_to_previous() {
        let backend = Arc::new(MemoryBackend::new());
        let store = test_store(backend);

        let before = store.current_secret().await.unwrap();
        let after = store.rotate().await.unwrap();

        assert_ne!(before.value, after.value);
        let previous = store.previous_secret().await.unwrap().expect("previous must exist");
        assert_eq!(previous.value, before.value);
        assert_eq!(store.current_secret().await.unwrap().value, after.value);
    }

    #[tokio::test]
    async fn rotate_persists_both_secrets() {
        let backend = Arc::new(MemoryBackend::new());
        let store = test_store(Arc::clone(&backend));
        store.rotate().await.unwrap();

        // A fresh store over the same backend sees the full pair
        let other = test_store(backend);
        let current = other.current_secret().await.unwrap();
        let previous = other.previous_secret().await.unwrap().expect("previous persisted");
        assert_eq!(current.value, store.current_secret().await.unwrap().value);
        assert_ne!(previous.value, current.value);
    }

    #[tokio::test]
    async fn concurrent_rotation_adopts_winner() {
        let backend = Arc::new(MemoryBackend::new());
        let a = Arc::new(test_store(Arc::clone(&backend)));
        let b = Arc::new(test_store(Arc::clone(&backend)));

        // Both instances observe the same initial record
        a.load_or_init().await.unwrap();
        b.load_or_init().await.unwrap();

        // Instance A rotates first; B's CAS precondition is now stale
        let a_secret = a.rotate().await.unwrap();
        let b_secret = b.rotate().await.unwrap();

        // B must have adopted A's record rather than clobbering it
        assert_eq!(b_secret.value, a_secret.value);
        assert_eq!(
            a.current_secret().await.unwrap().value,
            b.current_secret().await.unwrap().value
        );
    }

    #[tokio::test]
    async fn previous_secret_hidden_after_retention() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SecretStore::new(backend)
            .with_rotation_interval(Duration::from_secs(1800))
            .with_previous_retention(Duration::from_millis(30));

        store.rotate().await.unwrap();
        assert!(store.previous_secret().await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            store.previous_secret().await.unwrap().is_none(),
            "previous secret must be discarded after the grace window"
        );
    }

    #[tokio::test]
    async fn manager_manual_rotation_emits_event() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(test_store(backend));
        store.load_or_init().await.unwrap();
        let before = store.current_secret().await.unwrap();

        let manager = RotationManager::new(Arc::clone(&store));
        let mut events = manager.subscribe();

        let new_secret = manager.rotate_now().await.unwrap();
        let event = events.recv().await.unwrap();

        assert_eq!(event.old, before.value);
        assert_eq!(event.new, new_secret.value);
        assert_eq!(manager.rotation_counts(), (1, 0));
    }

    #[tokio::test]
    async fn manager_works_with_zero_subscribers() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(test_store(backend));
        let manager = RotationManager::new(store);

        // No subscribe() call anywhere — rotation must still succeed
        manager.rotate_now().await.unwrap();
        assert_eq!(manager.rotation_counts(), (1, 0));
    }

    #[tokio::test]
    async fn ticker_rotates_on_schedule() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(
            SecretStore::new(backend)
                .with_rotation_interval(Duration::from_millis(40))
                .with_previous_retention(Duration::from_secs(3600)),
        );
        store.load_or_init().await.unwrap();
        let before = store.current_secret().await.unwrap();

        let manager = Arc::new(RotationManager::new(Arc::clone(&store))).spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.shutdown().await;

        let after = store.current_secret().await.unwrap();
        assert_ne!(before.value, after.value, "ticker should have rotated at least once");
        let (completed, _) = manager.rotation_counts();
        assert!(completed >= 1);
    }

    #[tokio::test]
    async fn force_rotation_if_stale_respects_age() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(test_store(backend));
        store.load_or_init().await.unwrap();

        let manager = RotationManager::new(store);

        // Freshly created secret: no forced rotation
        let rotated = manager.force_rotation_if_stale().await.unwrap();
        assert!(!rotated);
        assert_eq!(manager.rotation_counts(), (0, 0));
    }

    #[tokio::test]
    async fn status_reports_healthy_for_fresh_secret() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(test_store(backend));
        let manager = RotationManager::new(store);

        let status = manager.status().await.unwrap();
        assert_eq!(status.health, RotationHealth::Healthy);
        assert!(status.next_rotation_at > Utc::now());
        assert!(status.secret_age < Duration::from_secs(5));
    }
}
