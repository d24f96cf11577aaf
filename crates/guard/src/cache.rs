//! Two-tier identity cache.
//!
//! Verified identity contexts are cached keyed by token fingerprint so the
//! hot path rarely pays for full verification:
//!
//! ```text
//! lookup → L1 (in-process map, ttl t1)
//!        → miss? L2 (shared KvBackend, ttl t2 > t1) → repopulate L1
//!        → miss? caller verifies authoritatively and put()s the result
//! ```
//!
//! # Degradation
//!
//! - L2 read/write failures degrade to a miss/no-op with a warning and a metric — the shared tier
//!   is an accelerator, never a correctness dependency.
//! - Entries past `l1_ttl` are not served normally, but remain readable through
//!   [`TierCache::get_stale`] until the sweeper evicts them — the circuit-breaker-open fallback.
//!   The `stale_ttl` bound caps how long that window lasts.
//!
//! # Concurrency
//!
//! The L1 map sits behind a [`parking_lot::Mutex`] with short critical
//! sections; the lock is never held across an await. Population races
//! resolve last-write-wins — duplicate verification work is acceptable and
//! bounded by the rate limiter.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use modhub_storage::{ConfigError, KvBackend};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{fingerprint::TokenFingerprint, token::IdentityContext};

/// Default L1 capacity.
const DEFAULT_L1_CAPACITY: usize = 1_000;

/// Default L1 TTL (5 minutes).
const DEFAULT_L1_TTL: Duration = Duration::from_secs(300);

/// Default L2 TTL (15 minutes).
const DEFAULT_L2_TTL: Duration = Duration::from_secs(900);

/// Default bound on how long an expired L1 entry stays readable as stale
/// fallback (1 hour).
const DEFAULT_STALE_TTL: Duration = Duration::from_secs(3_600);

/// Default sweep interval for the background eviction task.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum allowed TTL.
const MIN_TTL: Duration = Duration::from_secs(1);

/// Key prefix for identity contexts in the shared tier.
const L2_KEY_PREFIX: &str = "idctx:";

/// Configuration for [`TierCache`].
///
/// # Validation
///
/// - `l1_capacity` must be >= 1
/// - `l1_ttl` must be >= 1 second
/// - `l2_ttl` must be greater than `l1_ttl`
/// - `stale_ttl` must be >= `l1_ttl`
#[derive(Clone, Debug)]
pub struct TierCacheConfig {
    l1_capacity: usize,
    l1_ttl: Duration,
    l2_ttl: Duration,
    stale_ttl: Duration,
    sweep_interval: Duration,
}

impl TierCacheConfig {
    /// Starts building a configuration from the defaults.
    #[must_use]
    pub fn builder() -> TierCacheConfigBuilder {
        TierCacheConfigBuilder {
            l1_capacity: DEFAULT_L1_CAPACITY,
            l1_ttl: DEFAULT_L1_TTL,
            l2_ttl: DEFAULT_L2_TTL,
            stale_ttl: DEFAULT_STALE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Returns the L1 capacity.
    #[must_use]
    pub fn l1_capacity(&self) -> usize {
        self.l1_capacity
    }

    /// Returns the L1 TTL.
    #[must_use]
    pub fn l1_ttl(&self) -> Duration {
        self.l1_ttl
    }

    /// Returns the L2 TTL.
    #[must_use]
    pub fn l2_ttl(&self) -> Duration {
        self.l2_ttl
    }

    /// Returns the stale-retention bound.
    #[must_use]
    pub fn stale_ttl(&self) -> Duration {
        self.stale_ttl
    }
}

impl Default for TierCacheConfig {
    fn default() -> Self {
        // The defaults satisfy every validation rule.
        Self {
            l1_capacity: DEFAULT_L1_CAPACITY,
            l1_ttl: DEFAULT_L1_TTL,
            l2_ttl: DEFAULT_L2_TTL,
            stale_ttl: DEFAULT_STALE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Builder for [`TierCacheConfig`].
#[derive(Debug)]
pub struct TierCacheConfigBuilder {
    l1_capacity: usize,
    l1_ttl: Duration,
    l2_ttl: Duration,
    stale_ttl: Duration,
    sweep_interval: Duration,
}

impl TierCacheConfigBuilder {
    /// Sets the maximum number of L1 entries.
    #[must_use]
    pub fn l1_capacity(mut self, capacity: usize) -> Self {
        self.l1_capacity = capacity;
        self
    }

    /// Sets the L1 TTL.
    #[must_use]
    pub fn l1_ttl(mut self, ttl: Duration) -> Self {
        self.l1_ttl = ttl;
        self
    }

    /// Sets the L2 TTL. Must be greater than the L1 TTL.
    #[must_use]
    pub fn l2_ttl(mut self, ttl: Duration) -> Self {
        self.l2_ttl = ttl;
        self
    }

    /// Sets how long expired L1 entries stay readable as stale fallback.
    #[must_use]
    pub fn stale_ttl(mut self, ttl: Duration) -> Self {
        self.stale_ttl = ttl;
        self
    }

    /// Sets the background sweep interval.
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Builds the configuration, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any field violates the rules documented on
    /// [`TierCacheConfig`].
    pub fn build(self) -> Result<TierCacheConfig, ConfigError> {
        if self.l1_capacity == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "l1_capacity",
                min: "1".to_owned(),
                value: "0".to_owned(),
            });
        }
        if self.l1_ttl < MIN_TTL {
            return Err(ConfigError::BelowMinimum {
                field: "l1_ttl",
                min: "1s".to_owned(),
                value: format!("{}ms", self.l1_ttl.as_millis()),
            });
        }
        if self.l2_ttl <= self.l1_ttl {
            return Err(ConfigError::Inconsistent {
                field: "l2_ttl",
                relation: "greater than",
                other: "l1_ttl",
            });
        }
        if self.stale_ttl < self.l1_ttl {
            return Err(ConfigError::Inconsistent {
                field: "stale_ttl",
                relation: "at least",
                other: "l1_ttl",
            });
        }
        if self.sweep_interval < MIN_TTL {
            return Err(ConfigError::BelowMinimum {
                field: "sweep_interval",
                min: "1s".to_owned(),
                value: format!("{}ms", self.sweep_interval.as_millis()),
            });
        }
        Ok(TierCacheConfig {
            l1_capacity: self.l1_capacity,
            l1_ttl: self.l1_ttl,
            l2_ttl: self.l2_ttl,
            stale_ttl: self.stale_ttl,
            sweep_interval: self.sweep_interval,
        })
    }
}

/// A resolved identity held in L1.
#[derive(Clone, Debug)]
struct CacheEntry {
    context: IdentityContext,
    cached_at: Instant,
    access_count: u64,
}

/// Counters tracked by the cache.
#[derive(Debug, Default)]
struct CacheCounters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    evictions: AtomicU64,
    store_errors: AtomicU64,
}

/// Snapshot of cache metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    /// Fresh hits served from the in-process tier.
    pub l1_hits: u64,
    /// Hits served from the shared tier (and repopulated into L1).
    pub l2_hits: u64,
    /// Lookups that missed both tiers.
    pub misses: u64,
    /// Expired entries served as degraded fallback.
    pub stale_hits: u64,
    /// L1 entries evicted under capacity pressure.
    pub evictions: u64,
    /// Shared-tier operations that failed and were absorbed.
    pub store_errors: u64,
}

/// Two-level cache mapping token fingerprints to resolved identities.
///
/// See the [module docs](self) for the lookup and degradation rules.
pub struct TierCache {
    l1: Mutex<HashMap<String, CacheEntry>>,
    shared: Arc<dyn KvBackend>,
    config: TierCacheConfig,
    counters: CacheCounters,
    cancel_token: CancellationToken,
    /// Wrapped in `Mutex` so `shutdown()` can take ownership via `&self`.
    sweep_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TierCache {
    /// Creates a cache over the given shared tier.
    #[must_use]
    pub fn new(shared: Arc<dyn KvBackend>, config: TierCacheConfig) -> Self {
        Self {
            l1: Mutex::new(HashMap::new()),
            shared,
            config,
            counters: CacheCounters::default(),
            cancel_token: CancellationToken::new(),
            sweep_handle: Mutex::new(None),
        }
    }

    /// Starts the background sweep task that evicts L1 entries older than
    /// the stale-retention bound.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn spawn_sweeper(self: Arc<Self>) -> Arc<Self> {
        let cache = Arc::clone(&self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.sweep_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("cache sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.sweep_expired();
                    }
                }
            }
        });

        *self.sweep_handle.lock() = Some(handle);
        self
    }

    /// Looks up a fresh identity for the fingerprint.
    ///
    /// L1 first; on miss, L2 — an L2 hit repopulates L1. Returns `None` on a
    /// total miss (the caller performs authoritative verification and calls
    /// [`put`](Self::put)). Never returns stale entries; see
    /// [`get_stale`](Self::get_stale).
    #[tracing::instrument(skip_all, fields(fp = %fingerprint))]
    pub async fn get(&self, fingerprint: &TokenFingerprint) -> Option<IdentityContext> {
        // L1
        {
            let mut l1 = self.l1.lock();
            if let Some(entry) = l1.get_mut(fingerprint.as_str())
                && entry.cached_at.elapsed() <= self.config.l1_ttl
            {
                entry.access_count += 1;
                self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(tier = "L1", "cache hit");
                return Some(entry.context.clone());
            }
        }

        // L2
        match self.shared.get(self.l2_key(fingerprint).as_bytes()).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<IdentityContext>(&bytes) {
                Ok(context) => {
                    self.insert_l1(fingerprint, context.clone());
                    self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(tier = "L2", "cache hit — repopulated L1");
                    Some(context)
                },
                Err(err) => {
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %err, "discarding undecodable shared-tier entry");
                    None
                },
            },
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
            Err(err) => {
                // The shared tier being down is a miss, not a failure.
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "shared cache tier unavailable, treating as miss");
                None
            },
        }
    }

    /// Returns the L1 entry for the fingerprint regardless of freshness.
    ///
    /// Used only as a degraded fallback while the authoritative path is
    /// unreachable. Entries remain readable until the sweeper evicts them at
    /// the stale-retention bound.
    #[must_use]
    pub fn get_stale(&self, fingerprint: &TokenFingerprint) -> Option<IdentityContext> {
        let mut l1 = self.l1.lock();
        let entry = l1.get_mut(fingerprint.as_str())?;
        entry.access_count += 1;
        self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(fp = %fingerprint, "serving stale cache entry");
        Some(entry.context.clone())
    }

    /// Writes a verified identity to both tiers.
    ///
    /// Concurrent puts for the same fingerprint resolve last-write-wins.
    #[tracing::instrument(skip_all, fields(fp = %fingerprint))]
    pub async fn put(&self, fingerprint: &TokenFingerprint, context: IdentityContext) {
        self.insert_l1(fingerprint, context.clone());

        match serde_json::to_vec(&context) {
            Ok(bytes) => {
                if let Err(err) = self
                    .shared
                    .set_with_ttl(self.l2_key(fingerprint).into_bytes(), bytes, self.config.l2_ttl)
                    .await
                {
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %err, "failed to write shared cache tier");
                }
            },
            Err(err) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "failed to encode identity context");
            },
        }
    }

    /// Removes the fingerprint from both tiers.
    pub async fn invalidate(&self, fingerprint: &TokenFingerprint) {
        self.l1.lock().remove(fingerprint.as_str());
        if let Err(err) = self.shared.delete(self.l2_key(fingerprint).as_bytes()).await {
            self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %err, "failed to invalidate shared cache tier");
        }
    }

    /// Returns the current number of L1 entries (fresh and stale).
    #[must_use]
    pub fn l1_len(&self) -> usize {
        self.l1.lock().len()
    }

    /// Returns a snapshot of the cache metrics.
    #[must_use]
    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
        }
    }

    /// Stops the background sweeper and waits for it to exit.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.sweep_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "cache sweeper task panicked");
            }
        }
    }

    fn l2_key(&self, fingerprint: &TokenFingerprint) -> String {
        format!("{L2_KEY_PREFIX}{fingerprint}")
    }

    /// Inserts into L1, evicting the entry with the oldest `cached_at` when
    /// at capacity.
    fn insert_l1(&self, fingerprint: &TokenFingerprint, context: IdentityContext) {
        let mut l1 = self.l1.lock();

        if l1.len() >= self.config.l1_capacity && !l1.contains_key(fingerprint.as_str()) {
            let oldest = l1
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                l1.remove(&key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        l1.insert(
            fingerprint.as_str().to_owned(),
            CacheEntry { context, cached_at: Instant::now(), access_count: 1 },
        );
    }

    /// Removes L1 entries older than the stale-retention bound.
    fn sweep_expired(&self) {
        let mut l1 = self.l1.lock();
        let before = l1.len();
        l1.retain(|_, entry| entry.cached_at.elapsed() <= self.config.stale_ttl);
        let removed = before - l1.len();
        if removed > 0 {
            tracing::debug!(removed, "cache sweep evicted stale entries");
        }
    }
}
