//! Circuit breaker for the authoritative verification path.
//!
//! When the authoritative backend is unreachable, every verification would
//! otherwise ride the full timeout before failing. The breaker detects
//! sustained failures and fails fast, periodically probing to detect
//! recovery; while it is open, callers fall back to stale cache entries.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐  failure_threshold  ┌──────┐   reset_timeout   ┌──────────┐
//! │ Closed │ ──────reached─────→ │ Open │ ────elapsed────→  │ HalfOpen │
//! └────────┘                     └──────┘ ←──probe fails─── └──────────┘
//!      ↑                                                         │
//!      └──────────────────── probe succeeds ─────────────────────┘
//! ```
//!
//! Exactly one probe is admitted in the half-open state; concurrent
//! requests fast-fail until the probe's outcome is recorded. The
//! open→half-open transition happens lazily on the first check past the
//! deadline and eagerly via the optional background probe timer
//! ([`CircuitBreaker::spawn_probe_timer`]).

use std::time::{Duration, Instant};

use modhub_storage::ConfigError;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Default number of consecutive failures before opening the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default duration the circuit stays open before admitting a probe.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation — all requests pass through.
    Closed,
    /// Requests are rejected immediately. The `Instant` indicates when the
    /// circuit should transition to [`HalfOpen`](CircuitState::HalfOpen).
    Open {
        /// When the circuit becomes eligible for a probe.
        until: Instant,
    },
    /// The next authoritative call is admitted as a probe; everything else
    /// fast-fails until its outcome is recorded.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open { .. } => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: DEFAULT_FAILURE_THRESHOLD, reset_timeout: DEFAULT_RESET_TIMEOUT }
    }
}

#[bon::bon]
impl CircuitBreakerConfig {
    /// Creates a new circuit breaker configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `failure_threshold` is zero
    /// - `reset_timeout` is zero
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_FAILURE_THRESHOLD)] failure_threshold: u32,
        #[builder(default = DEFAULT_RESET_TIMEOUT)] reset_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "failure_threshold",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if reset_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "reset_timeout", value: "0s".into() });
        }
        Ok(Self { failure_threshold, reset_timeout })
    }

    /// Returns the failure threshold.
    #[must_use]
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Returns the reset timeout.
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }
}

/// Internal mutable state protected by a mutex.
#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Whether the single half-open probe slot is taken.
    probe_in_flight: bool,
    config: CircuitBreakerConfig,

    // Metrics counters
    state_transitions: u64,
    fast_fail_count: u64,
    probe_attempts: u64,
}

/// Thread-safe circuit breaker.
///
/// All state is behind a `parking_lot::Mutex` with very short critical
/// sections (no I/O under the lock). The breaker is `Clone` via `Arc`.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: std::sync::Arc<Mutex<Inner>>,
    cancel_token: CancellationToken,
    timer_handle: std::sync::Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

/// A snapshot of circuit breaker metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Current circuit state.
    pub state: CircuitState,
    /// Total number of state transitions since creation.
    pub state_transitions: u64,
    /// Total number of requests rejected due to an open circuit (or an
    /// occupied probe slot).
    pub fast_fail_count: u64,
    /// Total number of half-open probe requests admitted.
    pub probe_attempts: u64,
    /// Current consecutive failure count.
    pub consecutive_failures: u32,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_in_flight: false,
                config,
                state_transitions: 0,
                fast_fail_count: 0,
                probe_attempts: 0,
            })),
            cancel_token: CancellationToken::new(),
            timer_handle: std::sync::Arc::new(Mutex::new(None)),
        }
    }

    /// Checks whether the circuit admits a request.
    ///
    /// Returns `true` if the request should proceed. In the half-open state
    /// exactly one caller receives `true` (the probe); everyone else is
    /// rejected until the probe's outcome is recorded via
    /// [`record_success`](Self::record_success) /
    /// [`record_failure`](Self::record_failure).
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open { until } => {
                if Instant::now() >= until {
                    // Reset timeout elapsed — admit this caller as the probe.
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    inner.state_transitions += 1;
                    inner.probe_attempts += 1;
                    tracing::info!(
                        previous_state = "open",
                        new_state = "half_open",
                        "circuit breaker admitting probe request",
                    );
                    true
                } else {
                    inner.fast_fail_count += 1;
                    false
                }
            },
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.fast_fail_count += 1;
                    false
                } else {
                    inner.probe_in_flight = true;
                    inner.probe_attempts += 1;
                    true
                }
            },
        }
    }

    /// Records a successful authoritative call, potentially closing the
    /// circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                // Any success resets the consecutive failure count.
                inner.consecutive_failures = 0;
            },
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                inner.state_transitions += 1;
                tracing::info!(
                    previous_state = "half_open",
                    new_state = "closed",
                    "circuit breaker closed after successful probe",
                );
            },
            CircuitState::Open { .. } => {
                // No requests are admitted while open; ignore.
            },
        }
    }

    /// Records a failed authoritative call, potentially opening the circuit.
    ///
    /// Only transport-level failures (connection errors, timeouts) should be
    /// recorded. Definitive rejections (bad signature, expired token) mean
    /// the backend is healthy and must not trip the breaker.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= inner.config.failure_threshold {
                    let until = Instant::now() + inner.config.reset_timeout;
                    inner.state = CircuitState::Open { until };
                    inner.state_transitions += 1;
                    tracing::warn!(
                        consecutive_failures = inner.consecutive_failures,
                        reset_timeout_secs = inner.config.reset_timeout.as_secs(),
                        "circuit breaker opened after consecutive failures",
                    );
                }
            },
            CircuitState::HalfOpen => {
                // Probe failed — re-open with a fresh deadline.
                let until = Instant::now() + inner.config.reset_timeout;
                inner.state = CircuitState::Open { until };
                inner.probe_in_flight = false;
                inner.state_transitions += 1;
                tracing::warn!(
                    previous_state = "half_open",
                    new_state = "open",
                    reset_timeout_secs = inner.config.reset_timeout.as_secs(),
                    "circuit breaker re-opened after probe failure",
                );
            },
            CircuitState::Open { .. } => {
                // Already open — no state change needed.
            },
        }
    }

    /// Transitions open→half-open if the reset deadline has passed.
    ///
    /// Unlike [`allow_request`](Self::allow_request), this does not claim
    /// the probe slot; the next caller does. Invoked by the background probe
    /// timer so recovery does not depend on request traffic.
    pub fn tick(&self) {
        let mut inner = self.inner.lock();
        if let CircuitState::Open { until } = inner.state
            && Instant::now() >= until
        {
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
            inner.state_transitions += 1;
            tracing::info!(
                previous_state = "open",
                new_state = "half_open",
                "circuit breaker half-open, awaiting probe",
            );
        }
    }

    /// Starts a background task that calls [`tick`](Self::tick) every
    /// `interval`, decoupling recovery from request traffic.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn spawn_probe_timer(&self, interval: Duration) {
        let breaker = self.clone();
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("breaker probe timer shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        breaker.tick();
                    }
                }
            }
        });

        *self.timer_handle.lock() = Some(handle);
    }

    /// Stops the background probe timer, if running.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.timer_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "breaker probe timer panicked");
            }
        }
    }

    /// Returns the current state of the circuit breaker.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        // Read-only peek: an expired open deadline reads as half-open
        // without claiming the probe slot.
        match inner.state {
            CircuitState::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            other => other,
        }
    }

    /// Returns a snapshot of circuit breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: match inner.state {
                CircuitState::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
                other => other,
            },
            state_transitions: inner.state_transitions,
            fast_fail_count: inner.fast_fail_count,
            probe_attempts: inner.probe_attempts,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn test_config(failure_threshold: u32, reset_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold, reset_timeout }
    }

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(test_config(3, Duration::from_secs(30)));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());

        cb.record_failure(); // 3rd failure hits the threshold
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        assert!(!cb.allow_request());
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new(test_config(3, Duration::from_secs(30)));

        cb.record_failure();
        cb.record_failure();
        cb.record_success(); // Reset

        cb.record_failure();
        cb.record_failure();
        // Still closed — the success reset the count
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn transitions_to_half_open_after_reset_timeout() {
        let cb = CircuitBreaker::new(test_config(1, Duration::from_millis(10)));

        cb.record_failure(); // Opens the circuit
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        assert!(!cb.allow_request());

        std::thread::sleep(Duration::from_millis(15));

        // The next check past the deadline admits the probe
        assert!(cb.allow_request());
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let cb = CircuitBreaker::new(test_config(1, Duration::from_millis(10)));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));

        assert!(cb.allow_request(), "first caller takes the probe slot");
        assert!(!cb.allow_request(), "second caller must fast-fail");
        assert!(!cb.allow_request(), "and so must every later caller");

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn probe_success_closes() {
        let cb = CircuitBreaker::new(test_config(1, Duration::from_millis(10)));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn probe_failure_reopens_with_fresh_deadline() {
        let cb = CircuitBreaker::new(test_config(1, Duration::from_millis(20)));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.allow_request()); // Probe admitted

        cb.record_failure(); // Probe failed
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        assert!(!cb.allow_request(), "fresh deadline must reject immediately");
    }

    #[test]
    fn tick_transitions_without_claiming_probe() {
        let cb = CircuitBreaker::new(test_config(1, Duration::from_millis(10)));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));

        cb.tick();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // The probe slot is still free: the next caller takes it
        assert!(cb.allow_request());
        assert!(!cb.allow_request());
    }

    #[test]
    fn metrics_tracking() {
        let cb = CircuitBreaker::new(test_config(2, Duration::from_millis(10)));

        cb.record_failure();
        cb.record_failure();

        assert!(!cb.allow_request());
        assert!(!cb.allow_request());

        let m = cb.metrics();
        assert!(matches!(m.state, CircuitState::Open { .. }));
        assert_eq!(m.state_transitions, 1); // closed → open
        assert_eq!(m.fast_fail_count, 2);
        assert_eq!(m.consecutive_failures, 2);
    }

    #[test]
    fn full_lifecycle() {
        let cb = CircuitBreaker::new(test_config(2, Duration::from_millis(10)));

        // Phase 1: normal operation
        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);

        // Phase 2: failures open the circuit
        cb.record_failure();
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));

        // Phase 3: wait and probe
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allow_request());

        // Phase 4: probe succeeds → closed
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);

        let m = cb.metrics();
        // closed→open, open→half_open, half_open→closed
        assert_eq!(m.state_transitions, 3);
        assert_eq!(m.probe_attempts, 1);
    }

    #[tokio::test]
    async fn probe_timer_transitions_in_background() {
        let cb = CircuitBreaker::new(test_config(1, Duration::from_millis(20)));
        cb.spawn_probe_timer(Duration::from_millis(10));

        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));

        tokio::time::sleep(Duration::from_millis(60)).await;

        // The timer moved the breaker to half-open without any request
        let inner_state = { cb.inner.lock().state };
        assert_eq!(inner_state, CircuitState::HalfOpen);

        cb.shutdown().await;
    }

    #[test]
    fn config_defaults_pass_validation() {
        let config = CircuitBreakerConfig::builder().build().unwrap();
        assert_eq!(config.failure_threshold(), DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(config.reset_timeout(), DEFAULT_RESET_TIMEOUT);
    }

    #[rstest]
    #[case::zero_failure_threshold("failure_threshold")]
    #[case::zero_reset_timeout("reset_timeout")]
    fn config_zero_field_rejected(#[case] field: &str) {
        let result = match field {
            "failure_threshold" => CircuitBreakerConfig::builder().failure_threshold(0).build(),
            "reset_timeout" => {
                CircuitBreakerConfig::builder().reset_timeout(Duration::ZERO).build()
            },
            _ => unreachable!(),
        };
        assert!(result.is_err(), "{field} = 0 should be rejected");
    }

    #[test]
    fn display_for_circuit_state() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(
            CircuitState::Open { until: Instant::now() + Duration::from_secs(1) }.to_string(),
            "open"
        );
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
