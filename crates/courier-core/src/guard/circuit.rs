//! Circuit breaker for protected resources.
//!
//! One breaker guards each outbound dependency (webhook, store, cache) and
//! fails fast while the dependency is down. In the closed state request
//! counts are tracked over a rolling window; the breaker trips once enough
//! requests have been observed and the failure ratio crosses the
//! threshold.
//!
//! # State machine
//!
//! ```text
//! closed ──(≥ min_requests observed AND failure ratio ≥ threshold)──► open
//! open ──(open_timeout elapsed)──► half-open
//! half-open ──(max_requests consecutive successes)──► closed
//! half-open ──(any failure)──► open
//! ```
//!
//! A rejected call surfaces as [`CourierError::CircuitOpen`], which is
//! distinct from a timeout so callers can classify refusals separately
//! from slow dependencies.

use std::{
    fmt,
    future::Future,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::error::{CourierError, Result};

/// Circuit breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Probes allowed while half-open; also the consecutive-success count
    /// required to close again.
    pub max_requests: u32,
    /// Length of the closed-state observation window. Counts reset when
    /// the window rolls over.
    pub interval: Duration,
    /// Time to stay open before allowing half-open probes.
    pub open_timeout: Duration,
    /// Minimum observations in the window before the ratio is considered.
    pub min_requests: u32,
    /// Failure ratio (0.0 to 1.0) that trips the breaker.
    pub failure_ratio: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_requests: 3,
            interval: Duration::from_secs(10),
            open_timeout: Duration::from_secs(30),
            min_requests: 3,
            failure_ratio: 0.6,
        }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, all requests allowed.
    Closed,
    /// Resource unhealthy, requests rejected immediately.
    Open,
    /// Testing recovery with a bounded number of probes.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    requests: u32,
    failures: u32,
    window_started: Instant,
    opened_at: Option<Instant>,
    half_open_requests: u32,
    consecutive_successes: u32,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            requests: 0,
            failures: 0,
            window_started: Instant::now(),
            opened_at: None,
            half_open_requests: 0,
            consecutive_successes: 0,
        }
    }

    fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.failures) / f64::from(self.requests)
        }
    }

    fn reset_counts(&mut self) {
        self.requests = 0;
        self.failures = 0;
        self.half_open_requests = 0;
        self.consecutive_successes = 0;
        self.window_started = Instant::now();
    }
}

/// Circuit breaker guarding a single named resource.
///
/// Safe for concurrent use; the lock is only held for bookkeeping, never
/// across the guarded call itself.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a breaker for the named resource.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self { name: name.into(), config, inner: Mutex::new(BreakerInner::new()) }
    }

    /// The protected resource's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, advancing open → half-open when the timeout expired.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.advance(&mut inner);
        inner.state
    }

    /// Requests permission for one call.
    ///
    /// # Errors
    ///
    /// Returns [`CourierError::CircuitOpen`] while the breaker is open or
    /// the half-open probe budget is spent.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.lock();
        self.advance(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(CourierError::circuit_open(&self.name)),
            CircuitState::HalfOpen => {
                if inner.half_open_requests < self.config.max_requests {
                    inner.half_open_requests += 1;
                    Ok(())
                } else {
                    Err(CourierError::circuit_open(&self.name))
                }
            },
        }
    }

    /// Records a successful call outcome.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.advance(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                inner.requests += 1;
            },
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.max_requests {
                    self.transition_to_closed(&mut inner);
                }
            },
            CircuitState::Open => {},
        }
    }

    /// Records a failed call outcome.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        self.advance(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                inner.requests += 1;
                inner.failures += 1;
                if inner.requests >= self.config.min_requests
                    && inner.failure_ratio() >= self.config.failure_ratio
                {
                    self.transition_to_open(&mut inner);
                }
            },
            CircuitState::HalfOpen => {
                self.transition_to_open(&mut inner);
            },
            CircuitState::Open => {},
        }
    }

    /// Runs an operation under the breaker, recording its outcome.
    ///
    /// # Errors
    ///
    /// Propagates [`CourierError::CircuitOpen`] on rejection, otherwise
    /// the operation's own error.
    pub async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        match op.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            },
            Err(error) => {
                self.record_failure();
                Err(error)
            },
        }
    }

    /// Forces a state, for tests and administrative overrides.
    pub fn force_state(&self, state: CircuitState) {
        let mut inner = self.lock();
        inner.state = state;
        match state {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::Closed | CircuitState::HalfOpen => inner.reset_counts(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned lock only means a panic mid-bookkeeping; the counts
        // are still structurally valid.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn advance(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => {
                if inner.window_started.elapsed() >= self.config.interval {
                    inner.requests = 0;
                    inner.failures = 0;
                    inner.window_started = Instant::now();
                }
            },
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.config.open_timeout);
                if expired {
                    self.transition_to_half_open(inner);
                }
            },
            CircuitState::HalfOpen => {},
        }
    }

    fn transition_to_open(&self, inner: &mut BreakerInner) {
        tracing::warn!(
            resource = %self.name,
            requests = inner.requests,
            failure_ratio = inner.failure_ratio(),
            "circuit breaker opening"
        );
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }

    fn transition_to_half_open(&self, inner: &mut BreakerInner) {
        tracing::info!(resource = %self.name, "circuit breaker half-open, probing");
        inner.state = CircuitState::HalfOpen;
        inner.half_open_requests = 0;
        inner.consecutive_successes = 0;
    }

    fn transition_to_closed(&self, inner: &mut BreakerInner) {
        tracing::info!(resource = %self.name, "circuit breaker closed, resource recovered");
        inner.state = CircuitState::Closed;
        inner.reset_counts();
        inner.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            max_requests: 3,
            interval: Duration::from_millis(100),
            open_timeout: Duration::from_millis(50),
            min_requests: 3,
            failure_ratio: 0.6,
        }
    }

    #[test]
    fn breaker_starts_closed() {
        let breaker = CircuitBreaker::new("test", test_config());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn too_few_observations_never_trip() {
        let breaker = CircuitBreaker::new("test", test_config());

        breaker.record_failure();
        breaker.record_failure();

        // Ratio is 1.0 but only two observations.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn trips_at_minimum_observations_and_ratio() {
        let breaker = CircuitBreaker::new("test", test_config());

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.try_acquire(),
            Err(CourierError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn mixed_outcomes_trip_at_ratio_boundary() {
        let breaker = CircuitBreaker::new("test", test_config());

        breaker.record_success();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        // 4 observations at ratio 0.5: still closed.
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        // 5 observations at ratio 0.6: open.
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn window_rollover_resets_closed_counts() {
        let breaker = CircuitBreaker::new("test", test_config());

        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(120));

        // The previous window's failures no longer count.
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn open_breaker_transitions_to_half_open_after_timeout() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_limits_probe_count() {
        let breaker = CircuitBreaker::new("test", test_config());
        breaker.force_state(CircuitState::HalfOpen);

        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_ok());
        assert!(matches!(
            breaker.try_acquire(),
            Err(CourierError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn half_open_successes_close_the_breaker() {
        let breaker = CircuitBreaker::new("test", test_config());
        breaker.force_state(CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", test_config());
        breaker.force_state(CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn call_records_outcomes() {
        let breaker = CircuitBreaker::new("test", test_config());

        let ok: Result<u32> = breaker.call(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        for _ in 0..3 {
            let _: Result<()> = breaker
                .call(async { Err(CourierError::network("down")) })
                .await;
        }
        // 4 observations, 3 failures: ratio 0.75 trips the breaker.
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected: Result<u32> = breaker.call(async { Ok(7) }).await;
        assert!(matches!(rejected, Err(CourierError::CircuitOpen { .. })));
    }
}
