use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use super::TransientError;

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure share of the window at which the breaker opens.
    pub failure_rate_threshold: f64,
    /// Number of most recent calls considered.
    pub window_size: usize,
    /// Calls required in the window before the rate is evaluated.
    pub minimum_calls: usize,
    /// How long the breaker stays open before admitting probes.
    pub open_duration: Duration,
    /// Probes admitted while half-open; all must succeed to close.
    pub half_open_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            window_size: 10,
            minimum_calls: 3,
            open_duration: Duration::from_secs(30),
            half_open_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The call was rejected without being attempted.
    #[error("circuit breaker is open")]
    Open,

    #[error("{0}")]
    Inner(E),
}

impl<E: TransientError> TransientError for BreakerError<E> {
    fn is_transient(&self) -> bool {
        match self {
            BreakerError::Open => false,
            BreakerError::Inner(e) => e.is_transient(),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// `true` marks a failed call.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probes_in_flight: usize,
    probe_successes: usize,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            probes_in_flight: 0,
            probe_successes: 0,
        }
    }
}

/// Count-based sliding-window circuit breaker.
///
/// Only transient failures count. A rejected request from the gateway means
/// the gateway is up, so it is recorded as a success.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Arc::new(Mutex::new(BreakerState::closed())),
        }
    }

    /// Current state, moving `Open` to `HalfOpen` once the open window has passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.state.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Runs `op` if the breaker admits it and records the outcome.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TransientError,
    {
        let mut permit = self.acquire().ok_or_else(|| {
            metrics::counter!("circuit_breaker_rejected", "breaker" => self.name).increment(1);
            BreakerError::Open
        })?;

        let result = op().await;
        let failed = matches!(&result, Err(e) if e.is_transient());
        permit.complete(failed);
        result.map_err(BreakerError::Inner)
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.open_duration
        {
            tracing::info!(breaker = self.name, "circuit breaker half-open");
            inner.state = CircuitState::HalfOpen;
            inner.probes_in_flight = 0;
            inner.probe_successes = 0;
        }
    }

    fn acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.state.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Some(Permit {
                breaker: self,
                probe: false,
                done: false,
            }),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if inner.probes_in_flight + inner.probe_successes >= self.config.half_open_calls {
                    return None;
                }
                inner.probes_in_flight += 1;
                Some(Permit {
                    breaker: self,
                    probe: true,
                    done: false,
                })
            }
        }
    }

    fn record(&self, probe: bool, failed: bool) {
        let mut inner = self.state.lock();

        match (inner.state, probe) {
            (CircuitState::HalfOpen, true) => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                if failed {
                    self.open(&mut inner);
                } else {
                    inner.probe_successes += 1;
                    if inner.probe_successes >= self.config.half_open_calls {
                        tracing::info!(breaker = self.name, "circuit breaker closed");
                        *inner = BreakerState::closed();
                    }
                }
            }
            (CircuitState::Closed, false) => {
                inner.window.push_back(failed);
                while inner.window.len() > self.config.window_size {
                    inner.window.pop_front();
                }

                let calls = inner.window.len();
                let failures = inner.window.iter().filter(|f| **f).count();
                if calls >= self.config.minimum_calls
                    && failures as f64 / calls as f64 >= self.config.failure_rate_threshold
                {
                    self.open(&mut inner);
                }
            }
            // The state moved on while the call was in flight.
            _ => {}
        }
    }

    fn release(&self) {
        let mut inner = self.state.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        tracing::warn!(breaker = self.name, "circuit breaker opened");
        metrics::counter!("circuit_breaker_opened", "breaker" => self.name).increment(1);
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.window.clear();
        inner.probes_in_flight = 0;
        inner.probe_successes = 0;
    }
}

/// Admission for one call. A probe dropped before completing (its future was
/// cancelled) gives its slot back.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    done: bool,
}

impl Permit<'_> {
    fn complete(&mut self, failed: bool) {
        self.done = true;
        self.breaker.record(self.probe, failed);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.done && self.probe {
            self.breaker.release();
        }
    }
}
