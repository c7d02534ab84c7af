//! Three-state circuit breaker: Closed → Open → Half-Open.
//!
//! State transitions:
//! - `Closed` → `Open`:      consecutive failures reach `failure_threshold`
//! - `Open` → `Half-Open`:   first call attempt after `timeout` has elapsed
//!                           since the last failure (there is no background timer)
//! - `Half-Open` → `Closed`: consecutive probe successes reach `success_threshold`
//! - `Half-Open` → `Open`:   any probe fails
//!
//! The internal lock is held only for the accounting update, never while the
//! guarded operation runs.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{CircuitBreakerOpen, GuardError};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// All requests rejected until `timeout` has passed since the last failure.
    Open,
    /// A limited number of probe requests test whether the dependency recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening.
    pub failure_threshold: u32,
    /// Number of consecutive half-open successes before closing.
    pub success_threshold: u32,
    /// How long to stay open (measured from the last failure) before probing.
    pub timeout: Duration,
    /// Maximum number of half-open probes allowed in flight at once.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 2,
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    probes_in_flight: u32,
    /// Bumped whenever a new evaluation period starts (`HalfOpen`, `Closed`
    /// after recovery, reset). Permits from an earlier period neither release
    /// probe slots nor count as outcomes.
    generation: u64,
}

impl CircuitInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            probes_in_flight: 0,
            generation: 0,
        }
    }
}

/// Point-in-time view of a breaker, for health endpoints and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the most recent failure, if there was one.
    pub since_last_failure_ms: Option<u64>,
}

/// Thread-safe circuit breaker. Clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitInner>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in `Closed` state.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            config,
            inner: Arc::new(Mutex::new(CircuitInner::closed())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        // Every critical section leaves the state consistent, so a panic
        // elsewhere while holding the lock doesn't invalidate it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current state without side effects.
    ///
    /// An expired `Open` breaker keeps reporting `Open` until a call attempt
    /// moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Returns `true` if a call attempted now would be let through.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.timeout_elapsed(&inner),
            CircuitState::HalfOpen => inner.probes_in_flight < self.config.half_open_max_calls,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.lock().success_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.to_string(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            since_last_failure_ms: inner
                .last_failure_time
                .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }

    fn timeout_elapsed(&self, inner: &CircuitInner) -> bool {
        inner
            .last_failure_time
            .map_or(true, |t| t.elapsed() >= self.config.timeout)
    }

    fn retry_after(&self, inner: &CircuitInner) -> Duration {
        inner
            .last_failure_time
            .map_or(Duration::ZERO, |t| self.config.timeout.saturating_sub(t.elapsed()))
    }

    /// Enter a protected region.
    ///
    /// Performs the same admission check as [`call`](Self::call): an open
    /// breaker whose timeout has elapsed moves to `HalfOpen` here. The returned
    /// permit must be settled with [`CircuitPermit::success`],
    /// [`CircuitPermit::failure`] or [`CircuitPermit::record`].
    pub fn enter(&self) -> Result<CircuitPermit, CircuitBreakerOpen> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            if !self.timeout_elapsed(&inner) {
                tracing::debug!(breaker = %self.name, "circuit open, rejecting call");
                return Err(CircuitBreakerOpen {
                    name: self.name.to_string(),
                    retry_after: self.retry_after(&inner),
                });
            }
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.probes_in_flight = 0;
            inner.generation += 1;
            tracing::info!(breaker = %self.name, "circuit breaker → half-open");
        }

        let probe = inner.state == CircuitState::HalfOpen;
        if probe {
            if inner.probes_in_flight >= self.config.half_open_max_calls {
                tracing::debug!(
                    breaker = %self.name,
                    in_flight = inner.probes_in_flight,
                    "half-open probe budget exhausted, rejecting call"
                );
                return Err(CircuitBreakerOpen {
                    name: self.name.to_string(),
                    retry_after: Duration::ZERO,
                });
            }
            inner.probes_in_flight += 1;
        }

        Ok(CircuitPermit {
            breaker: self.clone(),
            admission: Admission {
                generation: inner.generation,
                probe,
            },
            settled: false,
        })
    }

    /// Run `op` under the breaker. Any `Err` counts as a failure.
    ///
    /// Returns [`GuardError::CircuitOpen`] without invoking `op` while the
    /// breaker is open; otherwise the operation's own error is passed through
    /// as [`GuardError::Inner`].
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(op, |_| true).await
    }

    /// Like [`call`](Self::call), but only errors for which
    /// `counts_as_failure` returns `true` are recorded as failures. Other
    /// errors (validation, not-found, ...) are passed through without
    /// touching the counters.
    pub async fn call_classified<T, E, F, Fut, P>(
        &self,
        op: F,
        counts_as_failure: P,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let permit = self.enter()?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                if counts_as_failure(&e) {
                    permit.failure();
                }
                // An unsettled permit only gives back its probe slot.
                Err(GuardError::Inner(e))
            }
        }
    }

    /// Administrative override back to `Closed` with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let generation = inner.generation;
        *inner = CircuitInner::closed();
        inner.generation = generation + 1;
        tracing::info!(breaker = %self.name, "circuit breaker reset → closed");
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        self.on_success(None);
    }

    /// Record a failed request.
    pub fn record_failure(&self) {
        self.on_failure(None);
    }

    fn release_probe(&self, inner: &mut CircuitInner, admission: Option<Admission>) {
        if let Some(a) = admission {
            if a.probe
                && a.generation == inner.generation
                && inner.state == CircuitState::HalfOpen
            {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            }
        }
    }

    /// `None` records against the current period.
    fn is_stale(inner: &CircuitInner, admission: Option<Admission>) -> bool {
        admission.map_or(false, |a| a.generation != inner.generation)
    }

    fn on_success(&self, admission: Option<Admission>) {
        let mut inner = self.lock();
        self.release_probe(&mut inner, admission);
        if Self::is_stale(&inner, admission) {
            tracing::debug!(breaker = %self.name, "ignoring success admitted in an earlier period");
            return;
        }
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.probes_in_flight = 0;
                    inner.generation += 1;
                    tracing::info!(breaker = %self.name, "circuit breaker → closed");
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0; // failures must be consecutive
            }
            CircuitState::Open => {} // late result of a call admitted before opening
        }
    }

    fn on_failure(&self, admission: Option<Admission>) {
        let mut inner = self.lock();
        self.release_probe(&mut inner, admission);
        if Self::is_stale(&inner, admission) {
            // A late failure still says the dependency is down.
            if inner.state == CircuitState::Open {
                inner.last_failure_time = Some(Instant::now());
            }
            tracing::debug!(breaker = %self.name, "ignoring failure admitted in an earlier period");
            return;
        }
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit breaker → open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.probes_in_flight = 0;
                tracing::warn!(breaker = %self.name, "circuit breaker probe failed → open");
            }
            CircuitState::Open => {} // already open; the window restarts from now
        }
    }

    fn on_abandoned(&self, admission: Admission) {
        if admission.probe {
            let mut inner = self.lock();
            self.release_probe(&mut inner, Some(admission));
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Period a permit was admitted in, and whether it holds a probe slot.
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    probe: bool,
}

/// Admission ticket for one call through a [`CircuitBreaker`].
///
/// Dropped without being settled, the permit records a failure if the thread
/// is unwinding from a panic and nothing otherwise, so a cancelled task does
/// not bias the breaker. A permit settled after the breaker has moved on to a
/// new half-open or closed period is ignored.
#[must_use = "settle the permit with success(), failure() or record()"]
pub struct CircuitPermit {
    breaker: CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CircuitPermit {
    /// Returns `true` if this call is a half-open recovery probe.
    pub fn is_probe(&self) -> bool {
        self.admission.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(Some(self.admission));
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(Some(self.admission));
    }

    /// Settle from a result: `Ok` is a success, `Err` a failure.
    pub fn record<T, E>(self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.success(),
            Err(_) => self.failure(),
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if std::thread::panicking() {
            self.breaker.on_failure(Some(self.admission));
        } else {
            self.breaker.on_abandoned(self.admission);
        }
    }
}

impl std::fmt::Debug for CircuitPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("breaker", &self.breaker.name)
            .field("generation", &self.admission.generation)
            .field("probe", &self.admission.probe)
            .finish()
    }
}
