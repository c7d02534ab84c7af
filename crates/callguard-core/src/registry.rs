//! Named breakers and limiters shared across call sites.
//!
//! Build one [`Registry`] at startup, wrap it in an `Arc` and hand it to
//! whatever needs a breaker. It holds no external resources, so dropping it
//! is all the teardown there is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::ResilienceConfig;
use crate::policy::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig,
    RetryPolicy,
};

/// Get-or-create store of circuit breakers and rate limiters, keyed by name.
pub struct Registry {
    default_breaker: CircuitBreakerConfig,
    breaker_overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    default_limiter: Arc<RateLimiter>,
    limiters: HashMap<String, Arc<RateLimiter>>,
    retry: RetryPolicy,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(
            CircuitBreakerConfig::default(),
            RateLimiterConfig::default(),
            RetryPolicy::default(),
        )
    }
}

impl Registry {
    pub fn new(
        breaker: CircuitBreakerConfig,
        limiter: RateLimiterConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            default_breaker: breaker,
            breaker_overrides: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
            default_limiter: Arc::new(RateLimiter::new(limiter)),
            limiters: HashMap::new(),
            retry,
        }
    }

    /// Build from a validated config file.
    pub fn from_config(config: &ResilienceConfig) -> Self {
        let mut registry = Self::new(
            (&config.circuit_breaker).into(),
            (&config.rate_limiter).into(),
            config.retry_policy(),
        );
        for (name, settings) in &config.breakers {
            registry = registry.with_breaker_config(name.clone(), settings.into());
        }
        for (name, settings) in &config.limiters {
            registry = registry.with_limiter(name.clone(), settings.into());
        }
        registry
    }

    /// Use `config` for the breaker called `name` instead of the default.
    pub fn with_breaker_config(
        mut self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.breaker_overrides.insert(name.into(), config);
        self
    }

    /// Register an additional named limiter.
    pub fn with_limiter(mut self, name: impl Into<String>, config: RateLimiterConfig) -> Self {
        self.limiters
            .insert(name.into(), Arc::new(RateLimiter::new(config)));
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The breaker for `name`, created on first use.
    ///
    /// Every call with the same name returns a handle to the same state.
    pub fn breaker(&self, name: &str) -> CircuitBreaker {
        let mut breakers = self.lock();
        if let Some(existing) = breakers.get(name) {
            return existing.clone();
        }
        let config = self
            .breaker_overrides
            .get(name)
            .unwrap_or(&self.default_breaker)
            .clone();
        tracing::debug!(breaker = name, ?config, "registering circuit breaker");
        let breaker = CircuitBreaker::new(name, config);
        breakers.insert(name.to_string(), breaker.clone());
        breaker
    }

    /// The breaker for `name` if one has been created.
    pub fn get_breaker(&self, name: &str) -> Option<CircuitBreaker> {
        self.lock().get(name).cloned()
    }

    /// The default rate limiter.
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.default_limiter)
    }

    /// A named limiter, falling back to the default one.
    pub fn named_limiter(&self, name: &str) -> Arc<RateLimiter> {
        self.limiters
            .get(name)
            .map_or_else(|| self.limiter(), Arc::clone)
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Snapshots of every breaker created so far, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<CircuitBreaker> = self.lock().values().cloned().collect();
        let mut snapshots: Vec<_> = breakers.iter().map(CircuitBreaker::snapshot).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Close every breaker.
    pub fn reset_all(&self) {
        let breakers: Vec<CircuitBreaker> = self.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("breakers", &self.lock().len())
            .field("limiters", &(self.limiters.len() + 1))
            .finish()
    }
}
