//! Explicit, ordered composition of guards around an operation.
//!
//! Stages run outermost-first in the order they were added. The order is
//! configuration, not an accident of wrapping: with
//! `rate_limit → circuit_breaker → retry` the breaker sees one outcome per
//! call no matter how many attempts the retry stage made, while
//! `retry → circuit_breaker` records every attempt against the breaker.
//!
//! ```text
//! Pipeline::recommended(registry)
//!   Call → [RateLimiter] → [CircuitBreaker(ctx.resource)] → [RetryPolicy] → [Operation]
//! ```

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{GuardError, Retryable};
use crate::policy::{CircuitBreaker, RateLimiter, RetryPolicy};
use crate::registry::Registry;

/// Derives a rate-limit key from the call context.
pub type KeyFn = Arc<dyn Fn(&CallContext) -> String + Send + Sync>;

/// What a call is about: the protected resource and, optionally, on whose
/// behalf it is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Dependency being called (e.g. `"openai"`); selects per-resource breakers.
    pub resource: String,
    /// Caller identity (user, tenant, API key) for per-subject rate limits.
    pub subject: Option<String>,
}

impl CallContext {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// The subject if set, otherwise the resource.
    pub fn default_key(&self) -> &str {
        self.subject.as_deref().unwrap_or(&self.resource)
    }
}

/// Where a breaker stage gets its breaker from.
#[derive(Clone)]
pub enum BreakerSource {
    /// One breaker for every call through the pipeline.
    Fixed(CircuitBreaker),
    /// `registry.breaker(ctx.resource)` per call.
    PerResource(Arc<Registry>),
}

impl BreakerSource {
    fn resolve(&self, ctx: &CallContext) -> CircuitBreaker {
        match self {
            Self::Fixed(breaker) => breaker.clone(),
            Self::PerResource(registry) => registry.breaker(&ctx.resource),
        }
    }
}

/// One guard in a [`Pipeline`].
#[derive(Clone)]
pub enum Stage {
    RateLimit {
        limiter: Arc<RateLimiter>,
        key_fn: KeyFn,
    },
    CircuitBreaker(BreakerSource),
    Retry(RetryPolicy),
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } => "rate_limit",
            Self::CircuitBreaker(_) => "circuit_breaker",
            Self::Retry(_) => "retry",
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit { limiter, .. } => f
                .debug_struct("RateLimit")
                .field("config", limiter.config())
                .finish_non_exhaustive(),
            Self::CircuitBreaker(BreakerSource::Fixed(breaker)) => {
                f.debug_tuple("CircuitBreaker").field(breaker).finish()
            }
            Self::CircuitBreaker(BreakerSource::PerResource(_)) => {
                f.write_str("CircuitBreaker(per-resource)")
            }
            Self::Retry(policy) => f.debug_tuple("Retry").field(policy).finish(),
        }
    }
}

/// Ordered stack of guards.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Rate limit (default limiter, keyed by [`CallContext::default_key`]) →
    /// per-resource circuit breaker → retry with the registry's policy.
    ///
    /// Retries run inside the breaker, so a call that succeeds after retrying
    /// counts as a single success and a call that exhausts its retries as a
    /// single failure.
    pub fn recommended(registry: Arc<Registry>) -> Self {
        Self::builder()
            .rate_limit(registry.limiter())
            .retry_inside_breaker(registry)
            .build()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Stage labels in execution order, e.g. `"rate_limit → circuit_breaker → retry"`.
    pub fn describe(&self) -> String {
        self.stages
            .iter()
            .map(Stage::label)
            .collect::<Vec<_>>()
            .join(" → ")
    }

    /// Run `op` through every stage. Errors that report themselves as
    /// retryable are retried; every operation error counts against breakers.
    pub async fn call<T, E, F, Fut>(&self, ctx: &CallContext, op: F) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Retryable + Display + Send,
    {
        self.call_classified(ctx, |e: &E| e.is_retryable(), |_: &E| true, op)
            .await
    }

    /// Like [`call`](Self::call) with an explicit transient-error predicate.
    pub async fn call_with<T, E, F, Fut, R>(
        &self,
        ctx: &CallContext,
        is_transient: R,
        op: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Display + Send,
        R: Fn(&E) -> bool + Sync,
    {
        self.call_classified(ctx, is_transient, |_: &E| true, op)
            .await
    }

    /// Fully classified call: `is_transient` decides what the retry stages
    /// re-invoke, `counts_as_failure` what the breaker stages record.
    pub async fn call_classified<T, E, F, Fut, R, B>(
        &self,
        ctx: &CallContext,
        is_transient: R,
        counts_as_failure: B,
        mut op: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Display + Send,
        R: Fn(&E) -> bool + Sync,
        B: Fn(&E) -> bool + Sync,
    {
        let classify = Classify {
            is_transient,
            counts_as_failure,
        };
        self.run(0, ctx, &classify, &mut op).await
    }

    fn run<'a, T, E, F, Fut, R, B>(
        &'a self,
        idx: usize,
        ctx: &'a CallContext,
        classify: &'a Classify<R, B>,
        op: &'a mut F,
    ) -> BoxFuture<'a, Result<T, GuardError<E>>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
        T: Send + 'a,
        E: Display + Send + 'a,
        R: Fn(&E) -> bool + Sync,
        B: Fn(&E) -> bool + Sync,
    {
        async move {
            let Some(stage) = self.stages.get(idx) else {
                return op().await.map_err(GuardError::Inner);
            };

            match stage {
                Stage::RateLimit { limiter, key_fn } => {
                    let key = (key_fn.as_ref())(ctx);
                    if let Err(rejected) = limiter.check(&key) {
                        return Err(GuardError::RateLimited(rejected));
                    }
                    self.run(idx + 1, ctx, classify, op).await
                }
                Stage::CircuitBreaker(source) => {
                    let breaker = source.resolve(ctx);
                    let permit = match breaker.enter() {
                        Ok(permit) => permit,
                        Err(open) => return Err(GuardError::CircuitOpen(open)),
                    };
                    let result = self.run(idx + 1, ctx, classify, op).await;
                    match &result {
                        Ok(_) => permit.success(),
                        Err(GuardError::Inner(e)) if (classify.counts_as_failure)(e) => {
                            permit.failure()
                        }
                        // Rejected further down, or an error the breaker ignores.
                        Err(_) => drop(permit),
                    }
                    result
                }
                Stage::Retry(policy) => {
                    let resource = Some(ctx.resource.as_str());
                    let mut attempt = 0u32;
                    loop {
                        let result = self.run(idx + 1, ctx, classify, &mut *op).await;
                        let delay = match &result {
                            Ok(_) => {
                                policy.on_success(attempt, resource);
                                None
                            }
                            Err(GuardError::Inner(e)) => policy.after_failure(
                                attempt,
                                (classify.is_transient)(e),
                                e,
                                resource,
                            ),
                            // Rejections from inner stages are never retried.
                            Err(_) => None,
                        };
                        match delay {
                            Some(delay) => {
                                tokio::time::sleep(delay).await;
                                attempt += 1;
                            }
                            None => return result,
                        }
                    }
                }
            }
        }
        .boxed()
    }
}

struct Classify<R, B> {
    is_transient: R,
    counts_as_failure: B,
}

/// Builds a [`Pipeline`] one stage at a time, outermost first.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    /// Rate limit keyed by [`CallContext::default_key`].
    pub fn rate_limit(self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limit_by(limiter, |ctx| ctx.default_key().to_string())
    }

    /// Rate limit with a custom key derivation.
    pub fn rate_limit_by<K>(mut self, limiter: Arc<RateLimiter>, key_fn: K) -> Self
    where
        K: Fn(&CallContext) -> String + Send + Sync + 'static,
    {
        self.stages.push(Stage::RateLimit {
            limiter,
            key_fn: Arc::new(key_fn),
        });
        self
    }

    /// Guard every call with the same breaker.
    pub fn circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.stages
            .push(Stage::CircuitBreaker(BreakerSource::Fixed(breaker)));
        self
    }

    /// Guard each call with the registry's breaker for `ctx.resource`.
    pub fn circuit_breaker_per_resource(mut self, registry: Arc<Registry>) -> Self {
        self.stages
            .push(Stage::CircuitBreaker(BreakerSource::PerResource(registry)));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.stages.push(Stage::Retry(policy));
        self
    }

    /// Per-resource breaker followed by the registry's retry policy.
    pub fn retry_inside_breaker(self, registry: Arc<Registry>) -> Self {
        let policy = registry.retry().clone();
        self.circuit_breaker_per_resource(registry).retry(policy)
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
        }
    }
}
