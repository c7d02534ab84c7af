//! callguard-core: guards for calls to unreliable, rate-limited or slow providers.
//!
//! # Overview
//!
//! Three independent primitives, usable alone or stacked around any async
//! operation:
//!
//! - [`CircuitBreaker`]: per-resource health tracking that fails fast while a
//!   dependency is unhealthy and probes for recovery
//! - [`RateLimiter`]: per-key sliding-window throttling
//! - [`RetryPolicy`] / [`with_retry`]: bounded exponential backoff with jitter
//!   for transient errors
//!
//! plus the glue to use them together:
//!
//! - [`Registry`]: named breakers and limiters, built once at startup
//! - [`Pipeline`]: explicit, ordered composition of the three
//! - [`config`] module: serde file format for all of the above
//! - [`GuardError`]: rejection signals alongside the operation's own error

pub mod config;
pub mod error;
pub mod pipeline;
pub mod policy;
pub mod registry;

pub use config::{LogConfig, ResilienceConfig};
pub use error::{CircuitBreakerOpen, ConfigError, GuardError, RateLimitExceeded, Retryable};
pub use pipeline::{CallContext, Pipeline, PipelineBuilder, Stage};
pub use policy::{
    with_retry, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitPermit,
    CircuitState, RateLimiter, RateLimiterConfig, RetryPolicy,
};
pub use registry::Registry;
