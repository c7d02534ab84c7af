//! Policy engine: composable guards for calls to unreliable providers.
//!
//! The recommended stack (see [`crate::pipeline`]):
//! ```text
//! Call → [RateLimiter] → [CircuitBreaker] → [RetryPolicy] → [Operation]
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitState,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{with_retry, RetryPolicy};
