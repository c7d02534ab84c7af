//! Error types for guarded calls.

use std::time::Duration;

use thiserror::Error;

/// The circuit breaker judged its dependency unhealthy and did not attempt the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker open: {name} (retry after {}ms)", .retry_after.as_millis())]
pub struct CircuitBreakerOpen {
    /// Name of the breaker that rejected the call.
    pub name: String,
    /// Time left before the breaker allows a recovery probe.
    pub retry_after: Duration,
}

/// A rate limiter denied the call for `key`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Rate limit exceeded (key: {key}, retry after {}ms)", .retry_after.as_millis())]
pub struct RateLimitExceeded {
    pub key: String,
    /// Time until the oldest request in the window expires.
    pub retry_after: Duration,
}

/// Outcome of a call made through one or more guards.
///
/// `Inner` carries the wrapped operation's own error, untouched, so callers
/// can still match on it after retries are exhausted.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// Rejected by a circuit breaker; the operation was not invoked.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerOpen),

    /// Rejected by a rate limiter; the operation was not invoked.
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    /// The operation itself failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> GuardError<E> {
    /// Returns `true` if a guard refused the call before it reached the operation.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen(_) | Self::RateLimited(_))
    }

    /// Borrow the operation's error, if that is what this is.
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Take the operation's error, if that is what this is.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Suggested back-off for rejections; `None` for operation errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen(e) => Some(e.retry_after),
            Self::RateLimited(e) => Some(e.retry_after),
            Self::Inner(_) => None,
        }
    }
}

/// Errors whose transient/permanent nature the error itself knows.
///
/// This is how a set of "retry exceptions" is expressed: the retry executor
/// only re-invokes an operation when its error says it is retryable.
pub trait Retryable {
    /// Returns `true` if the failure is expected to be temporary.
    fn is_retryable(&self) -> bool;
}

impl<E: Retryable> Retryable for GuardError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Inner(e) => e.is_retryable(),
            // Rejections are fail-fast signals, retrying them defeats the guard.
            Self::CircuitOpen(_) | Self::RateLimited(_) => false,
        }
    }
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
        )
    }
}

impl Retryable for tokio::time::error::Elapsed {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Invalid policy settings or an unreadable configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("Failed to read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Flaky;

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            true
        }
    }

    #[test]
    fn rejections_are_never_retryable() {
        let open: GuardError<Flaky> = CircuitBreakerOpen {
            name: "llm".into(),
            retry_after: Duration::from_secs(3),
        }
        .into();
        assert!(open.is_rejection());
        assert!(!open.is_retryable());
        assert_eq!(open.retry_after(), Some(Duration::from_secs(3)));

        let inner: GuardError<Flaky> = GuardError::Inner(Flaky);
        assert!(!inner.is_rejection());
        assert!(inner.is_retryable());
        assert_eq!(inner.into_inner(), Some(Flaky));
    }

    #[test]
    fn display_messages() {
        let e = RateLimitExceeded {
            key: "customer-7".into(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(
            e.to_string(),
            "Rate limit exceeded (key: customer-7, retry after 1500ms)"
        );

        let wrapped: GuardError<std::io::Error> = GuardError::Inner(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "upstream timed out",
        ));
        assert_eq!(wrapped.to_string(), "upstream timed out");
    }

    #[test]
    fn io_error_classification() {
        use std::io::{Error, ErrorKind};
        assert!(Error::from(ErrorKind::ConnectionReset).is_retryable());
        assert!(!Error::from(ErrorKind::InvalidInput).is_retryable());
    }
}
