//! Exponential backoff retry policy with optional jitter.
//!
//! Attempt indices are 0-based when computing delays: `delay_for(0)` is the
//! wait after the first failure, before the second invocation. `max_attempts`
//! bounds total invocations, so there are at most `max_attempts - 1` sleeps.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Retryable;

/// Immutable retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total invocations allowed, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub exponential_base: f64,
    /// Scale each delay by a uniform random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that invokes the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay after the failure of 0-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * exp;
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Delay actually slept after `attempt`, with jitter applied if enabled.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }

    /// Returns `true` if another invocation is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// What follows the failure of 0-based `attempt`: `Some(delay)` to sleep
    /// and invoke again, `None` to hand the error back. Logs the decision.
    ///
    /// Shared by [`with_retry`] and the pipeline's retry stage. `resource` is
    /// only used as a log field.
    pub(crate) fn after_failure(
        &self,
        attempt: u32,
        transient: bool,
        error: &impl Display,
        resource: Option<&str>,
    ) -> Option<Duration> {
        if !transient {
            tracing::debug!(resource, attempt = attempt + 1, error = %error, "non-retryable error");
            return None;
        }
        if attempt + 1 >= self.max_attempts.max(1) {
            tracing::error!(
                resource,
                attempts = attempt + 1,
                error = %error,
                "max retries exceeded"
            );
            return None;
        }
        let delay = self.backoff(attempt);
        tracing::warn!(
            resource,
            attempt = attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "retrying call"
        );
        Some(delay)
    }

    /// Log a success on 0-based `attempt`, if it took more than one.
    pub(crate) fn on_success(&self, attempt: u32, resource: Option<&str>) {
        if attempt > 0 {
            tracing::info!(resource, attempts = attempt + 1, "call recovered after retry");
        }
    }

    /// Run `op`, retrying errors that report themselves as retryable.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        with_retry(self, |e: &E| e.is_retryable(), op).await
    }
}

/// Invoke `op`, retrying with backoff while `is_transient` accepts the error
/// and attempts remain.
///
/// Errors `is_transient` rejects are returned at once without using up an
/// attempt. Once attempts are exhausted the last error is returned unchanged.
pub async fn with_retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_transient: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                policy.on_success(attempt, None);
                return Ok(value);
            }
            Err(e) => match policy.after_failure(attempt, is_transient(&e), &e, None) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, PartialEq)]
    enum ProviderError {
        Overloaded(u32),
        BadRequest,
    }

    impl std::fmt::Display for ProviderError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Overloaded(n) => write!(f, "overloaded ({n})"),
                Self::BadRequest => write!(f, "bad request"),
            }
        }
    }

    impl Retryable for ProviderError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Overloaded(_))
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delays_grow_geometrically() {
        let p = policy(5);
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn delay_capped_at_max() {
        let p = RetryPolicy {
            max_delay: Duration::from_millis(500),
            initial_delay: Duration::from_millis(100),
            exponential_base: 10.0,
            ..policy(10)
        };
        assert_eq!(p.delay_for(5), Duration::from_millis(500));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let p = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        for _ in 0..200 {
            let d = p.backoff(1);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2), "d={d:?}");
        }
    }

    #[test]
    fn should_retry_boundary() {
        let p = policy(2);
        assert!(p.should_retry(1));
        assert!(!p.should_retry(2));
    }

    #[test]
    fn after_failure_decides_at_attempt_boundaries() {
        let p = policy(3);
        let err = ProviderError::Overloaded(1);
        assert_eq!(p.after_failure(0, true, &err, None), Some(Duration::from_secs(1)));
        assert_eq!(p.after_failure(1, true, &err, Some("llm")), Some(Duration::from_secs(2)));
        assert_eq!(p.after_failure(2, true, &err, None), None, "third failure is the last");
        assert_eq!(p.after_failure(0, false, &ProviderError::BadRequest, None), None);
        assert_eq!(policy(0).after_failure(0, true, &err, None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .run(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(ProviderError::Overloaded(n))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err(), ProviderError::Overloaded(3));
    }

    #[tokio::test(start_paused = true)]
    async fn delays_between_attempts_follow_policy() {
        let stamps = std::sync::Mutex::new(Vec::new());
        let _ = policy(3)
            .run(|| async {
                stamps.lock().unwrap().push(Instant::now());
                Err::<(), _>(ProviderError::Overloaded(0))
            })
            .await;
        let stamps = stamps.into_inner().unwrap();
        assert_eq!(stamps.len(), 3);
        let tolerance = Duration::from_millis(5);
        let first = stamps[1] - stamps[0];
        let second = stamps[2] - stamps[1];
        assert!(first >= Duration::from_secs(1) && first <= Duration::from_secs(1) + tolerance);
        assert!(second >= Duration::from_secs(2) && second <= Duration::from_secs(2) + tolerance);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_passes_through_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(5)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::BadRequest)
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err(), ProviderError::BadRequest);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_later_attempt() {
        let calls = AtomicU32::new(0);
        let value = policy(3)
            .run(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::Overloaded(1))
                } else {
                    Ok("answer")
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "answer");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_selects_retryable_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), std::io::Error> = with_retry(
            &policy(4),
            |e: &std::io::Error| e.kind() == std::io::ErrorKind::TimedOut,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"))
            },
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_invokes_once() {
        let calls = AtomicU32::new(0);
        let _ = policy(0)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::Overloaded(1))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
