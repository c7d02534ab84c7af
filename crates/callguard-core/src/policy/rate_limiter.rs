//! Sliding-window rate limiter, one window per key.
//!
//! Each key keeps a log of the instants at which requests were granted. A
//! request is admitted if fewer than `max_requests` entries are younger than
//! `period`. Unlike a fixed-window counter, a burst straddling a window
//! boundary can't get through at twice the configured rate.
//!
//! Buckets live in an LRU map. Once it holds `max_keys` buckets, the least
//! recently used one is dropped to make room, but only if its window is
//! empty. A key with live entries is never forgotten, otherwise churn on
//! other keys would hand it a fresh window.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::error::{GuardError, RateLimitExceeded};

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Requests admitted per key within one `period`.
    pub max_requests: u32,
    /// Length of the trailing window.
    pub period: Duration,
    /// Keys kept before idle ones are evicted, least recently used first.
    /// Keys with requests still in their window are never evicted.
    pub max_keys: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            period: Duration::from_secs(60),
            max_keys: 10_000,
        }
    }
}

/// Granted-request log for one key.
#[derive(Debug, Default)]
struct Bucket {
    granted: VecDeque<Instant>,
    /// Set once the bucket has been removed from the map; holders must look
    /// the key up again.
    retired: bool,
}

impl Bucket {
    fn purge(&mut self, now: Instant, period: Duration) {
        while let Some(&oldest) = self.granted.front() {
            if now.duration_since(oldest) > period {
                self.granted.pop_front();
            } else {
                break;
            }
        }
    }

    fn live(&self, now: Instant, period: Duration) -> usize {
        self.granted
            .iter()
            .filter(|&&t| now.duration_since(t) <= period)
            .count()
    }

    /// Time until the oldest live entry leaves the window.
    fn wait_time(&self, now: Instant, period: Duration) -> Duration {
        self.granted
            .iter()
            .find(|&&t| now.duration_since(t) <= period)
            .map_or(Duration::ZERO, |&oldest| {
                (period + Duration::from_nanos(1)).saturating_sub(now.duration_since(oldest))
            })
    }
}

type SharedBucket = Arc<Mutex<Bucket>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe keyed sliding-window rate limiter.
///
/// The key map lock is only held to look a bucket up; admission itself is
/// serialized per key, so callers on different keys don't contend.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<LruCache<String, SharedBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            buckets: Mutex::new(LruCache::unbounded()),
            config,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn bucket(&self, key: &str) -> SharedBucket {
        let mut buckets = lock(&self.buckets);
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }
        self.make_room(&mut buckets);
        let bucket = SharedBucket::default();
        buckets.put(key.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Evict idle buckets from the LRU end until there is room for one more.
    ///
    /// Every lookup that touches a bucket either records a request or finds
    /// the window full, so the least recently used bucket is the first to go
    /// idle. If it is still live the map grows past `max_keys` instead;
    /// `prune_idle` catches idle buckets that are not at the LRU end.
    fn make_room(&self, buckets: &mut LruCache<String, SharedBucket>) {
        let now = Instant::now();
        while buckets.len() >= self.config.max_keys.max(1) {
            let Some((key, bucket)) = buckets.peek_lru() else {
                return;
            };
            {
                let mut bucket = lock(bucket);
                if bucket.live(now, self.config.period) > 0 {
                    tracing::warn!(
                        tracked = buckets.len(),
                        max_keys = self.config.max_keys,
                        "rate limiter over key capacity, least recently used key is still active"
                    );
                    return;
                }
                bucket.retired = true;
            }
            tracing::debug!(key = %key, "idle rate limiter key evicted (LRU)");
            buckets.pop_lru();
        }
    }

    /// Admit or deny one request against `bucket`. `None` if the bucket was
    /// retired after it was looked up.
    fn admit(&self, key: &str, bucket: &SharedBucket) -> Option<bool> {
        let mut bucket = lock(bucket);
        if bucket.retired {
            return None;
        }
        let now = Instant::now();
        bucket.purge(now, self.config.period);

        if bucket.granted.len() < self.config.max_requests as usize {
            bucket.granted.push_back(now);
            Some(true)
        } else {
            tracing::debug!(
                key,
                max_requests = self.config.max_requests,
                "rate limit reached"
            );
            Some(false)
        }
    }

    fn peek(&self, key: &str) -> Option<SharedBucket> {
        lock(&self.buckets).peek(key).cloned()
    }

    /// Try to admit one request for `key`.
    ///
    /// Returns `true` and records the request if the key is under its limit,
    /// `false` otherwise. Never fails.
    pub fn acquire(&self, key: &str) -> bool {
        loop {
            if let Some(granted) = self.admit(key, &self.bucket(key)) {
                return granted;
            }
        }
    }

    /// Requests `key` may still make in the current window. Read-only.
    pub fn get_remaining(&self, key: &str) -> u32 {
        let used = match self.peek(key) {
            Some(bucket) => {
                let bucket = lock(&bucket);
                bucket.live(Instant::now(), self.config.period)
            }
            None => 0,
        };
        self.config.max_requests.saturating_sub(used as u32)
    }

    /// Estimated wait before `key` can be admitted again.
    pub fn wait_time(&self, key: &str) -> Duration {
        let Some(bucket) = self.peek(key) else {
            return Duration::ZERO;
        };
        let bucket = lock(&bucket);
        let now = Instant::now();
        if bucket.live(now, self.config.period) < self.config.max_requests as usize {
            Duration::ZERO
        } else {
            bucket.wait_time(now, self.config.period)
        }
    }

    /// Clear `key`'s window.
    pub fn reset(&self, key: &str) {
        if let Some(bucket) = self.peek(key) {
            lock(&bucket).granted.clear();
        }
    }

    /// Drop buckets with no live entries. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut buckets = lock(&self.buckets);
        let idle: Vec<String> = buckets
            .iter()
            .filter(|(_, b)| {
                let mut b = lock(b);
                b.retired = b.live(now, self.config.period) == 0;
                b.retired
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &idle {
            buckets.pop(key.as_str());
        }
        idle.len()
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        lock(&self.buckets).len()
    }

    /// Admit `key` or fail with [`RateLimitExceeded`].
    pub fn check(&self, key: &str) -> Result<(), RateLimitExceeded> {
        if self.acquire(key) {
            Ok(())
        } else {
            Err(RateLimitExceeded {
                key: key.to_string(),
                retry_after: self.wait_time(key),
            })
        }
    }

    /// Run `op` if `key` is under its limit.
    pub async fn call<T, E, F, Fut>(&self, key: &str, op: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check(key)?;
        op().await.map_err(GuardError::Inner)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}
