use foreman_core::{CancelSignal, ForemanError, ForemanResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Shortest pause between availability checks. Keeps float rounding from
/// turning a nearly-full bucket into a busy loop.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Shape of one token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum burst size.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_second: f64,
}

impl BucketConfig {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
        }
    }
}

struct Bucket {
    config: BucketConfig,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: BucketConfig, now: Instant) -> Self {
        Self {
            config,
            tokens: config.capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.config.refill_per_second)
            .min(self.config.capacity);
        self.last_refill = now;
    }

    /// Deduct `n` tokens, or report how long until they could be available.
    fn try_take(&mut self, n: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            return Ok(());
        }
        let missing = n - self.tokens;
        let wait = if self.config.refill_per_second > 0.0 {
            Duration::try_from_secs_f64(missing / self.config.refill_per_second).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };
        Err(wait.max(MIN_WAIT))
    }
}

/// Token-bucket limiter keyed by external service identity.
///
/// Every key owns its own bucket behind its own lock, so waiting on one
/// service never holds up callers of another. Refill is computed lazily on
/// each call; there is no background timer.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    default_bucket: Option<BucketConfig>,
}

impl RateLimiter {
    /// Create a limiter with no buckets. Unknown keys are rejected.
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            default_bucket: None,
        }
    }

    /// Auto-provision unknown keys with `config` on first use.
    pub fn with_default_bucket(mut self, config: BucketConfig) -> Self {
        self.default_bucket = Some(config);
        self
    }

    /// Create a limiter from a key -> bucket table.
    pub fn from_config(
        buckets: &HashMap<String, BucketConfig>,
        default_bucket: Option<BucketConfig>,
    ) -> Self {
        let limiter = Self {
            buckets: RwLock::new(HashMap::new()),
            default_bucket,
        };
        for (key, config) in buckets {
            limiter.register(key, *config);
        }
        limiter
    }

    /// Add or replace the bucket for `key`. A replaced bucket starts full.
    pub fn register(&self, key: &str, config: BucketConfig) {
        let bucket = Arc::new(Mutex::new(Bucket::new(config, Instant::now())));
        self.buckets.write().insert(key.to_string(), bucket);
    }

    /// Registered keys.
    pub fn keys(&self) -> Vec<String> {
        self.buckets.read().keys().cloned().collect()
    }

    /// Tokens currently available for `key`, after lazy refill.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let bucket = self.buckets.read().get(key).cloned()?;
        let mut bucket = bucket.lock();
        bucket.refill(Instant::now());
        Some(bucket.tokens)
    }

    /// Take `tokens` from `key`'s bucket, waiting up to `timeout` for them.
    ///
    /// Returns `false` when the deadline passes, the key is unknown, or the
    /// request exceeds the bucket capacity. Nothing is deducted on `false`.
    /// `None` waits indefinitely.
    pub async fn acquire(&self, key: &str, tokens: f64, timeout: Option<Duration>) -> bool {
        self.acquire_inner(key, tokens, timeout, None).await.is_ok()
    }

    /// Like [`acquire`](Self::acquire) but aborts promptly when `cancel` fires,
    /// and reports why it gave up.
    pub async fn acquire_with_cancel(
        &self,
        key: &str,
        tokens: f64,
        timeout: Option<Duration>,
        cancel: &CancelSignal,
    ) -> ForemanResult<()> {
        self.acquire_inner(key, tokens, timeout, Some(cancel)).await
    }

    fn bucket(&self, key: &str) -> Option<Arc<Mutex<Bucket>>> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return Some(Arc::clone(bucket));
        }
        let config = self.default_bucket?;
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key, capacity = config.capacity, "Provisioned default rate-limit bucket");
                Arc::new(Mutex::new(Bucket::new(config, Instant::now())))
            });
        Some(Arc::clone(bucket))
    }

    async fn acquire_inner(
        &self,
        key: &str,
        tokens: f64,
        timeout: Option<Duration>,
        cancel: Option<&CancelSignal>,
    ) -> ForemanResult<()> {
        let Some(bucket) = self.bucket(key) else {
            warn!(key, "Rate limit requested for unknown key");
            return Err(ForemanError::NotFound(format!("rate limit key '{key}'")));
        };

        let capacity = bucket.lock().config.capacity;
        if tokens > capacity {
            warn!(key, tokens, capacity, "Rate limit request exceeds bucket capacity");
            return Err(ForemanError::Validation(format!(
                "requested {tokens} tokens from '{key}' but capacity is {capacity}"
            )));
        }

        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);

        loop {
            let now = Instant::now();
            let wait = match bucket.lock().try_take(tokens, now) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            let wake = match deadline {
                Some(deadline) if now >= deadline => {
                    let waited_ms = now.duration_since(start).as_millis() as u64;
                    debug!(key, waited_ms, "Rate limit wait timed out");
                    return Err(ForemanError::RateLimitTimeout {
                        key: key.to_string(),
                        waited_ms,
                    });
                }
                Some(deadline) => now.checked_add(wait).map_or(deadline, |t| t.min(deadline)),
                None => match now.checked_add(wait) {
                    Some(t) => t,
                    None => now + Duration::from_secs(3600),
                },
            };

            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(wake) => {}
                        _ = cancel.cancelled() => {
                            return Err(ForemanError::Cancelled(format!("rate limit wait on '{key}'")));
                        }
                    }
                }
                None => tokio::time::sleep_until(wake).await,
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
