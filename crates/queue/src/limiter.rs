//! Retry delay policies for the event queue.

use std::time::Duration;

use kolibri_core::ResourceKey;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Decides how long a failed key waits before it is admitted again.
///
/// `when` is called once per retry and advances the limiter's bookkeeping.
pub trait RateLimiter: Send {
    fn when(&mut self, key: &ResourceKey) -> Duration;
    fn forget(&mut self, key: &ResourceKey);
    fn num_requeues(&self, key: &ResourceKey) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: FxHashMap<ResourceKey, u32>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: FxHashMap::default() }
    }

    /// Delay for the `failures`-th retry without touching any state.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u128.checked_shl(failures).unwrap_or(u128::MAX);
        let nanos = self.base.as_nanos().saturating_mul(factor).min(self.max.as_nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl RateLimiter for ExponentialBackoff {
    fn when(&mut self, key: &ResourceKey) -> Duration {
        let slot = self.failures.entry(key.clone()).or_insert(0);
        let exp = *slot;
        *slot = slot.saturating_add(1);
        self.delay_for(exp)
    }

    fn forget(&mut self, key: &ResourceKey) { self.failures.remove(key); }

    fn num_requeues(&self, key: &ResourceKey) -> u32 { self.failures.get(key).copied().unwrap_or(0) }
}

/// Overall token bucket shared by every key; bounds the aggregate retry rate.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// `qps <= 0` disables the bucket.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps, burst, tokens: burst, last: Instant::now() }
    }
}

impl RateLimiter for TokenBucket {
    fn when(&mut self, _key: &ResourceKey) -> Duration {
        if self.qps <= 0.0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 { Duration::ZERO } else { Duration::from_secs_f64(-self.tokens / self.qps) }
    }

    fn forget(&mut self, _key: &ResourceKey) {}

    fn num_requeues(&self, _key: &ResourceKey) -> u32 { 0 }
}

/// Combines limiters: the longest delay wins, requeue counts take the maximum.
pub struct MaxOf {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOf {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self { Self { limiters } }
}

impl RateLimiter for MaxOf {
    fn when(&mut self, key: &ResourceKey) -> Duration {
        self.limiters.iter_mut().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, key: &ResourceKey) {
        for l in self.limiters.iter_mut() {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Limiter settings. Defaults: 5ms doubling to 1000s per key, 10 qps / 100 burst overall.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub bucket_qps: f64,
    pub bucket_burst: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            bucket_qps: 10.0,
            bucket_burst: 100,
        }
    }
}

impl BackoffConfig {
    pub fn build(&self) -> Box<dyn RateLimiter> {
        Box::new(MaxOf::new(vec![
            Box::new(ExponentialBackoff::new(self.base_delay, self.max_delay)),
            Box::new(TokenBucket::new(self.bucket_qps, self.bucket_burst)),
        ]))
    }
}
