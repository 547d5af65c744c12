use std::time::Duration;

use kolibri_queue::BackoffConfig;

/// Per-handler tuning. `Default` matches what most controllers want; see
/// [`HandlerOptions::from_env`] for the environment overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOptions {
    /// Concurrent workers draining the queue.
    pub workers: usize,
    /// Retries after the first failed attempt before an item is dropped.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Upper bound on the initial cache sync; `None` waits until cancelled.
    pub cache_sync_timeout: Option<Duration>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            max_retries: 10,
            backoff: BackoffConfig::default(),
            cache_sync_timeout: Some(Duration::from_secs(120)),
        }
    }
}

fn env<T: std::str::FromStr>(name: &str) -> Option<T> { std::env::var(name).ok().and_then(|s| s.trim().parse().ok()) }

impl HandlerOptions {
    /// Defaults overridden by `KOLIBRI_*` variables. Values that do not parse are ignored.
    pub fn from_env() -> Self {
        let mut o = Self::default();
        if let Some(v) = env::<usize>("KOLIBRI_WORKERS") {
            o.workers = v;
        }
        if let Some(v) = env::<u32>("KOLIBRI_MAX_RETRIES") {
            o.max_retries = v;
        }
        if let Some(v) = env::<u64>("KOLIBRI_BACKOFF_BASE_MS") {
            o.backoff.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env::<u64>("KOLIBRI_BACKOFF_MAX_SECS") {
            o.backoff.max_delay = Duration::from_secs(v);
        }
        if let Some(v) = env::<f64>("KOLIBRI_BUCKET_QPS") {
            o.backoff.bucket_qps = v;
        }
        if let Some(v) = env::<u32>("KOLIBRI_BUCKET_BURST") {
            o.backoff.bucket_burst = v;
        }
        if let Some(v) = env::<u64>("KOLIBRI_CACHE_SYNC_TIMEOUT_SECS") {
            o.cache_sync_timeout = if v == 0 { None } else { Some(Duration::from_secs(v)) };
        }
        o
    }
}
