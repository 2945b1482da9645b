//! Per-host request spacing for rate-limited upstream APIs.
//!
//! Wraps any [`Upstream`] with a minimum delay between consecutive requests
//! to the same host. Place it *inside* [`RetryingUpstream`] so that every
//! retry attempt is spaced as well.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use sluice_core::retry::{RetryPolicy, RetryingUpstream};
//! use sluice_core::throttle::{ThrottleConfig, ThrottledUpstream};
//!
//! # use sluice_core::traits::Upstream;
//! # #[derive(Clone)] struct MyUpstream;
//! # impl Upstream for MyUpstream {
//! #     async fn fetch(&self, _: &str) -> Result<serde_json::Value, sluice_core::AppError> { todo!() }
//! # }
//! let throttled = ThrottledUpstream::new(
//!     MyUpstream,
//!     ThrottleConfig::new(Duration::from_millis(250)).with_jitter(Duration::from_millis(100)),
//! );
//! let upstream = RetryingUpstream::new(throttled, RetryPolicy::default());
//! ```
//!
//! [`RetryingUpstream`]: crate::retry::RetryingUpstream

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use url::Url;

use crate::error::AppError;
use crate::traits::Upstream;

/// Configuration for the throttled upstream.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum delay between consecutive requests to the same host.
    pub delay: Duration,

    /// Maximum random jitter added on top of `delay` (uniform [0, jitter]).
    pub jitter: Duration,
}

impl ThrottleConfig {
    /// Create a new config with the given per-host delay and no jitter.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let jitter_ms = rand_jitter_ms(self.jitter.as_millis() as u64);
        self.delay + Duration::from_millis(jitter_ms)
    }
}

/// An [`Upstream`] wrapper that spaces requests per host.
///
/// Concurrent deferred tasks hitting the same host are serialised through
/// the shared last-request map; different hosts do not wait on each other.
#[derive(Clone)]
pub struct ThrottledUpstream<U> {
    inner: U,
    config: ThrottleConfig,
    last_request: Arc<Mutex<HashMap<String, Instant>>>,
}

impl<U: Upstream> ThrottledUpstream<U> {
    pub fn new(inner: U, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            last_request: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Host key of a URL (scheme://host:port).
    fn host_key(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?;
        let port = url
            .port_or_known_default()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        Some(format!("{}://{}{}", url.scheme(), host, port))
    }

    /// Reserve the next request slot for `host` and sleep until it arrives.
    async fn wait_for_host(&self, host: &str) {
        let now = Instant::now();
        let slot = {
            let mut map = self.last_request.lock().await;
            let slot = match map.get(host) {
                Some(&last) => (last + self.config.effective_delay()).max(now),
                None => now,
            };
            // Reserving before sleeping keeps concurrent callers from sharing a slot.
            map.insert(host.to_string(), slot);
            slot
        };

        if slot > now {
            let sleep_duration = slot - now;
            tracing::debug!(
                host = %host,
                sleep_ms = %sleep_duration.as_millis(),
                "Throttling upstream request"
            );
            tokio::time::sleep_until(slot.into()).await;
        }
    }
}

impl<U: Upstream> Upstream for ThrottledUpstream<U> {
    async fn fetch(&self, url: &str) -> Result<serde_json::Value, AppError> {
        if let Some(host) = Self::host_key(url) {
            self.wait_for_host(&host).await;
        }
        self.inner.fetch(url).await
    }
}

// xorshift seeded from the clock; jitter does not need a real RNG.
fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
