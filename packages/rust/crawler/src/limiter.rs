//! Per-host token bucket: `crawl_speed` requests per second, burst of one.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use graphloom_shared::{PipelineError, Result};
use url::Url;

/// Keyed rate limiter with one bucket per `host:port`.
pub struct HostLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl HostLimiter {
    /// Build a limiter admitting `requests_per_sec` per host.
    pub fn new(requests_per_sec: f64) -> Result<Self> {
        if !requests_per_sec.is_finite() || requests_per_sec <= 0.0 {
            return Err(PipelineError::validation(format!(
                "crawl speed must be positive, got {requests_per_sec}"
            )));
        }
        let quota = Quota::with_period(Duration::from_secs_f64(1.0 / requests_per_sec))
            .ok_or_else(|| PipelineError::validation("crawl speed period rounds to zero"))?
            .allow_burst(NonZeroU32::MIN);

        Ok(Self {
            limiter: RateLimiter::keyed(quota),
        })
    }

    /// Wait until the URL's host has a token available.
    pub async fn until_ready(&self, url: &Url) {
        self.limiter.until_key_ready(&host_key(url)).await;
    }
}

fn host_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}
