use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use url::Url;

type DomainLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Error)]
pub enum RateGateError {
    #[error("could not determine host from url: {0}")]
    NoHost(String),
}

struct DomainState {
    limiter: Arc<DomainLimiter>,
    rate_per_second: f64,
    /// Held for the duration of one request against this host, so two
    /// concurrent crawl workers never hit the same domain at once even if
    /// both cleared the token bucket in the same tick.
    host_lock: Arc<Mutex<()>>,
}

/// Per-domain rate limiting plus per-host serialization, generalized from the
/// teacher's `RateLimitedFetcher` (crawler/fetcher.rs) which kept one
/// `governor` limiter per domain but let requests to the same domain race
/// each other. Here `acquire` also takes the host's serialization lock so
/// `Crawl-delay` spacing (set via `set_crawl_delay`) is actually honored
/// between requests, not just rate-limited in aggregate.
pub struct RateGate {
    domains: RwLock<HashMap<String, DomainState>>,
    default_rate_per_second: f64,
}

/// RAII guard: the domain's serialization lock is released when dropped,
/// after the caller's request has completed.
pub struct RateGatePermit {
    _host_guard: tokio::sync::OwnedMutexGuard<()>,
}

impl RateGate {
    pub fn new(default_rate_per_second: f64) -> Self {
        RateGate {
            domains: RwLock::new(HashMap::new()),
            default_rate_per_second: default_rate_per_second.max(0.05),
        }
    }

    fn host_of(url: &str) -> Result<String, RateGateError> {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .ok_or_else(|| RateGateError::NoHost(url.to_string()))
    }

    async fn state_for(&self, host: &str) -> Arc<Mutex<()>> {
        {
            let domains = self.domains.read().await;
            if let Some(state) = domains.get(host) {
                return state.host_lock.clone();
            }
        }
        let mut domains = self.domains.write().await;
        let rate = self.default_rate_per_second;
        let entry = domains.entry(host.to_string()).or_insert_with(|| {
            DomainState {
                limiter: Arc::new(build_limiter(rate)),
                rate_per_second: rate,
                host_lock: Arc::new(Mutex::new(())),
            }
        });
        entry.host_lock.clone()
    }

    /// Block until this host's rate budget allows one more request, then
    /// take the host's serialization lock. Drop the returned permit to
    /// release the host for the next queued request.
    pub async fn acquire(&self, url: &str) -> Result<RateGatePermit, RateGateError> {
        let host = Self::host_of(url)?;
        let host_lock = self.state_for(&host).await;
        let guard = host_lock.lock_owned().await;

        let limiter = {
            let domains = self.domains.read().await;
            domains.get(&host).expect("state_for populated it").limiter.clone()
        };
        limiter.until_ready().await;

        Ok(RateGatePermit { _host_guard: guard })
    }

    /// Apply a `Crawl-delay` directive discovered in robots.txt (spec.md
    /// §4.2) by rebuilding that domain's limiter at the equivalent rate.
    /// A crawl-delay of `d` seconds becomes `1/d` requests/sec, capped below
    /// the configured default so robots.txt can only slow a crawl down.
    pub async fn set_crawl_delay(&self, host: &str, delay: Duration) {
        let delay_secs = delay.as_secs_f64().max(0.01);
        let rate = (1.0 / delay_secs).min(self.default_rate_per_second);
        let mut domains = self.domains.write().await;
        let host_lock = domains
            .get(host)
            .map(|s| s.host_lock.clone())
            .unwrap_or_else(|| Arc::new(Mutex::new(())));
        domains.insert(
            host.to_string(),
            DomainState {
                limiter: Arc::new(build_limiter(rate)),
                rate_per_second: rate,
                host_lock,
            },
        );
    }

    /// Halve a domain's request rate in response to an HTTP 429, per
    /// spec.md §4.2's backoff rule. Never drops below one request per
    /// 5 minutes.
    pub async fn backoff_on_429(&self, url: &str) -> Result<(), RateGateError> {
        let host = Self::host_of(url)?;
        let mut domains = self.domains.write().await;
        if let Some(state) = domains.get_mut(&host) {
            let new_rate = (state.rate_per_second / 2.0).max(1.0 / 300.0);
            state.rate_per_second = new_rate;
            state.limiter = Arc::new(build_limiter(new_rate));
        }
        Ok(())
    }

    pub async fn current_rate(&self, host: &str) -> Option<f64> {
        self.domains.read().await.get(host).map(|s| s.rate_per_second)
    }
}

fn build_limiter(rate_per_second: f64) -> DomainLimiter {
    if rate_per_second >= 1.0 {
        let rate = NonZeroU32::new(rate_per_second.round() as u32).unwrap_or(NonZeroU32::new(1).unwrap());
        RateLimiter::direct(Quota::per_second(rate))
    } else {
        let period = Duration::from_secs_f64(1.0 / rate_per_second);
        RateLimiter::direct(Quota::with_period(period).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_rejects_unparseable_url() {
        let gate = RateGate::new(5.0);
        let result = gate.acquire("not a url").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_acquire_succeeds_for_valid_host() {
        let gate = RateGate::new(5.0);
        let permit = gate.acquire("https://example.com/a").await;
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_backoff_halves_rate() {
        let gate = RateGate::new(4.0);
        let _permit = gate.acquire("https://example.com/a").await.unwrap();
        drop(_permit);
        gate.backoff_on_429("https://example.com/a").await.unwrap();
        let rate = gate.current_rate("example.com").await.unwrap();
        assert!((rate - 2.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_crawl_delay_caps_below_default() {
        let gate = RateGate::new(10.0);
        gate.set_crawl_delay("example.com", Duration::from_secs(2)).await;
        let rate = gate.current_rate("example.com").await.unwrap();
        assert!((rate - 0.5).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_same_host_requests_serialize() {
        let gate = Arc::new(RateGate::new(1000.0));
        let permit1 = gate.acquire("https://example.com/a").await.unwrap();
        let gate2 = gate.clone();
        let handle = tokio::spawn(async move {
            gate2.acquire("https://example.com/b").await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(permit1);
        handle.await.unwrap();
    }
}
