use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;

use crate::ports::{FetchError, FetchResult, HttpFetcher};
use crate::renderer::JsRenderer;

/// Plain `reqwest`-backed HTTP transport, stripped of the rate limiting the
/// teacher's `RateLimitedFetcher` (crawler/fetcher.rs) bundled into the same
/// type — `RateGate` owns that concern now so it can also govern sitemap
/// and robots.txt fetches, not just page fetches.
#[derive(Clone)]
pub struct HttpReqwestFetcher {
    client: Client,
    renderer: Option<JsRenderer>,
}

impl HttpReqwestFetcher {
    pub fn new(timeout_secs: u64, user_agent: &str, renderer: Option<JsRenderer>) -> Self {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .gzip(true)
            .pool_max_idle_per_host(20)
            .build()
            .expect("failed to build HTTP client");

        HttpReqwestFetcher { client, renderer }
    }
}

#[async_trait]
impl HttpFetcher for HttpReqwestFetcher {
    async fn fetch_static(&self, url: &str) -> Result<FetchResult, FetchError> {
        let start = Instant::now();
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else if e.is_redirect() {
                FetchError::TooManyRedirects
            } else {
                FetchError::RequestFailed(e.to_string())
            }
        })?;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();

        let mut headers = HashMap::new();
        for (name, value) in response.headers().iter() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.to_string(), v.to_string());
            }
        }

        let body = response.text().await.map_err(|e| FetchError::RequestFailed(e.to_string()))?;

        Ok(FetchResult {
            status_code,
            body,
            headers,
            final_url,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn fetch_rendered(&self, url: &str) -> Result<FetchResult, FetchError> {
        let Some(renderer) = &self.renderer else {
            return self.fetch_static(url).await;
        };
        let start = Instant::now();
        let rendered = renderer
            .render(url)
            .await
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

        Ok(FetchResult {
            status_code: rendered.status_code,
            body: rendered.html,
            headers: HashMap::new(),
            final_url: url.to_string(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// In-memory fetcher double keyed by exact URL, for deterministic
    /// engine/frontier/pipeline tests that never touch the network.
    pub struct StubFetcher {
        pages: Mutex<HashMap<String, FetchResult>>,
    }

    impl StubFetcher {
        pub fn new() -> Self {
            StubFetcher { pages: Mutex::new(HashMap::new()) }
        }

        pub fn with_page(self, url: &str, status_code: u16, body: &str) -> Self {
            self.pages.lock().unwrap().insert(
                url.to_string(),
                FetchResult {
                    status_code,
                    body: body.to_string(),
                    headers: HashMap::new(),
                    final_url: url.to_string(),
                    elapsed_ms: 1,
                },
            );
            self
        }
    }

    #[async_trait]
    impl HttpFetcher for StubFetcher {
        async fn fetch_static(&self, url: &str) -> Result<FetchResult, FetchError> {
            self.pages
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::RequestFailed(format!("no stub for {url}")))
        }

        async fn fetch_rendered(&self, url: &str) -> Result<FetchResult, FetchError> {
            self.fetch_static(url).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StubFetcher;
    use super::*;

    #[tokio::test]
    async fn test_stub_fetcher_returns_registered_page() {
        let fetcher = StubFetcher::new().with_page("https://example.com", 200, "<html></html>");
        let result = fetcher.fetch_static("https://example.com").await.unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(result.body, "<html></html>");
    }

    #[tokio::test]
    async fn test_stub_fetcher_missing_page_errors() {
        let fetcher = StubFetcher::new();
        let result = fetcher.fetch_static("https://example.com").await;
        assert!(result.is_err());
    }
}
