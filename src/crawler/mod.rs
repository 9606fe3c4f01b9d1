pub mod fetcher;
pub mod frontier;
pub mod page_type;
pub mod parser;
pub mod robots;
pub mod security;
pub mod sitemap;

pub use fetcher::HttpReqwestFetcher;
pub use frontier::Frontier;
pub use parser::Parser;
pub use robots::{RobotsCache, RobotsPolicy};

use std::sync::Arc;
use std::time::Duration;

use sha2::Digest;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{CompanyConfig, CrawlMode, ProcessConfig};
use crate::extraction::{extract_entities, merge_entities};
use crate::models::{Checkpoint, Entity, Page, QueuedUrlEntry, StopReason};
use crate::ports::HttpFetcher;
use crate::rate_gate::RateGate;

/// Ties the frontier, fetcher, robots cache, and rate gate together into the
/// single-company crawl loop (spec.md §4.4). Replaces the teacher's
/// `CrawlEngine` (crawler/mod.rs), which fetched one page at a time for a
/// Lighthouse/SEO audit with no frontier or rate-limiting concerns of its
/// own — everything here is new except the "one method orchestrates the
/// collaborators" shape.
pub struct CrawlEngine<F: HttpFetcher> {
    fetcher: Arc<F>,
    rate_gate: Arc<RateGate>,
    robots: Arc<RobotsCache<F>>,
    clock: Arc<dyn Clock>,
    user_agent: String,
}

/// Everything a crawl run produced, handed back to the pipeline for
/// persistence and phase transition.
pub struct CrawlOutcome {
    pub pages: Vec<Page>,
    pub entities: Vec<Entity>,
    pub checkpoint: Checkpoint,
    pub stop_reason: StopReason,
}

impl<F: HttpFetcher> CrawlEngine<F> {
    pub fn new(
        fetcher: Arc<F>,
        rate_gate: Arc<RateGate>,
        robots: Arc<RobotsCache<F>>,
        clock: Arc<dyn Clock>,
        user_agent: String,
    ) -> Self {
        CrawlEngine { fetcher, rate_gate, robots, clock, user_agent }
    }

    /// Run (or resume) a crawl for one company until it hits its page limit,
    /// time limit, or exhausts the frontier. `on_checkpoint` is invoked
    /// periodically per `ProcessConfig::checkpoint_every_pages`/
    /// `checkpoint_every_secs` so the caller can persist progress without
    /// waiting for the whole crawl to finish.
    pub async fn crawl(
        &self,
        company_id: &str,
        start_url: &str,
        config: &CompanyConfig,
        process_config: &ProcessConfig,
        resume: Option<Checkpoint>,
        mut on_checkpoint: impl FnMut(&Checkpoint),
        cancel: &CancellationToken,
    ) -> CrawlOutcome {
        let exclusions: Vec<regex::Regex> = config
            .exclusion_patterns
            .iter()
            .filter_map(|p| regex::Regex::new(p).ok())
            .collect();

        let (mut frontier, crawl_start, mut entities, mut seen_hashes, resume_depth) = match resume {
            Some(ref cp) => (
                Frontier::restore(
                    config.max_depth,
                    &cp.visited,
                    &cp.queued,
                    &cp.external_found,
                    page_type::classify_url,
                ),
                cp.crawl_start,
                Vec::new(),
                std::collections::HashSet::new(),
                cp.current_depth,
            ),
            None => {
                let mut f = Frontier::new(config.max_depth);
                f.seed(&[start_url.to_string()], page_type::classify_url);
                (f, self.clock.now_utc(), Vec::new(), std::collections::HashSet::new(), 0)
            }
        };

        if resume.is_none() {
            if let Some(host) = Self::host_of(start_url) {
                let policy = self.robots.policy_for(&host).await;
                if !policy.sitemaps.is_empty() {
                    let result = sitemap::fetch_sitemap_urls(
                        self.fetcher.as_ref(),
                        &policy.sitemaps,
                        &host,
                        process_config.max_sitemaps,
                        process_config.max_sitemap_urls,
                    )
                    .await;
                    if result.truncated {
                        tracing::debug!(
                            company_id = %company_id,
                            total = result.total_count,
                            kept = result.urls.len(),
                            "sitemap discovery truncated"
                        );
                    }
                    frontier.add_discovered(&result.urls, 1, page_type::classify_url);
                }
            }
        }

        let run_start = self.clock.monotonic_now();
        let mut last_checkpoint_at = run_start;
        let mut pages = Vec::new();
        let mut stop_reason = StopReason::FrontierEmpty;
        let mut max_depth_reached = resume_depth;

        loop {
            if cancel.is_cancelled() {
                stop_reason = StopReason::Paused;
                break;
            }
            if pages.len() as u32 >= config.max_pages {
                stop_reason = StopReason::PageLimit;
                break;
            }
            let elapsed = self.clock.monotonic_now().duration_since(run_start);
            if elapsed >= Duration::from_secs(config.time_limit_sec) {
                stop_reason = StopReason::TimeLimit;
                break;
            }

            let Some((url, depth, page_type)) = frontier.next() else {
                stop_reason = StopReason::FrontierEmpty;
                break;
            };
            max_depth_reached = max_depth_reached.max(depth);

            if exclusions.iter().any(|re| re.is_match(&url)) {
                continue;
            }

            let Some(host) = Self::host_of(&url) else { continue };

            let policy = self.robots.policy_for(&host).await;
            if !policy.is_allowed(&url, &self.user_agent) {
                tracing::debug!(url = %url, "blocked by robots.txt");
                continue;
            }
            if let Some(delay) = policy.crawl_delay {
                self.rate_gate.set_crawl_delay(&host, delay).await;
            }

            let Ok(_permit) = self.rate_gate.acquire(&url).await else { continue };

            let Some(fetched) = self.fetch_with_retry(&url, config.mode).await else { continue };

            if is_pdf(&fetched.body) {
                let page = Page {
                    id: Uuid::new_v4().to_string(),
                    company_id: company_id.to_string(),
                    url: fetched.final_url.clone(),
                    page_type,
                    content_hash: content_hash(&fetched.body),
                    raw_body: None,
                    extracted_text: String::new(),
                    crawled_at: self.clock.now_utc(),
                    is_external: false,
                };
                pages.push(page);
                continue;
            }

            let parsed = Parser::parse(&fetched.body, &fetched.final_url);
            let hash = content_hash(&parsed.text_content);
            let refined_type =
                page_type::classify_with_content(&fetched.final_url, parsed.title.as_deref(), &parsed.headings.all());

            if seen_hashes.insert(hash.clone()) {
                let fresh_entities = extract_entities(&company_id.to_string(), &fetched.final_url, &parsed.text_content);
                merge_entities(&mut entities, fresh_entities);

                pages.push(Page {
                    id: Uuid::new_v4().to_string(),
                    company_id: company_id.to_string(),
                    url: fetched.final_url.clone(),
                    page_type: refined_type,
                    content_hash: hash,
                    raw_body: Some(fetched.body.clone()),
                    extracted_text: parsed.text_content.clone(),
                    crawled_at: self.clock.now_utc(),
                    is_external: false,
                });
            }

            self.queue_links(&mut frontier, config, &host, &parsed, depth);

            let should_checkpoint = pages.len() as u32 % process_config.checkpoint_every_pages.max(1) == 0
                || self.clock.monotonic_now().duration_since(last_checkpoint_at)
                    >= Duration::from_secs(process_config.checkpoint_every_secs);
            if should_checkpoint {
                last_checkpoint_at = self.clock.monotonic_now();
                let cp = self.build_checkpoint(&frontier, crawl_start, entities.len() as u32, max_depth_reached);
                on_checkpoint(&cp);
            }
        }

        let checkpoint = self.build_checkpoint(&frontier, crawl_start, entities.len() as u32, max_depth_reached);
        tracing::info!(
            company_id = %company_id,
            pages = pages.len(),
            entities = entities.len(),
            stop_reason = ?stop_reason,
            "crawl finished"
        );
        CrawlOutcome { pages, entities, checkpoint, stop_reason }
    }

    /// Fetch a URL with bounded retry for transient failures (spec.md §4.4):
    /// 5xx responses, timeouts, and connection failures are retried with
    /// exponential backoff up to 3 attempts; 429 responses back off the
    /// domain's rate and retry rather than dropping the URL outright.
    /// Returns `None` once attempts are exhausted or the failure is
    /// permanent (4xx other than 429, too-many-redirects).
    async fn fetch_with_retry(&self, url: &str, mode: CrawlMode) -> Option<crate::ports::FetchResult> {
        const MAX_ATTEMPTS: u32 = 3;

        for attempt in 1..=MAX_ATTEMPTS {
            let result = match mode {
                CrawlMode::Thorough => self.fetcher.fetch_rendered(url).await,
                CrawlMode::Quick => self.fetcher.fetch_static(url).await,
            };

            match result {
                Ok(fetched) if fetched.status_code == 429 => {
                    tracing::debug!(url = %url, attempt, "rate limited, backing off");
                    let _ = self.rate_gate.backoff_on_429(url).await;
                    if attempt == MAX_ATTEMPTS {
                        return None;
                    }
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                Ok(fetched) if fetched.status_code >= 500 => {
                    if attempt == MAX_ATTEMPTS {
                        tracing::warn!(url = %url, status = fetched.status_code, "giving up after retries");
                        return None;
                    }
                    tracing::debug!(url = %url, status = fetched.status_code, attempt, "transient error, retrying");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                Ok(fetched) if fetched.status_code >= 400 => return None,
                Ok(fetched) => return Some(fetched),
                Err(e) if is_transient_fetch_error(&e) => {
                    if attempt == MAX_ATTEMPTS {
                        tracing::warn!(url = %url, error = %e, "giving up after retries");
                        return None;
                    }
                    tracing::debug!(url = %url, error = %e, attempt, "transient fetch error, retrying");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "fetch failed");
                    return None;
                }
            }
        }
        None
    }

    fn queue_links(
        &self,
        frontier: &mut Frontier,
        config: &CompanyConfig,
        seed_host: &str,
        parsed: &parser::ParsedPage,
        depth: u32,
    ) {
        frontier.add_discovered(&parsed.internal_links, depth + 1, page_type::classify_url);

        if !parsed.pdf_links.is_empty() {
            frontier.add_discovered(&parsed.pdf_links, depth + 1, page_type::classify_url);
        }

        for link in &parsed.external_links {
            let Some(link_host) = Self::host_of(link) else { continue };
            let follow = (link_host.contains("linkedin.com") && config.follow_linkedin)
                || (link_host.contains("twitter.com") || link_host.contains("x.com")) && config.follow_twitter
                || (link_host.contains("facebook.com") && config.follow_facebook);
            if follow {
                frontier.add_discovered(std::slice::from_ref(link), depth + 1, page_type::classify_url);
            } else if link_host != seed_host {
                frontier.record_external(link);
            }
        }
    }

    fn build_checkpoint(
        &self,
        frontier: &Frontier,
        crawl_start: chrono::DateTime<chrono::Utc>,
        entities_count: u32,
        current_depth: u32,
    ) -> Checkpoint {
        Checkpoint {
            visited: frontier.visited_snapshot(),
            queued: frontier.queued_snapshot(),
            external_found: frontier.external_urls(),
            current_depth,
            crawl_start,
            last_checkpoint: self.clock.now_utc(),
            entities_count,
            sections_completed: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    fn host_of(url: &str) -> Option<String> {
        url::Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_lowercase()))
    }
}

/// Cheap heuristic for whether a fetched body is a PDF rather than HTML —
/// no dedicated parser crate, just the standard `%PDF` magic bytes at the
/// start of the document.
fn is_pdf(body: &str) -> bool {
    body.as_bytes().starts_with(b"%PDF")
}

fn content_hash(body: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_transient_fetch_error(error: &crate::ports::FetchError) -> bool {
    matches!(error, crate::ports::FetchError::Timeout | crate::ports::FetchError::RequestFailed(_))
}

fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(200u64.saturating_mul(1u64 << (attempt - 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::crawler::fetcher::test_support::StubFetcher;
    use crate::config::CrawlMode;

    fn company_config() -> CompanyConfig {
        CompanyConfig {
            mode: CrawlMode::Quick,
            max_pages: 10,
            max_depth: 3,
            time_limit_sec: 3600,
            follow_linkedin: false,
            follow_twitter: false,
            follow_facebook: false,
            exclusion_patterns: Vec::new(),
        }
    }

    fn make_engine(fetcher: Arc<StubFetcher>) -> CrawlEngine<StubFetcher> {
        let rate_gate = Arc::new(RateGate::new(1000.0));
        let robots = Arc::new(RobotsCache::new(fetcher.clone()));
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(chrono::Utc::now()));
        CrawlEngine::new(fetcher, rate_gate, robots, clock, "TestBot/1.0".to_string())
    }

    #[tokio::test]
    async fn test_crawl_single_page_no_links() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_page("https://example.com/robots.txt", 404, "")
                .with_page("https://example.com/", 200, "<html><title>Home</title><body>Hello world</body></html>"),
        );
        let engine = make_engine(fetcher);
        let outcome = engine
            .crawl(
                "co1",
                "https://example.com/",
                &company_config(),
                &ProcessConfig::default(),
                None,
                |_| {},
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.pages.len(), 1);
        assert_eq!(outcome.stop_reason, StopReason::FrontierEmpty);
    }

    #[tokio::test]
    async fn test_crawl_follows_internal_links() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_page("https://example.com/robots.txt", 404, "")
                .with_page(
                    "https://example.com/",
                    200,
                    r#"<html><body><a href="https://example.com/about">About</a></body></html>"#,
                )
                .with_page("https://example.com/about", 200, "<html><body>About us</body></html>"),
        );
        let engine = make_engine(fetcher);
        let outcome = engine
            .crawl(
                "co1",
                "https://example.com/",
                &company_config(),
                &ProcessConfig::default(),
                None,
                |_| {},
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.pages.len(), 2);
    }

    #[tokio::test]
    async fn test_crawl_respects_page_limit() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_page("https://example.com/robots.txt", 404, "")
                .with_page(
                    "https://example.com/",
                    200,
                    r#"<html><body><a href="https://example.com/a">A</a></body></html>"#,
                )
                .with_page("https://example.com/a", 200, r#"<html><body><a href="https://example.com/b">B</a></body></html>"#)
                .with_page("https://example.com/b", 200, "<html><body>End</body></html>"),
        );
        let mut config = company_config();
        config.max_pages = 1;
        let engine = make_engine(fetcher);
        let outcome = engine
            .crawl("co1", "https://example.com/", &config, &ProcessConfig::default(), None, |_| {}, &CancellationToken::new())
            .await;

        assert_eq!(outcome.pages.len(), 1);
        assert_eq!(outcome.stop_reason, StopReason::PageLimit);
    }

    #[tokio::test]
    async fn test_crawl_dedupes_identical_content() {
        let duplicate_body = r#"<html><body><a href="https://example.com/mirror">Mirror</a></body></html>"#;
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_page("https://example.com/robots.txt", 404, "")
                .with_page("https://example.com/", 200, duplicate_body)
                .with_page("https://example.com/mirror", 200, duplicate_body),
        );
        let engine = make_engine(fetcher);
        let outcome = engine
            .crawl("co1", "https://example.com/", &company_config(), &ProcessConfig::default(), None, |_| {}, &CancellationToken::new())
            .await;

        assert_eq!(outcome.pages.len(), 1);
    }

    #[tokio::test]
    async fn test_crawl_seeds_frontier_from_sitemap() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_page("https://example.com/robots.txt", 200, "Sitemap: https://example.com/sitemap.xml\n")
                .with_page(
                    "https://example.com/sitemap.xml",
                    200,
                    r#"<urlset><url><loc>https://example.com/from-sitemap</loc></url></urlset>"#,
                )
                .with_page("https://example.com/", 200, "<html><body>Home</body></html>")
                .with_page("https://example.com/from-sitemap", 200, "<html><body>Found via sitemap</body></html>"),
        );
        let engine = make_engine(fetcher);
        let outcome = engine
            .crawl(
                "co1",
                "https://example.com/",
                &company_config(),
                &ProcessConfig::default(),
                None,
                |_| {},
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.pages.iter().any(|p| p.url.contains("from-sitemap")));
    }

    #[tokio::test]
    async fn test_crawl_queues_pdf_links_found_on_page() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_page("https://example.com/robots.txt", 404, "")
                .with_page(
                    "https://example.com/",
                    200,
                    r#"<html><body><a href="https://cdn.example.com/report.pdf">Report</a></body></html>"#,
                )
                .with_page("https://cdn.example.com/report.pdf", 200, "%PDF-1.4 fake body"),
        );
        let engine = make_engine(fetcher);
        let outcome = engine
            .crawl(
                "co1",
                "https://example.com/",
                &company_config(),
                &ProcessConfig::default(),
                None,
                |_| {},
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.pages.iter().any(|p| p.url.contains("report.pdf")));
    }

    #[tokio::test]
    async fn test_crawl_extracts_entities() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_page("https://example.com/robots.txt", 404, "")
                .with_page("https://example.com/", 200, "<html><body>Contact: hello@example.com</body></html>"),
        );
        let engine = make_engine(fetcher);
        let outcome = engine
            .crawl("co1", "https://example.com/", &company_config(), &ProcessConfig::default(), None, |_| {}, &CancellationToken::new())
            .await;

        assert!(outcome.entities.iter().any(|e| e.value == "hello@example.com"));
    }

    #[tokio::test]
    async fn test_crawl_dedupes_by_normalized_text_across_different_markup() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_page("https://example.com/robots.txt", 404, "")
                .with_page(
                    "https://example.com/",
                    200,
                    r#"<html><body><p>Same content here</p><a href="https://example.com/mirror">Mirror</a></body></html>"#,
                )
                .with_page("https://example.com/mirror", 200, "<html><body><div><span>Same content here</span></div></body></html>"),
        );
        let engine = make_engine(fetcher);
        let outcome = engine
            .crawl("co1", "https://example.com/", &company_config(), &ProcessConfig::default(), None, |_| {}, &CancellationToken::new())
            .await;

        assert_eq!(outcome.pages.len(), 1);
    }

    #[tokio::test]
    async fn test_crawl_stops_early_when_cancelled() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_page("https://example.com/robots.txt", 404, "")
                .with_page("https://example.com/", 200, "<html><body>Hello</body></html>"),
        );
        let engine = make_engine(fetcher);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = engine
            .crawl("co1", "https://example.com/", &company_config(), &ProcessConfig::default(), None, |_| {}, &cancel)
            .await;

        assert_eq!(outcome.pages.len(), 0);
        assert_eq!(outcome.stop_reason, StopReason::Paused);
    }

    #[tokio::test]
    async fn test_crawl_drops_permanent_4xx_without_retry() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .with_page("https://example.com/robots.txt", 404, "")
                .with_page("https://example.com/", 404, "not found"),
        );
        let engine = make_engine(fetcher);
        let outcome = engine
            .crawl("co1", "https://example.com/", &company_config(), &ProcessConfig::default(), None, |_| {}, &CancellationToken::new())
            .await;

        assert_eq!(outcome.pages.len(), 0);
        assert_eq!(outcome.stop_reason, StopReason::FrontierEmpty);
    }
}
