use std::collections::HashSet;

use regex::Regex;
use url::Url;

use crate::ports::HttpFetcher;

/// Result of fetching and parsing sitemaps for a domain.
#[derive(Debug, Clone)]
pub struct SitemapResult {
    /// All discovered URLs from the sitemap(s), filtered to `seed_domain`
    /// and capped at `max_urls`.
    pub urls: Vec<String>,
    /// Total number of URLs found before filtering/capping.
    pub total_count: u32,
    /// Set when `max_urls` truncated the result, so callers can log it
    /// rather than silently crawl a partial sitemap.
    pub truncated: bool,
}

/// Fetch and parse sitemaps from the given URLs (typically discovered via
/// `RobotsPolicy::sitemaps`). Handles both `<urlset>` and `<sitemapindex>`
/// formats, fetching through the shared `HttpFetcher` port rather than
/// owning its own `reqwest::Client` the way the teacher's
/// `fetch_sitemap_urls` did (crawler/sitemap.rs) — so sitemap fetches are
/// subject to the same `RateGate` as page fetches.
pub async fn fetch_sitemap_urls<F: HttpFetcher>(
    fetcher: &F,
    sitemap_urls: &[String],
    seed_domain: &str,
    max_child_sitemaps: usize,
    max_urls: usize,
) -> SitemapResult {
    let mut all_urls: Vec<String> = Vec::new();
    let loc_re = Regex::new(r"<loc>\s*(.*?)\s*</loc>").expect("valid regex");

    for sitemap_url in sitemap_urls.iter().take(max_child_sitemaps.max(1)) {
        let xml = match fetch_xml(fetcher, sitemap_url).await {
            Some(xml) => xml,
            None => continue,
        };

        if xml.contains("<sitemapindex") {
            let child_urls: Vec<String> = loc_re
                .captures_iter(&xml)
                .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
                .take(max_child_sitemaps)
                .collect();

            for child_url in &child_urls {
                if let Some(child_xml) = fetch_xml(fetcher, child_url).await {
                    extract_locs(&loc_re, &child_xml, &mut all_urls);
                }
            }
        } else {
            extract_locs(&loc_re, &xml, &mut all_urls);
        }
    }

    let total_count = all_urls.len() as u32;

    let seed_domain_lower = seed_domain.to_lowercase();
    let mut seen = HashSet::new();
    let mut filtered: Vec<String> = all_urls
        .into_iter()
        .filter(|url| {
            Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
                .map(|h| h == seed_domain_lower || h == format!("www.{}", seed_domain_lower))
                .unwrap_or(false)
        })
        .filter(|url| seen.insert(url.clone()))
        .collect();

    let truncated = filtered.len() > max_urls;
    filtered.truncate(max_urls);

    SitemapResult { urls: filtered, total_count, truncated }
}

async fn fetch_xml<F: HttpFetcher>(fetcher: &F, url: &str) -> Option<String> {
    let result = fetcher.fetch_static(url).await.ok()?;
    if result.status_code >= 400 {
        return None;
    }
    Some(result.body)
}

fn extract_locs(re: &Regex, xml: &str, out: &mut Vec<String>) {
    for cap in re.captures_iter(xml) {
        if let Some(m) = cap.get(1) {
            let url = m.as_str().trim();
            if !url.is_empty() {
                out.push(url.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_locs_standard_sitemap() {
        let re = Regex::new(r"<loc>\s*(.*?)\s*</loc>").unwrap();
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://example.com/</loc></url>
  <url><loc>https://example.com/about</loc></url>
  <url><loc>https://example.com/blog</loc></url>
</urlset>"#;
        let mut urls = Vec::new();
        extract_locs(&re, xml, &mut urls);
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[0], "https://example.com/");
        assert_eq!(urls[1], "https://example.com/about");
        assert_eq!(urls[2], "https://example.com/blog");
    }

    #[test]
    fn test_extract_locs_empty() {
        let re = Regex::new(r"<loc>\s*(.*?)\s*</loc>").unwrap();
        let mut urls = Vec::new();
        extract_locs(&re, "<urlset></urlset>", &mut urls);
        assert!(urls.is_empty());
    }

    #[test]
    fn test_extract_locs_with_whitespace() {
        let re = Regex::new(r"<loc>\s*(.*?)\s*</loc>").unwrap();
        let xml = r#"<urlset>
  <url><loc>
    https://example.com/page
  </loc></url>
</urlset>"#;
        let mut urls = Vec::new();
        extract_locs(&re, xml, &mut urls);
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0], "https://example.com/page");
    }

    #[test]
    fn test_detect_sitemap_index() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://example.com/sitemap-1.xml</loc></sitemap>
  <sitemap><loc>https://example.com/sitemap-2.xml</loc></sitemap>
</sitemapindex>"#;
        assert!(xml.contains("<sitemapindex"));
    }
}
