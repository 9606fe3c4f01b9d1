use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use url::Url;

use crate::ports::{FetchError, HttpFetcher};

#[derive(Error, Debug)]
pub enum RobotsError {
    #[error("invalid url: {0}")]
    UrlError(String),
}

#[derive(Debug, Clone)]
struct Rule {
    /// `true` for `Allow`, `false` for `Disallow`.
    allow: bool,
    pattern: String,
}

/// Parsed robots.txt rules for a single domain.
#[derive(Debug, Clone)]
pub struct RobotsPolicy {
    rules: Vec<(String, Vec<Rule>)>,
    pub crawl_delay: Option<Duration>,
    pub sitemaps: Vec<String>,
    pub loaded: bool,
}

impl RobotsPolicy {
    pub fn empty() -> Self {
        RobotsPolicy {
            rules: Vec::new(),
            crawl_delay: None,
            sitemaps: Vec::new(),
            loaded: false,
        }
    }

    /// Create a policy from raw robots.txt content (used for tests and for
    /// the real cache path alike).
    pub fn from_content(content: &str) -> Self {
        let mut groups: Vec<(String, Vec<Rule>)> = Vec::new();
        let mut current_agents: Vec<String> = Vec::new();
        let mut crawl_delay = None;
        let mut sitemaps = Vec::new();
        let mut group_open = false;

        for line in content.lines() {
            let line = line.trim();
            let line = if let Some(idx) = line.find('#') {
                line[..idx].trim()
            } else {
                line
            };
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if group_open {
                        current_agents.clear();
                        group_open = false;
                    }
                    current_agents.push(value.to_lowercase());
                }
                "disallow" => {
                    group_open = true;
                    for agent in &current_agents {
                        push_rule(&mut groups, agent, Rule { allow: false, pattern: value.to_string() });
                    }
                }
                "allow" => {
                    group_open = true;
                    for agent in &current_agents {
                        push_rule(&mut groups, agent, Rule { allow: true, pattern: value.to_string() });
                    }
                }
                "crawl-delay" => {
                    group_open = true;
                    if let Ok(secs) = value.parse::<f64>() {
                        crawl_delay = Some(Duration::from_secs_f64(secs));
                    }
                }
                "sitemap" => {
                    sitemaps.push(value.to_string());
                }
                _ => {}
            }
        }

        RobotsPolicy {
            rules: groups,
            crawl_delay,
            sitemaps,
            loaded: true,
        }
    }

    /// Check if `url` is allowed for `user_agent`, using longest-match-wins
    /// between `Allow`/`Disallow` patterns (wildcard `*` and trailing `$`
    /// supported), falling back to the `*` group when no agent-specific
    /// group exists.
    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        let path = match Url::parse(url) {
            Ok(u) => {
                let mut p = u.path().to_string();
                if let Some(q) = u.query() {
                    p.push('?');
                    p.push_str(q);
                }
                p
            }
            Err(_) => return true,
        };

        let ua_lower = user_agent.to_lowercase();
        let group = self
            .rules
            .iter()
            .find(|(agent, _)| agent == &ua_lower)
            .or_else(|| self.rules.iter().find(|(agent, _)| agent == "*"));

        let Some((_, patterns)) = group else {
            return true;
        };

        let mut best: Option<(usize, bool)> = None;
        for rule in patterns {
            if rule.pattern.is_empty() {
                continue;
            }
            if let Some(len) = match_pattern(&rule.pattern, &path) {
                let better = match best {
                    None => true,
                    Some((best_len, _)) => len >= best_len,
                };
                if better {
                    best = Some((len, rule.allow));
                }
            }
        }

        match best {
            Some((_, allow)) => allow,
            None => true,
        }
    }
}

fn push_rule(groups: &mut Vec<(String, Vec<Rule>)>, agent: &str, rule: Rule) {
    if let Some((_, rules)) = groups.iter_mut().find(|(a, _)| a == agent) {
        rules.push(rule);
    } else {
        groups.push((agent.to_string(), vec![rule]));
    }
}

/// Match a robots.txt path pattern (which may contain `*` wildcards and a
/// trailing `$` end-anchor) against a request path. Returns the matched
/// prefix length on success, used to pick the most specific rule.
fn match_pattern(pattern: &str, path: &str) -> Option<usize> {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };

    if !pattern.contains('*') {
        return if anchored {
            if path == pattern {
                Some(pattern.len())
            } else {
                None
            }
        } else if path.starts_with(pattern) {
            Some(pattern.len())
        } else {
            None
        };
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut cursor = 0usize;
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            continue;
        }
        match path[cursor..].find(seg) {
            Some(pos) => {
                if i == 0 && pos != 0 {
                    return None;
                }
                cursor += pos + seg.len();
            }
            None => return None,
        }
    }
    if anchored && cursor != path.len() {
        return None;
    }
    Some(pattern.len())
}

struct CacheEntry {
    policy: Arc<RobotsPolicy>,
    fetched_at: Instant,
}

/// Process-wide robots.txt cache, keyed by host. Entries from a successful
/// fetch live for 24h; entries recorded after a fetch failure (treated as
/// "allow everything", mirroring the teacher's `RobotsChecker::new` fallback
/// in crawler/robots.rs) are retried after 1h so a transient outage doesn't
/// wrongly block a crawl for a full day.
pub struct RobotsCache<F: HttpFetcher> {
    fetcher: Arc<F>,
    cache: DashMap<String, CacheEntry>,
    success_ttl: Duration,
    failure_ttl: Duration,
}

impl<F: HttpFetcher> RobotsCache<F> {
    pub fn new(fetcher: Arc<F>) -> Self {
        RobotsCache {
            fetcher,
            cache: DashMap::new(),
            success_ttl: Duration::from_secs(24 * 3600),
            failure_ttl: Duration::from_secs(3600),
        }
    }

    pub async fn policy_for(&self, host: &str) -> Arc<RobotsPolicy> {
        if let Some(entry) = self.cache.get(host) {
            let ttl = if entry.policy.loaded { self.success_ttl } else { self.failure_ttl };
            if entry.fetched_at.elapsed() < ttl {
                return entry.policy.clone();
            }
        }

        let policy = Arc::new(self.fetch_policy(host).await);
        self.cache.insert(
            host.to_string(),
            CacheEntry { policy: policy.clone(), fetched_at: Instant::now() },
        );
        policy
    }

    async fn fetch_policy(&self, host: &str) -> RobotsPolicy {
        let url = format!("https://{}/robots.txt", host);
        match self.fetcher.fetch_static(&url).await {
            Ok(result) if result.status_code < 400 => RobotsPolicy::from_content(&result.body),
            Ok(_) => RobotsPolicy::empty(),
            Err(FetchError::Timeout) | Err(FetchError::TooManyRedirects) | Err(FetchError::RequestFailed(_)) => {
                RobotsPolicy::empty()
            }
        }
    }
}
