use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use url::Url;

use crate::models::{PageType, QueuedUrlEntry};

/// A URL entry in the frontier queue, ordered by `(pageTypePriority, depth,
/// insertionOrder)` ascending — lower priority number first, then shallower
/// depth, then first-discovered first (spec.md §4.3). `seq` breaks ties
/// deterministically so two URLs of the same type and depth come out in
/// discovery order rather than whatever the heap happens to prefer.
#[derive(Debug, Clone, Eq, PartialEq)]
struct FrontierEntry {
    url: String,
    page_type: PageType,
    depth: u32,
    seq: u64,
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let key = (self.page_type.priority(), self.depth, self.seq);
        let other_key = (other.page_type.priority(), other.depth, other.seq);
        // Reverse so BinaryHeap (max-heap) pops the smallest tuple first.
        Reverse(key).cmp(&Reverse(other_key))
    }
}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority URL frontier with deduplication and max-depth support,
/// generalized from the teacher's depth-only BFS frontier
/// (crawler/frontier.rs) to the page-type-aware ordering spec.md §4.3
/// requires.
pub struct Frontier {
    queue: BinaryHeap<FrontierEntry>,
    seen: HashSet<String>,
    external_seen: HashSet<String>,
    max_depth: u32,
    crawled: usize,
    next_seq: u64,
}

impl Frontier {
    pub fn new(max_depth: u32) -> Self {
        Frontier {
            queue: BinaryHeap::new(),
            seen: HashSet::new(),
            external_seen: HashSet::new(),
            max_depth,
            crawled: 0,
            next_seq: 0,
        }
    }

    /// Seed the frontier with the given URLs (all at depth 0), classified
    /// by the caller-supplied page-type classifier.
    pub fn seed<C: Fn(&str) -> PageType>(&mut self, seed_urls: &[String], classify: C) {
        for raw_url in seed_urls {
            self.push(raw_url, 0, &classify);
        }
    }

    /// Pop the next URL to crawl per the priority ordering.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<(String, u32, PageType)> {
        let entry = self.queue.pop()?;
        self.crawled += 1;
        Some((entry.url, entry.depth, entry.page_type))
    }

    /// Add newly discovered URLs at the given depth. URLs already seen or
    /// exceeding `max_depth` are skipped.
    pub fn add_discovered<C: Fn(&str) -> PageType>(&mut self, urls: &[String], depth: u32, classify: C) {
        if depth > self.max_depth {
            return;
        }
        for raw_url in urls {
            self.push(raw_url, depth, &classify);
        }
    }

    fn push<C: Fn(&str) -> PageType>(&mut self, raw_url: &str, depth: u32, classify: &C) {
        let Some(normalized) = normalize_url(raw_url) else {
            return;
        };
        if self.seen.insert(normalized.clone()) {
            let page_type = classify(&normalized);
            let seq = self.next_seq;
            self.next_seq += 1;
            self.queue.push(FrontierEntry { url: normalized, page_type, depth, seq });
        }
    }

    /// Record an external (off-site) URL encountered during crawling
    /// without queuing it for crawling (spec.md §4.1's external-link
    /// tracking without following, except where explicitly opted in).
    pub fn record_external(&mut self, raw_url: &str) {
        if let Some(normalized) = normalize_url(raw_url) {
            self.external_seen.insert(normalized);
        }
    }

    pub fn external_urls(&self) -> Vec<String> {
        self.external_seen.iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn crawled_count(&self) -> usize {
        self.crawled
    }

    pub fn has_seen(&self, raw_url: &str) -> bool {
        normalize_url(raw_url).map(|n| self.seen.contains(&n)).unwrap_or(false)
    }

    /// Snapshot the queued (not-yet-crawled) entries for checkpointing
    /// (spec.md §6).
    pub fn queued_snapshot(&self) -> Vec<QueuedUrlEntry> {
        self.queue
            .iter()
            .map(|e| QueuedUrlEntry { url: e.url.clone(), priority: e.page_type.priority(), depth: e.depth })
            .collect()
    }

    pub fn visited_snapshot(&self) -> Vec<String> {
        self.seen
            .iter()
            .filter(|u| !self.queue.iter().any(|e| &e.url == *u))
            .cloned()
            .collect()
    }

    /// Rebuild a frontier from a loaded checkpoint's `visited`/`queued`
    /// lists (spec.md §6 resume semantics).
    pub fn restore<C: Fn(&str) -> PageType>(
        max_depth: u32,
        visited: &[String],
        queued: &[QueuedUrlEntry],
        external_found: &[String],
        classify: C,
    ) -> Self {
        let mut frontier = Frontier::new(max_depth);
        for url in visited {
            if let Some(normalized) = normalize_url(url) {
                frontier.seen.insert(normalized);
            }
        }
        for entry in queued {
            frontier.push(&entry.url, entry.depth, &classify);
        }
        for url in external_found {
            frontier.record_external(url);
        }
        frontier
    }
}

/// Well-known tracking query parameters stripped during normalization so
/// `?utm_source=...` variants of the same page collapse to one frontier key.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "utm_id",
    "gclid",
    "fbclid",
    "msclkid",
    "mc_cid",
    "mc_eid",
    "ref",
    "igshid",
];

/// Normalize a URL: drop the fragment, strip tracking query parameters,
/// strip a trailing slash (unless the path is just "/"), and lowercase
/// scheme/host (the `url` crate already does the latter).
fn normalize_url(raw: &str) -> Option<String> {
    let mut parsed = Url::parse(raw).ok()?;
    parsed.set_fragment(None);

    let retained: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.to_lowercase().as_str()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if retained.is_empty() {
        parsed.set_query(None);
    } else {
        let mut serializer = parsed.query_pairs_mut();
        serializer.clear();
        for (k, v) in &retained {
            serializer.append_pair(k, v);
        }
        drop(serializer);
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(&path[..path.len() - 1]);
    }

    Some(parsed.to_string())
}
