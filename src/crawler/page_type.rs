use crate::models::PageType;

/// Classify a URL (and, when available, its extracted title/headings) into
/// one of the `PageType` buckets the frontier prioritizes on (spec.md
/// §4.3). Grounded on the teacher's path/keyword heuristics already present
/// in `crawler::parser` for things like schema and robots-meta detection —
/// same "check well-known path segments" idiom, applied to page typing
/// instead of SEO signals.
pub fn classify_url(url: &str) -> PageType {
    let path = url_path_lower(url);
    classify_path(&path)
}

/// Refine a URL-based classification using page content once it has been
/// fetched — headings and title often disambiguate better than the path
/// alone (e.g. a `/people` path might be `team`, a root-level "Meet the
/// Team" h1 confirms it).
pub fn classify_with_content(url: &str, title: Option<&str>, headings: &[String]) -> PageType {
    let from_path = classify_url(url);
    if from_path != PageType::Other {
        return from_path;
    }

    let haystack = title
        .map(|t| t.to_lowercase())
        .into_iter()
        .chain(headings.iter().map(|h| h.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" ");

    classify_keywords(&haystack).unwrap_or(PageType::Other)
}

fn url_path_lower(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_else(|_| url.to_lowercase())
}

fn classify_path(path: &str) -> PageType {
    const RULES: &[(&[&str], PageType)] = &[
        (&["/about", "/about-us", "/company", "/who-we-are"], PageType::About),
        (&["/team", "/people", "/leadership", "/our-team", "/staff"], PageType::Team),
        (&["/careers", "/jobs", "/join-us", "/work-with-us"], PageType::Careers),
        (&["/pricing", "/plans", "/cost"], PageType::Pricing),
        (&["/contact", "/contact-us", "/get-in-touch"], PageType::Contact),
        (&["/product", "/products", "/features", "/platform"], PageType::Product),
        (&["/services", "/solutions"], PageType::Service),
        (&["/blog", "/articles", "/insights"], PageType::Blog),
        (&["/news", "/press", "/media"], PageType::News),
    ];

    for (prefixes, page_type) in RULES {
        if prefixes.iter().any(|p| path.starts_with(p)) {
            return *page_type;
        }
    }
    if path == "/" || path.is_empty() {
        return PageType::About;
    }
    PageType::Other
}

fn classify_keywords(haystack: &str) -> Option<PageType> {
    const RULES: &[(&[&str], PageType)] = &[
        (&["meet the team", "our team", "leadership team"], PageType::Team),
        (&["about us", "our story", "who we are"], PageType::About),
        (&["open positions", "we're hiring", "we are hiring"], PageType::Careers),
        (&["pricing", "plans and pricing"], PageType::Pricing),
        (&["contact us", "get in touch"], PageType::Contact),
    ];
    for (phrases, page_type) in RULES {
        if phrases.iter().any(|p| haystack.contains(p)) {
            return Some(*page_type);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_about_root() {
        assert_eq!(classify_url("https://example.com/"), PageType::About);
        assert_eq!(classify_url("https://example.com/about-us"), PageType::About);
    }

    #[test]
    fn test_classify_team() {
        assert_eq!(classify_url("https://example.com/team/jane"), PageType::Team);
    }

    #[test]
    fn test_classify_careers() {
        assert_eq!(classify_url("https://example.com/careers/openings"), PageType::Careers);
    }

    #[test]
    fn test_classify_unknown_path_is_other() {
        assert_eq!(classify_url("https://example.com/xyz123"), PageType::Other);
    }

    #[test]
    fn test_classify_with_content_fallback() {
        let page_type = classify_with_content(
            "https://example.com/xyz123",
            Some("Meet the Team"),
            &["Our leadership team".to_string()],
        );
        assert_eq!(page_type, PageType::Team);
    }

    #[test]
    fn test_classify_with_content_prefers_url_match() {
        let page_type = classify_with_content("https://example.com/pricing", Some("Meet the Team"), &[]);
        assert_eq!(page_type, PageType::Pricing);
    }
}
