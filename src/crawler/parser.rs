use std::collections::HashMap;

use scraper::{Html, Selector};
use url::Url;

use super::security;

/// Parsed representation of an HTML page — structural extraction the
/// crawl engine and entity extractor both build on. Trimmed from the
/// teacher's SEO-oriented `ParsedPage` (crawler/parser.rs): flesch
/// readability, CORS analysis, and "human-readiness" transition-word
/// heuristics have no counterpart here and were dropped.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub canonical_url: Option<String>,
    pub headings: Headings,
    pub internal_links: Vec<String>,
    pub external_links: Vec<String>,
    pub schema_json_ld: Vec<String>,
    pub og_tags: HashMap<String, String>,
    pub robots_directives: Vec<String>,
    pub has_robots_meta: bool,
    pub word_count: u32,
    pub text_content: String,
    pub pdf_links: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Headings {
    pub h1: Vec<String>,
    pub h2: Vec<String>,
    pub h3: Vec<String>,
    pub h4: Vec<String>,
    pub h5: Vec<String>,
    pub h6: Vec<String>,
}

impl Headings {
    pub fn all(&self) -> Vec<String> {
        self.h1
            .iter()
            .chain(self.h2.iter())
            .chain(self.h3.iter())
            .chain(self.h4.iter())
            .chain(self.h5.iter())
            .chain(self.h6.iter())
            .cloned()
            .collect()
    }
}

pub struct Parser;

impl Parser {
    /// Parse an HTML document into structural fields used downstream for
    /// page typing, entity extraction, and content-hash dedup.
    pub fn parse(html_content: &str, base_url: &str) -> ParsedPage {
        let document = Html::parse_document(html_content);
        let base = Url::parse(base_url).ok();

        let title = Self::extract_title(&document);
        let meta_description = Self::extract_meta_description(&document);
        let canonical_url = Self::extract_canonical(&document);
        let headings = Self::extract_headings(&document);
        let (internal_links, external_links) = Self::extract_links(&document, &base);
        let schema_json_ld = Self::extract_json_ld(&document);
        let og_tags = Self::extract_og_tags(&document);
        let (has_robots_meta, robots_directives) = Self::extract_robots_meta(&document);
        let text_content = Self::get_all_text(&document);
        let word_count = text_content.split_whitespace().count() as u32;
        let pdf_links = security::extract_pdf_links(&document, base_url);

        ParsedPage {
            title,
            meta_description,
            canonical_url,
            headings,
            internal_links,
            external_links,
            schema_json_ld,
            og_tags,
            robots_directives,
            has_robots_meta,
            word_count,
            text_content,
            pdf_links,
        }
    }

    fn get_all_text(document: &Html) -> String {
        let body_sel = Selector::parse("body").unwrap();
        let mut text = String::new();
        if let Some(body) = document.select(&body_sel).next() {
            collect_text_excluding(&body, &mut text);
        }
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn extract_title(document: &Html) -> Option<String> {
        let sel = Selector::parse("title").unwrap();
        document
            .select(&sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn extract_meta_description(document: &Html) -> Option<String> {
        let sel = Selector::parse(r#"meta[name="description"]"#).unwrap();
        document
            .select(&sel)
            .next()
            .and_then(|el| el.value().attr("content").map(|s| s.to_string()))
            .filter(|s| !s.is_empty())
    }

    fn extract_canonical(document: &Html) -> Option<String> {
        let sel = Selector::parse(r#"link[rel="canonical"]"#).unwrap();
        document
            .select(&sel)
            .next()
            .and_then(|el| el.value().attr("href").map(|s| s.to_string()))
            .filter(|s| !s.is_empty())
    }

    fn extract_headings(document: &Html) -> Headings {
        let mut headings = Headings::default();

        for (tag, vec) in [
            ("h1", &mut headings.h1),
            ("h2", &mut headings.h2),
            ("h3", &mut headings.h3),
            ("h4", &mut headings.h4),
            ("h5", &mut headings.h5),
            ("h6", &mut headings.h6),
        ] {
            let sel = Selector::parse(tag).unwrap();
            for el in document.select(&sel) {
                let text = el.text().collect::<String>().trim().to_string();
                if !text.is_empty() {
                    vec.push(text);
                }
            }
        }

        headings
    }

    fn extract_links(document: &Html, base: &Option<Url>) -> (Vec<String>, Vec<String>) {
        let sel = Selector::parse("a[href]").unwrap();
        let mut internal = Vec::new();
        let mut external = Vec::new();

        let base_host = base.as_ref().and_then(|u| u.host_str().map(|h| h.to_lowercase()));

        for el in document.select(&sel) {
            if let Some(href) = el.value().attr("href") {
                let resolved = if let Some(base) = base {
                    base.join(href).ok()
                } else {
                    Url::parse(href).ok()
                };

                if let Some(resolved_url) = resolved {
                    if resolved_url.scheme() != "http" && resolved_url.scheme() != "https" {
                        continue;
                    }
                    let link_host = resolved_url.host_str().map(|h| h.to_lowercase());
                    let url_str = resolved_url.to_string();

                    if link_host == base_host {
                        internal.push(url_str);
                    } else {
                        external.push(url_str);
                    }
                }
            }
        }

        (internal, external)
    }

    fn extract_json_ld(document: &Html) -> Vec<String> {
        let sel = Selector::parse(r#"script[type="application/ld+json"]"#).unwrap();
        document
            .select(&sel)
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn extract_og_tags(document: &Html) -> HashMap<String, String> {
        let mut tags = HashMap::new();
        for property in &["og:title", "og:description", "og:image", "og:type"] {
            let selector_str = format!(r#"meta[property="{}"]"#, property);
            let sel = Selector::parse(&selector_str).unwrap();
            if let Some(el) = document.select(&sel).next() {
                if let Some(content) = el.value().attr("content") {
                    if !content.is_empty() {
                        tags.insert(property.to_string(), content.to_string());
                    }
                }
            }
        }
        tags
    }

    fn extract_robots_meta(document: &Html) -> (bool, Vec<String>) {
        let sel = Selector::parse(r#"meta[name="robots"]"#).unwrap();
        let mut directives = Vec::new();
        let mut found = false;

        for el in document.select(&sel) {
            found = true;
            if let Some(content) = el.value().attr("content") {
                for directive in content.split(',') {
                    let d = directive.trim().to_lowercase();
                    if !d.is_empty() {
                        directives.push(d);
                    }
                }
            }
        }

        (found, directives)
    }
}

/// Recursively collect text, skipping elements whose tag name is "script" or "style".
fn collect_text_excluding(node: &scraper::ElementRef, out: &mut String) {
    for child in node.children() {
        if let Some(text) = child.value().as_text() {
            out.push(' ');
            out.push_str(text);
        } else if let Some(el) = scraper::ElementRef::wrap(child) {
            let tag = el.value().name();
            if tag != "script" && tag != "style" {
                collect_text_excluding(&el, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Test Page Title</title>
    <meta name="description" content="A test page for parsing">
    <link rel="canonical" href="https://example.com/test">
    <meta name="robots" content="index, follow">
    <meta property="og:title" content="OG Test Title">
    <script type="application/ld+json">{"@type": "WebPage", "name": "Test"}</script>
</head>
<body>
    <h1>Main Heading</h1>
    <h2>Sub Heading One</h2>
    <p>This is some body text with several words for counting purposes.</p>
    <a href="/internal-page">Internal Link</a>
    <a href="https://other.com/page">External Link</a>
    <script>var x = 1; do not count these words at all;</script>
</body>
</html>"#;

    #[test]
    fn test_title() {
        let page = Parser::parse(TEST_HTML, "https://example.com/test");
        assert_eq!(page.title.as_deref(), Some("Test Page Title"));
    }

    #[test]
    fn test_meta_description() {
        let page = Parser::parse(TEST_HTML, "https://example.com/test");
        assert_eq!(page.meta_description.as_deref(), Some("A test page for parsing"));
    }

    #[test]
    fn test_canonical() {
        let page = Parser::parse(TEST_HTML, "https://example.com/test");
        assert_eq!(page.canonical_url.as_deref(), Some("https://example.com/test"));
    }

    #[test]
    fn test_headings() {
        let page = Parser::parse(TEST_HTML, "https://example.com/test");
        assert_eq!(page.headings.h1, vec!["Main Heading"]);
        assert_eq!(page.headings.h2, vec!["Sub Heading One"]);
    }

    #[test]
    fn test_links() {
        let page = Parser::parse(TEST_HTML, "https://example.com/test");
        assert!(page.internal_links.iter().any(|l| l.contains("internal-page")));
        assert_eq!(page.external_links.len(), 1);
        assert!(page.external_links[0].contains("other.com"));
    }

    #[test]
    fn test_json_ld() {
        let page = Parser::parse(TEST_HTML, "https://example.com/test");
        assert_eq!(page.schema_json_ld.len(), 1);
        assert!(page.schema_json_ld[0].contains("WebPage"));
    }

    #[test]
    fn test_robots_meta() {
        let page = Parser::parse(TEST_HTML, "https://example.com/test");
        assert!(page.has_robots_meta);
        assert!(page.robots_directives.contains(&"index".to_string()));
    }

    #[test]
    fn test_script_text_excluded() {
        let page = Parser::parse(TEST_HTML, "https://example.com/test");
        assert!(!page.text_content.contains("do not count"));
    }

    #[test]
    fn test_pdf_links_collected() {
        let html = r#"<html><body><a href="/files/deck.pdf">Deck</a><a href="/about">About</a></body></html>"#;
        let page = Parser::parse(html, "https://example.com/");
        assert_eq!(page.pdf_links.len(), 1);
        assert!(page.pdf_links[0].contains("deck.pdf"));
    }

    #[test]
    fn test_no_title_empty_html() {
        let page = Parser::parse("", "https://example.com");
        assert!(page.title.is_none());
        assert_eq!(page.word_count, 0);
    }
}
