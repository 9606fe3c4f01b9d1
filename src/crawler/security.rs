use scraper::{Html, Selector};
use url::Url;

/// Extract PDF links discovered on a page. PDFs get a plain byte-length/
/// text-marker heuristic in the crawl engine rather than a dedicated parser
/// crate — the CORS/mixed-content analysis the teacher also kept here
/// (crawler/security.rs) has no counterpart and was dropped.
pub fn extract_pdf_links(document: &Html, base_url: &str) -> Vec<String> {
    let sel = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let base = Url::parse(base_url).ok();

    document
        .select(&sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?;
            if !href.to_lowercase().ends_with(".pdf") {
                return None;
            }
            let resolved = if let Some(ref base) = base {
                base.join(href).ok()?.to_string()
            } else {
                Url::parse(href).ok()?.to_string()
            };
            Some(resolved)
        })
        .collect()
}
