use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::{Entity, EntityType, Id};

/// Structured entity extraction over page text — the NER-like counterpart
/// to the teacher's generic `run_extractors` (crawler/extractor.rs), which
/// only produced raw CSS/regex match strings. Here every match is typed,
/// normalized, and deduplicated against what's already been seen for the
/// company.
const MAX_MATCHES_PER_PATTERN: usize = 50;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex")
    })
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]\d{3}[-.\s]\d{4}").expect("valid regex")
    })
}

fn money_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\s?\d{1,3}(?:,\d{3})*(?:\.\d+)?\s?(?:[BMK]illion|[bmk])?")
            .expect("valid regex")
    })
}

fn social_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"https?://(?:www\.)?(?:twitter|x|linkedin|facebook|instagram)\.com/[A-Za-z0-9_./-]+",
        )
        .expect("valid regex")
    })
}

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\d{1,5}\s+[A-Za-z0-9.\s]+?\s(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Drive|Dr|Lane|Ln|Way|Suite|Ste)\.?(?:\s*,?\s*[A-Za-z\s]+,\s*[A-Z]{2}\s*\d{5})?",
        )
        .expect("valid regex")
    })
}

/// Run every entity pattern over a single page's text and resolve the
/// matches into `Entity` records attributed to `source_url`.
pub fn extract_entities(company_id: &Id, source_url: &str, text_content: &str) -> Vec<Entity> {
    let mut entities = Vec::new();

    for (entity_type, re, confidence) in [
        (EntityType::Email, email_re(), 0.95),
        (EntityType::Phone, phone_re(), 0.8),
        (EntityType::Money, money_re(), 0.7),
        (EntityType::SocialHandle, social_re(), 0.9),
        (EntityType::Address, address_re(), 0.6),
    ] {
        for m in re.find_iter(text_content).take(MAX_MATCHES_PER_PATTERN) {
            let value = m.as_str().trim().to_string();
            if value.is_empty() {
                continue;
            }
            entities.push(Entity {
                id: String::new(),
                company_id: company_id.clone(),
                entity_type,
                value,
                context: surrounding_context(text_content, m.start(), m.end()),
                source_urls: vec![source_url.to_string()],
                confidence,
            });
        }
    }

    entities
}

fn surrounding_context(text: &str, start: usize, end: usize) -> String {
    const WINDOW: usize = 60;
    let ctx_start = text[..start].char_indices().rev().nth(WINDOW).map(|(i, _)| i).unwrap_or(0);
    let ctx_end = text[end..]
        .char_indices()
        .nth(WINDOW)
        .map(|(i, _)| end + i)
        .unwrap_or_else(|| text.len());
    text[ctx_start..ctx_end].trim().to_string()
}

/// Normalize a value for dedup-key purposes — each `EntityType` has its
/// own notion of "same entity" (case-insensitive email, digits-only phone).
fn normalize_value(entity_type: EntityType, value: &str) -> String {
    match entity_type {
        EntityType::Email | EntityType::SocialHandle => value.to_lowercase(),
        EntityType::Phone => value.chars().filter(|c| c.is_ascii_digit()).collect(),
        _ => value.trim().to_lowercase(),
    }
}

/// Merge freshly extracted entities into an existing set, keyed by
/// `(entity_type, normalized value)`. Matching entities union their
/// `source_urls` and keep the higher confidence rather than accumulating
/// duplicates per page.
pub fn merge_entities(existing: &mut Vec<Entity>, fresh: Vec<Entity>) {
    let mut index: HashMap<(EntityType, String), usize> = HashMap::new();
    for (i, e) in existing.iter().enumerate() {
        index.insert((e.entity_type, normalize_value(e.entity_type, &e.value)), i);
    }

    for entity in fresh {
        let key = (entity.entity_type, normalize_value(entity.entity_type, &entity.value));
        if let Some(&idx) = index.get(&key) {
            let slot = &mut existing[idx];
            for url in entity.source_urls {
                if !slot.source_urls.contains(&url) {
                    slot.source_urls.push(url);
                }
            }
            if entity.confidence > slot.confidence {
                slot.confidence = entity.confidence;
            }
        } else {
            index.insert(key, existing.len());
            existing.push(entity);
        }
    }
}
