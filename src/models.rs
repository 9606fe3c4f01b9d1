use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CompanyConfig;

pub type Id = String;

// --- Company ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Crawling,
    Extracting,
    Analyzing,
    Generating,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: Id,
    pub name: String,
    pub start_url: String,
    pub industry: Option<String>,
    pub config_snapshot: CompanyConfig,
    pub status: CompanyStatus,
    pub phase: Phase,
    pub tokens_used: u64,
    pub est_cost: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub checkpoint_ref: Option<Id>,
    /// Set when an active `BatchJob` owns this company; `None` for ad hoc runs.
    pub batch_id: Option<Id>,
    /// Owner of the lease that may mutate this company while `in_progress`.
    pub lease_owner: Option<String>,
    pub fail_reason: Option<String>,
}

impl Company {
    pub fn new(id: Id, name: String, start_url: String, config: CompanyConfig, now: DateTime<Utc>) -> Self {
        Company {
            id,
            name,
            start_url,
            industry: None,
            config_snapshot: config,
            status: CompanyStatus::Pending,
            phase: Phase::Queued,
            tokens_used: 0,
            est_cost: 0.0,
            created_at: now,
            started_at: None,
            completed_at: None,
            checkpoint_ref: None,
            batch_id: None,
            lease_owner: None,
            fail_reason: None,
        }
    }
}

// --- CrawlSession ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlSessionStatus {
    Active,
    Paused,
    Completed,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSession {
    pub id: Id,
    pub company_id: Id,
    pub pages_crawled: u32,
    pub pages_queued: u32,
    pub depth_reached: u32,
    pub external_links_followed: u32,
    pub status: CrawlSessionStatus,
    pub checkpoint: Checkpoint,
}

/// Reason a crawl stopped, reported upward to the pipeline (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    PageLimit,
    TimeLimit,
    FrontierEmpty,
    Paused,
    Failed,
}

// --- Page ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    About,
    Team,
    Product,
    Service,
    Contact,
    Careers,
    Pricing,
    Blog,
    News,
    Other,
}

impl PageType {
    /// Canonical priority rank from spec.md §4.3: lower is visited first.
    pub fn priority(&self) -> u8 {
        match self {
            PageType::About => 1,
            PageType::Team => 2,
            PageType::Product => 3,
            PageType::Service => 4,
            PageType::Contact => 5,
            PageType::Careers => 6,
            PageType::Pricing => 7,
            PageType::Blog => 8,
            PageType::News => 9,
            PageType::Other => 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: Id,
    pub company_id: Id,
    pub url: String,
    pub page_type: PageType,
    pub content_hash: String,
    pub raw_body: Option<String>,
    pub extracted_text: String,
    pub crawled_at: DateTime<Utc>,
    pub is_external: bool,
}

// --- Entity ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Org,
    Location,
    Product,
    Date,
    Money,
    Email,
    Phone,
    Address,
    SocialHandle,
    TechStack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Id,
    pub company_id: Id,
    pub entity_type: EntityType,
    pub value: String,
    pub context: String,
    pub source_urls: Vec<String>,
    pub confidence: f64,
}

// --- Analysis ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisSections {
    pub overview: String,
    pub business_model: String,
    pub team: String,
    pub market: String,
    pub tech: String,
    pub insights: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub red_flags: Option<String>,
}

impl AnalysisSections {
    /// The ordered list of section names a full analysis attempts.
    pub const NAMES: [&'static str; 7] = [
        "overview",
        "businessModel",
        "team",
        "market",
        "tech",
        "insights",
        "redFlags",
    ];

    pub fn set(&mut self, name: &str, text: String) {
        match name {
            "overview" => self.overview = text,
            "businessModel" => self.business_model = text,
            "team" => self.team = text,
            "market" => self.market = text,
            "tech" => self.tech = text,
            "insights" => self.insights = text,
            "redFlags" => self.red_flags = Some(text),
            _ => {}
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            "overview" => Some(&self.overview),
            "businessModel" => Some(&self.business_model),
            "team" => Some(&self.team),
            "market" => Some(&self.market),
            "tech" => Some(&self.tech),
            "insights" => Some(&self.insights),
            "redFlags" => self.red_flags.as_deref(),
            _ => None,
        }
    }

    /// Fraction of the 6 mandatory sections (`redFlags` is optional) that
    /// came back empty — feeds the >50% section-failure abort rule.
    pub fn empty_fraction(&self) -> f64 {
        let mandatory = [
            &self.overview,
            &self.business_model,
            &self.team,
            &self.market,
            &self.tech,
            &self.insights,
        ];
        let empty = mandatory.iter().filter(|s| s.is_empty()).count();
        empty as f64 / mandatory.len() as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: Id,
    pub company_id: Id,
    pub version: u32,
    pub executive_summary: String,
    pub sections: AnalysisSections,
    pub token_breakdown: HashMap<String, TokenBreakdownEntry>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenBreakdownEntry {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// --- TokenUsage ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Analysis,
    Extraction,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub id: Id,
    pub company_id: Id,
    pub call_type: CallType,
    pub section: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

// --- Checkpoint (spec.md §6 — stable, forward-compatible schema) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedUrlEntry {
    pub url: String,
    pub priority: u8,
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub visited: Vec<String>,
    pub queued: Vec<QueuedUrlEntry>,
    pub external_found: Vec<String>,
    pub current_depth: u32,
    pub crawl_start: DateTime<Utc>,
    pub last_checkpoint: DateTime<Utc>,
    pub entities_count: u32,
    pub sections_completed: Vec<String>,
    /// Fields present on load but not named above — preserved and
    /// re-emitted verbatim so older/newer writers can round-trip blobs
    /// they don't fully understand (spec.md §6).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Checkpoint {
    pub fn new(now: DateTime<Utc>) -> Self {
        Checkpoint {
            visited: Vec::new(),
            queued: Vec::new(),
            external_found: Vec::new(),
            current_depth: 0,
            crawl_start: now,
            last_checkpoint: now,
            entities_count: 0,
            sections_completed: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

// --- BatchJob ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: u32,
    pub pending: u32,
    pub in_progress: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl BatchCounts {
    pub fn is_consistent(&self) -> bool {
        self.pending + self.in_progress + self.succeeded + self.failed == self.total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Id,
    pub name: String,
    pub priority: i32,
    pub status: BatchStatus,
    pub per_batch_concurrency_cap: usize,
    pub company_ids: Vec<Id>,
    pub counts: BatchCounts,
    pub created_at: DateTime<Utc>,
    /// Whether `pause` also pauses in-flight companies, not just new starts
    /// (spec.md §9 open question — defaults to "new starts only", see DESIGN.md).
    pub pause_in_flight: bool,
}

impl BatchJob {
    pub fn new(
        id: Id,
        name: String,
        priority: i32,
        per_batch_concurrency_cap: usize,
        company_ids: Vec<Id>,
        now: DateTime<Utc>,
    ) -> Self {
        let total = company_ids.len() as u32;
        BatchJob {
            id,
            name,
            priority,
            status: BatchStatus::Pending,
            per_batch_concurrency_cap,
            company_ids,
            counts: BatchCounts {
                total,
                pending: total,
                in_progress: 0,
                succeeded: 0,
                failed: 0,
            },
            created_at: now,
            pause_in_flight: false,
        }
    }
}

// --- ProgressSnapshot (polling read model, SPEC_FULL §9) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub company_id: Id,
    pub phase: Phase,
    pub pages_crawled: u32,
    pub pages_total: Option<u32>,
    pub entities_extracted: u32,
    pub tokens_used: u64,
    pub elapsed_sec: f64,
    pub est_remaining_sec: Option<f64>,
    pub current_activity: String,
}

// --- Version comparison (control interface: compareVersions) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionDiffEntry {
    pub kind: ChangeKind,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub team: Vec<SectionDiffEntry>,
    pub products: Vec<SectionDiffEntry>,
    pub content: Vec<SectionDiffEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_type_priority_ordering() {
        assert!(PageType::About.priority() < PageType::Team.priority());
        assert!(PageType::Blog.priority() < PageType::News.priority());
        assert_eq!(PageType::Other.priority(), 10);
    }

    #[test]
    fn test_batch_counts_consistency() {
        let counts = BatchCounts {
            total: 10,
            pending: 4,
            in_progress: 2,
            succeeded: 3,
            failed: 1,
        };
        assert!(counts.is_consistent());
    }

    #[test]
    fn test_batch_counts_inconsistent() {
        let counts = BatchCounts {
            total: 10,
            pending: 4,
            in_progress: 2,
            succeeded: 3,
            failed: 0,
        };
        assert!(!counts.is_consistent());
    }

    #[test]
    fn test_analysis_sections_empty_fraction() {
        let mut sections = AnalysisSections::default();
        sections.overview = "x".to_string();
        sections.team = "y".to_string();
        assert!((sections.empty_fraction() - (4.0 / 6.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_checkpoint_preserves_unknown_fields() {
        let json = serde_json::json!({
            "visited": ["https://a.com"],
            "queued": [],
            "externalFound": [],
            "currentDepth": 0,
            "crawlStart": "2024-01-01T00:00:00Z",
            "lastCheckpoint": "2024-01-01T00:00:00Z",
            "entitiesCount": 0,
            "sectionsCompleted": [],
            "future_field": "kept"
        });
        let checkpoint: Checkpoint = serde_json::from_value(json).unwrap();
        assert_eq!(
            checkpoint.extra.get("future_field").unwrap().as_str(),
            Some("kept")
        );
        let round_tripped = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(round_tripped["future_field"], "kept");
    }

    #[test]
    fn test_checkpoint_serializes_stable_camel_case_keys() {
        let checkpoint = Checkpoint::new(Utc::now());
        let value = serde_json::to_value(&checkpoint).unwrap();
        for key in [
            "externalFound",
            "currentDepth",
            "crawlStart",
            "lastCheckpoint",
            "entitiesCount",
            "sectionsCompleted",
        ] {
            assert!(value.get(key).is_some(), "missing stable key: {key}");
        }
    }
}
