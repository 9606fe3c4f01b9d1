use std::env;

use serde::{Deserialize, Serialize};

/// Per-company crawl/analysis configuration (spec.md §9).
///
/// This is the single recognized configuration record: fields are
/// enumerated explicitly and unknown keys are rejected at construction
/// (`deny_unknown_fields`), rather than accepted as a duck-typed bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompanyConfig {
    #[serde(default)]
    pub mode: CrawlMode,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_time_limit_sec")]
    pub time_limit_sec: u64,
    #[serde(default)]
    pub follow_linkedin: bool,
    #[serde(default)]
    pub follow_twitter: bool,
    #[serde(default)]
    pub follow_facebook: bool,
    #[serde(default)]
    pub exclusion_patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlMode {
    #[default]
    Quick,
    Thorough,
}

fn default_max_pages() -> u32 {
    50
}
fn default_max_depth() -> u32 {
    3
}
fn default_time_limit_sec() -> u64 {
    1800
}

impl CompanyConfig {
    /// Validate construction-time invariants beyond what serde enforces
    /// (`maxPages:int>=0`, `maxDepth:int>=0`, `timeLimitSec:int>0`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_limit_sec == 0 {
            return Err(ConfigError::InvalidValue(
                "time_limit_sec",
                "must be greater than zero",
            ));
        }
        for pattern in &self.exclusion_patterns {
            if pattern.trim().is_empty() {
                return Err(ConfigError::InvalidValue(
                    "exclusion_patterns",
                    "entries must not be empty",
                ));
            }
        }
        Ok(())
    }
}

impl Default for CompanyConfig {
    fn default() -> Self {
        CompanyConfig {
            mode: CrawlMode::default(),
            max_pages: default_max_pages(),
            max_depth: default_max_depth(),
            time_limit_sec: default_time_limit_sec(),
            follow_linkedin: false,
            follow_twitter: false,
            follow_facebook: false,
            exclusion_patterns: Vec::new(),
        }
    }
}

/// Process-wide tunables — the scheduler, checkpoint cadence, staleness
/// threshold, and worker budgets. These are operational knobs, not part of
/// a company's own config, so they load from the environment the same way
/// the teacher's `Config::from_env` does.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub global_concurrency: usize,
    pub default_per_batch_concurrency: usize,
    pub checkpoint_every_pages: u32,
    pub checkpoint_every_secs: u64,
    pub stale_threshold_secs: u64,
    pub max_sitemap_urls: usize,
    pub max_sitemaps: usize,
    pub batch_retention_days: i64,
    pub user_agent: String,
}

impl ProcessConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let global_concurrency = parse_env_or("GLOBAL_CONCURRENCY", 10)?;
        let default_per_batch_concurrency = parse_env_or("PER_BATCH_CONCURRENCY", 3)?;
        let checkpoint_every_pages = parse_env_or("CHECKPOINT_EVERY_PAGES", 10)?;
        let checkpoint_every_secs = parse_env_or("CHECKPOINT_EVERY_SECONDS", 120)?;
        let stale_threshold_secs = parse_env_or("STALE_THRESHOLD_SECS", 3600)?;
        let max_sitemap_urls = parse_env_or("MAX_SITEMAP_URLS", 10_000)?;
        let max_sitemaps = parse_env_or("MAX_SITEMAPS", 50)?;
        let batch_retention_days = parse_env_or("BATCH_RETENTION_DAYS", 7)?;
        let user_agent =
            env::var("CRAWLER_USER_AGENT").unwrap_or_else(|_| "CIRA Bot/1.0".to_string());

        Ok(ProcessConfig {
            global_concurrency,
            default_per_batch_concurrency,
            checkpoint_every_pages,
            checkpoint_every_secs,
            stale_threshold_secs,
            max_sitemap_urls,
            max_sitemaps,
            batch_retention_days,
            user_agent,
        })
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            global_concurrency: 10,
            default_per_batch_concurrency: 3,
            checkpoint_every_pages: 10,
            checkpoint_every_secs: 120,
            stale_threshold_secs: 3600,
            max_sitemap_urls: 10_000,
            max_sitemaps: 50,
            batch_retention_days: 7,
            user_agent: "CIRA Bot/1.0".to_string(),
        }
    }
}

fn parse_env_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key, "failed to parse")),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}
