use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreError;
use crate::models::{Analysis, BatchJob, Checkpoint, Company, Entity, Page, TokenUsage};

/// Result of a successful HTTP fetch, independent of rate limiting concerns
/// (grounded on the teacher's `RateLimitedFetcher::fetch` return shape,
/// crawler/fetcher.rs). `RateGate` owns the limiting; this trait just fetches.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status_code: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
    pub final_url: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("request timed out")]
    Timeout,
    #[error("too many redirects")]
    TooManyRedirects,
}

/// Pluggable HTTP transport. The real implementation wraps a `reqwest::Client`
/// (see `crawler::fetcher::HttpReqwestFetcher`); tests use an in-memory double.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch_static(&self, url: &str) -> Result<FetchResult, FetchError>;

    /// Render with JavaScript via the out-of-process renderer
    /// (`renderer::JsRenderer`). Only used under the `thorough` crawl mode's
    /// rendered-fetch policy.
    async fn fetch_rendered(&self, url: &str) -> Result<FetchResult, FetchError>;
}

/// Persistence port. The real storage engine (S3/R2/Postgres/whatever) is an
/// out-of-scope external collaborator; `storage::MemoryStorage` is the
/// in-process reference implementation used by the pipeline and tests.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn put_company(&self, company: Company) -> Result<(), CoreError>;
    async fn get_company(&self, id: &str) -> Result<Company, CoreError>;
    async fn list_companies(&self) -> Result<Vec<Company>, CoreError>;
    async fn delete_company(&self, id: &str) -> Result<(), CoreError>;

    async fn put_page(&self, page: Page) -> Result<(), CoreError>;
    async fn list_pages(&self, company_id: &str) -> Result<Vec<Page>, CoreError>;

    async fn put_entities(&self, entities: Vec<Entity>) -> Result<(), CoreError>;
    async fn list_entities(&self, company_id: &str) -> Result<Vec<Entity>, CoreError>;

    async fn put_analysis(&self, analysis: Analysis) -> Result<(), CoreError>;
    async fn list_analyses(&self, company_id: &str) -> Result<Vec<Analysis>, CoreError>;
    async fn latest_analysis(&self, company_id: &str) -> Result<Option<Analysis>, CoreError>;

    async fn record_token_usage(&self, usage: TokenUsage) -> Result<(), CoreError>;

    async fn save_checkpoint(&self, company_id: &str, checkpoint: Checkpoint) -> Result<(), CoreError>;
    async fn load_checkpoint(&self, company_id: &str) -> Result<Option<Checkpoint>, CoreError>;

    async fn put_batch(&self, batch: BatchJob) -> Result<(), CoreError>;
    async fn get_batch(&self, id: &str) -> Result<BatchJob, CoreError>;
    async fn list_batches(&self) -> Result<Vec<BatchJob>, CoreError>;
    async fn delete_batch(&self, id: &str) -> Result<(), CoreError>;

    /// Atomic compare-and-set on a Company's `leaseOwner` (spec.md §6):
    /// succeeds if the lease is unheld or already held by `owner`, so
    /// exactly one runner can hold a company's lease at a time.
    async fn try_acquire_lease(&self, company_id: &str, owner: &str) -> Result<bool, CoreError>;
}

#[derive(Debug, Clone)]
pub struct LlmCallResult {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("context too large")]
    ContextTooLarge,
}

/// LLM analysis backend. One call per analysis section, mirroring how the
/// teacher's lighthouse runner dispatches one audit per page rather than
/// batching (`lighthouse::LighthouseRunner::run`).
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, section: &str, prompt: &str, context: &Value) -> Result<LlmCallResult, LlmError>;
}
