use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::ProcessConfig;
use crate::crawler::CrawlEngine;
use crate::error::CoreError;
use crate::llm::AnalysisRunner;
use crate::models::{Analysis, Checkpoint, CompanyStatus, Phase};
use crate::ports::{HttpFetcher, LlmClient, Storage};

/// Drives one company through its phase state machine (spec.md §5):
/// `queued -> crawling -> extracting -> analyzing -> generating -> completed`,
/// persisting progress through the `Storage` port as it goes. Generalizes
/// the teacher's job-queue worker loop (jobs/mod.rs), which drove a single
/// "crawl one job, upload results" phase with no further stages or resume
/// semantics of its own.
pub struct PipelineRunner<F: HttpFetcher, L: LlmClient, S: Storage> {
    crawler: Arc<CrawlEngine<F>>,
    analysis: Arc<AnalysisRunner<L>>,
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    process_config: ProcessConfig,
    runner_id: String,
    /// Cancellation tokens for companies currently crawling under this
    /// runner, keyed by company id, so `pause_company` can interrupt an
    /// in-flight crawl rather than waiting for the next phase boundary.
    active_crawls: Mutex<HashMap<String, CancellationToken>>,
}

impl<F: HttpFetcher, L: LlmClient, S: Storage> PipelineRunner<F, L, S> {
    pub fn new(
        crawler: Arc<CrawlEngine<F>>,
        analysis: Arc<AnalysisRunner<L>>,
        storage: Arc<S>,
        clock: Arc<dyn Clock>,
        process_config: ProcessConfig,
    ) -> Self {
        PipelineRunner {
            crawler,
            analysis,
            storage,
            clock,
            process_config,
            runner_id: uuid::Uuid::new_v4().to_string(),
            active_crawls: Mutex::new(HashMap::new()),
        }
    }

    /// Advance a company through every remaining phase until it completes,
    /// fails, or is paused out from under this run. Safe to call again on a
    /// company left mid-crawl by a crashed worker — it resumes from its
    /// saved checkpoint (spec.md §6).
    pub async fn run_company(&self, company_id: &str) -> Result<(), CoreError> {
        let mut company = self.storage.get_company(company_id).await?;
        if !matches!(company.status, CompanyStatus::Pending | CompanyStatus::InProgress) {
            return Err(CoreError::InvalidState(format!(
                "company {company_id} is {:?}, cannot run",
                company.status
            )));
        }

        if !self.storage.try_acquire_lease(company_id, &self.runner_id).await? {
            return Err(CoreError::InvalidState(format!(
                "company {company_id} is leased by another runner"
            )));
        }

        company.status = CompanyStatus::InProgress;
        if company.started_at.is_none() {
            company.started_at = Some(self.clock.now_utc());
        }
        company.lease_owner = Some(self.runner_id.clone());
        self.storage.put_company(company.clone()).await?;
        tracing::info!(company_id, phase = ?company.phase, "starting company run");

        loop {
            let still_running = self.storage.get_company(company_id).await?;
            if still_running.status == CompanyStatus::Paused {
                tracing::info!(company_id, "company paused, stopping run");
                return Ok(());
            }

            match company.phase {
                Phase::Queued => {
                    company.phase = Phase::Crawling;
                    self.storage.put_company(company.clone()).await?;
                }
                Phase::Crawling => {
                    self.run_crawl_phase(&mut company).await?;
                    tracing::info!(company_id, "crawl phase complete");
                }
                Phase::Extracting => {
                    // Entity extraction already ran inline during crawling
                    // (crawler::CrawlEngine); this phase exists as a
                    // reportable checkpoint between crawling and analysis.
                    company.phase = Phase::Analyzing;
                    self.storage.put_company(company.clone()).await?;
                }
                Phase::Analyzing => {
                    self.run_analysis_phase(&mut company).await?;
                    tracing::info!(company_id, "analysis phase complete");
                }
                Phase::Generating => {
                    self.run_generating_phase(&mut company).await?;
                }
                Phase::Completed => {
                    company.status = CompanyStatus::Completed;
                    company.completed_at = Some(self.clock.now_utc());
                    company.lease_owner = None;
                    self.storage.put_company(company.clone()).await?;
                    tracing::info!(company_id, tokens_used = company.tokens_used, "company run complete");
                    return Ok(());
                }
            }
        }
    }

    async fn run_crawl_phase(&self, company: &mut crate::models::Company) -> Result<(), CoreError> {
        let resume = self.storage.load_checkpoint(&company.id).await?;
        let intermediate: Mutex<Vec<Checkpoint>> = Mutex::new(Vec::new());

        let cancel = CancellationToken::new();
        self.active_crawls.lock().unwrap().insert(company.id.clone(), cancel.clone());

        let outcome = self
            .crawler
            .crawl(
                &company.id,
                &company.start_url,
                &company.config_snapshot,
                &self.process_config,
                resume,
                |cp| intermediate.lock().unwrap().push(cp.clone()),
                &cancel,
            )
            .await;

        self.active_crawls.lock().unwrap().remove(&company.id);

        for cp in intermediate.into_inner().unwrap() {
            self.storage.save_checkpoint(&company.id, cp).await?;
        }
        self.storage.save_checkpoint(&company.id, outcome.checkpoint).await?;

        for page in outcome.pages {
            self.storage.put_page(page).await?;
        }
        self.storage.put_entities(outcome.entities).await?;

        if outcome.stop_reason == crate::models::StopReason::Paused {
            tracing::info!(company_id = %company.id, "crawl interrupted by pause");
            return Ok(());
        }

        company.phase = Phase::Extracting;
        self.storage.put_company(company.clone()).await?;
        Ok(())
    }

    async fn run_analysis_phase(&self, company: &mut crate::models::Company) -> Result<(), CoreError> {
        let pages = self.storage.list_pages(&company.id).await?;
        let entities = self.storage.list_entities(&company.id).await?;
        let outcome = self.analysis.run(&company.id, &pages, &entities).await;

        if outcome.sections.empty_fraction() > 0.5 {
            company.status = CompanyStatus::Failed;
            company.fail_reason = Some("more than half of analysis sections failed".to_string());
            company.lease_owner = None;
            self.storage.put_company(company.clone()).await?;
            return Err(CoreError::Permanent("analysis section failure threshold exceeded".to_string()));
        }

        let next_version = self.storage.latest_analysis(&company.id).await?.map(|a| a.version + 1).unwrap_or(1);
        let executive_summary = summarize(&outcome.sections);

        self.storage
            .put_analysis(Analysis {
                id: uuid::Uuid::new_v4().to_string(),
                company_id: company.id.clone(),
                version: next_version,
                executive_summary,
                sections: outcome.sections,
                token_breakdown: outcome.token_breakdown,
                created_at: self.clock.now_utc(),
            })
            .await?;

        for usage in outcome.token_usage {
            company.tokens_used += usage.input_tokens + usage.output_tokens;
            self.storage.record_token_usage(usage).await?;
        }

        company.phase = Phase::Generating;
        self.storage.put_company(company.clone()).await?;
        Ok(())
    }

    async fn run_generating_phase(&self, company: &mut crate::models::Company) -> Result<(), CoreError> {
        // Cost estimation per spec.md §5 — a flat per-thousand-token rate
        // stands in for the real provider pricing table, which is an
        // external collaborator concern outside this crate's scope.
        const EST_COST_PER_1K_TOKENS: f64 = 0.01;
        company.est_cost = (company.tokens_used as f64 / 1000.0) * EST_COST_PER_1K_TOKENS;
        company.phase = Phase::Completed;
        self.storage.put_company(company.clone()).await?;
        Ok(())
    }

    /// Pause a company that's currently running — in-flight crawl work
    /// finishes its current page and checkpoints; no new phase work starts
    /// on the next `run_company` poll. See DESIGN.md for the
    /// pause-in-flight open-question decision.
    pub async fn pause_company(&self, company_id: &str) -> Result<(), CoreError> {
        let mut company = self.storage.get_company(company_id).await?;
        if company.status != CompanyStatus::InProgress {
            return Err(CoreError::InvalidState(format!("company {company_id} is not in progress")));
        }
        company.status = CompanyStatus::Paused;
        self.storage.put_company(company).await?;

        if let Some(cancel) = self.active_crawls.lock().unwrap().get(company_id) {
            cancel.cancel();
        }
        Ok(())
    }

    pub async fn resume_company(&self, company_id: &str) -> Result<(), CoreError> {
        let mut company = self.storage.get_company(company_id).await?;
        if company.status != CompanyStatus::Paused {
            return Err(CoreError::InvalidState(format!("company {company_id} is not paused")));
        }
        company.status = CompanyStatus::Pending;
        self.storage.put_company(company).await
    }

    /// Re-run a company from scratch, discarding its crawl checkpoint but
    /// keeping prior `Analysis` versions for `compareVersions` (spec.md §8).
    pub async fn rescan_company(&self, company_id: &str) -> Result<(), CoreError> {
        let mut company = self.storage.get_company(company_id).await?;
        if company.status == CompanyStatus::InProgress {
            return Err(CoreError::InvalidState(format!("company {company_id} is already running")));
        }
        company.status = CompanyStatus::Pending;
        company.phase = Phase::Queued;
        company.started_at = None;
        company.completed_at = None;
        company.fail_reason = None;
        self.storage.save_checkpoint(company_id, Checkpoint::new(self.clock.now_utc())).await?;
        self.storage.put_company(company).await
    }

    pub async fn cancel_company(&self, company_id: &str) -> Result<(), CoreError> {
        let mut company = self.storage.get_company(company_id).await?;
        company.status = CompanyStatus::Failed;
        company.fail_reason = Some("cancelled".to_string());
        company.lease_owner = None;
        self.storage.put_company(company).await
    }

    /// Scan every `in_progress` Company on process start (spec.md §4.5): one
    /// whose last checkpoint is older than `stale_threshold_secs` is marked
    /// `failed` with reason "stale"; a fresher one has its lease cleared so a
    /// runner can re-claim and resume it. Returns the ids safe to resume.
    pub async fn recover_stale_and_resume(&self) -> Result<Vec<String>, CoreError> {
        let now = self.clock.now_utc();
        let mut resumable = Vec::new();

        for mut company in self.storage.list_companies().await? {
            if company.status != CompanyStatus::InProgress {
                continue;
            }

            let checkpoint = self.storage.load_checkpoint(&company.id).await?;
            let age_secs = checkpoint
                .as_ref()
                .map(|cp| (now - cp.last_checkpoint).num_seconds().max(0) as u64)
                .unwrap_or(u64::MAX);

            if age_secs > self.process_config.stale_threshold_secs {
                tracing::warn!(company_id = %company.id, age_secs, "recovering stale company run");
                company.status = CompanyStatus::Failed;
                company.fail_reason = Some("stale".to_string());
                company.lease_owner = None;
                self.storage.put_company(company).await?;
            } else {
                company.lease_owner = None;
                self.storage.put_company(company.clone()).await?;
                resumable.push(company.id);
            }
        }

        Ok(resumable)
    }
}

#[async_trait::async_trait]
impl<F, L, S> crate::scheduler::CompanyRunner for PipelineRunner<F, L, S>
where
    F: HttpFetcher + Send + Sync + 'static,
    L: LlmClient + Send + Sync + 'static,
    S: Storage + Send + Sync + 'static,
{
    async fn run_company(&self, company_id: &str) -> Result<(), CoreError> {
        PipelineRunner::run_company(self, company_id).await
    }
}

fn summarize(sections: &crate::models::AnalysisSections) -> String {
    let overview = sections.overview.trim();
    if overview.is_empty() {
        "No summary available.".to_string()
    } else {
        overview.chars().take(280).collect()
    }
}
