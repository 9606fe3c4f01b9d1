use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::models::{Analysis, BatchJob, Checkpoint, Company, Entity, Page, TokenUsage};
use crate::ports::Storage;

/// In-process reference implementation of the `Storage` port, replacing the
/// teacher's R2/S3-backed `StorageClient` (storage/mod.rs) — the real
/// durable store is an out-of-scope external collaborator here (spec.md's
/// persistence Non-goal), so this exists to make the pipeline and control
/// API runnable and testable without one.
#[derive(Default)]
pub struct MemoryStorage {
    companies: RwLock<HashMap<String, Company>>,
    pages: RwLock<HashMap<String, Vec<Page>>>,
    entities: RwLock<HashMap<String, Vec<Entity>>>,
    analyses: RwLock<HashMap<String, Vec<Analysis>>>,
    token_usage: RwLock<Vec<TokenUsage>>,
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    batches: RwLock<HashMap<String, BatchJob>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

fn lock_err(what: &str) -> CoreError {
    CoreError::Fatal(format!("{what} lock poisoned"))
}

/// Analysis versions kept per company (spec.md §3/§8/Glossary) — oldest
/// pruned once a newer version pushes the count past this.
const ANALYSIS_RETENTION_LIMIT: usize = 3;

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_company(&self, company: Company) -> Result<(), CoreError> {
        self.companies
            .write()
            .map_err(|_| lock_err("companies"))?
            .insert(company.id.clone(), company);
        Ok(())
    }

    async fn get_company(&self, id: &str) -> Result<Company, CoreError> {
        self.companies
            .read()
            .map_err(|_| lock_err("companies"))?
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("company {id}")))
    }

    async fn list_companies(&self) -> Result<Vec<Company>, CoreError> {
        Ok(self.companies.read().map_err(|_| lock_err("companies"))?.values().cloned().collect())
    }

    async fn delete_company(&self, id: &str) -> Result<(), CoreError> {
        self.companies.write().map_err(|_| lock_err("companies"))?.remove(id);
        self.pages.write().map_err(|_| lock_err("pages"))?.remove(id);
        self.entities.write().map_err(|_| lock_err("entities"))?.remove(id);
        self.analyses.write().map_err(|_| lock_err("analyses"))?.remove(id);
        self.checkpoints.write().map_err(|_| lock_err("checkpoints"))?.remove(id);
        Ok(())
    }

    async fn put_page(&self, page: Page) -> Result<(), CoreError> {
        let mut pages = self.pages.write().map_err(|_| lock_err("pages"))?;
        let entry = pages.entry(page.company_id.clone()).or_default();
        if let Some(existing) = entry.iter_mut().find(|p| p.url == page.url) {
            *existing = page;
        } else {
            entry.push(page);
        }
        Ok(())
    }

    async fn list_pages(&self, company_id: &str) -> Result<Vec<Page>, CoreError> {
        Ok(self.pages.read().map_err(|_| lock_err("pages"))?.get(company_id).cloned().unwrap_or_default())
    }

    async fn put_entities(&self, new_entities: Vec<Entity>) -> Result<(), CoreError> {
        let mut entities = self.entities.write().map_err(|_| lock_err("entities"))?;
        for entity in new_entities {
            entities.entry(entity.company_id.clone()).or_default().push(entity);
        }
        Ok(())
    }

    async fn list_entities(&self, company_id: &str) -> Result<Vec<Entity>, CoreError> {
        Ok(self.entities.read().map_err(|_| lock_err("entities"))?.get(company_id).cloned().unwrap_or_default())
    }

    async fn put_analysis(&self, analysis: Analysis) -> Result<(), CoreError> {
        let mut analyses = self.analyses.write().map_err(|_| lock_err("analyses"))?;
        let versions = analyses.entry(analysis.company_id.clone()).or_default();
        versions.push(analysis);
        versions.sort_by_key(|a| a.version);
        if versions.len() > ANALYSIS_RETENTION_LIMIT {
            let excess = versions.len() - ANALYSIS_RETENTION_LIMIT;
            versions.drain(0..excess);
        }
        Ok(())
    }

    async fn list_analyses(&self, company_id: &str) -> Result<Vec<Analysis>, CoreError> {
        Ok(self.analyses.read().map_err(|_| lock_err("analyses"))?.get(company_id).cloned().unwrap_or_default())
    }

    async fn latest_analysis(&self, company_id: &str) -> Result<Option<Analysis>, CoreError> {
        Ok(self
            .analyses
            .read()
            .map_err(|_| lock_err("analyses"))?
            .get(company_id)
            .and_then(|versions| versions.iter().max_by_key(|a| a.version).cloned()))
    }

    async fn record_token_usage(&self, usage: TokenUsage) -> Result<(), CoreError> {
        self.token_usage.write().map_err(|_| lock_err("token_usage"))?.push(usage);
        Ok(())
    }

    async fn save_checkpoint(&self, company_id: &str, checkpoint: Checkpoint) -> Result<(), CoreError> {
        self.checkpoints
            .write()
            .map_err(|_| lock_err("checkpoints"))?
            .insert(company_id.to_string(), checkpoint);
        Ok(())
    }

    async fn load_checkpoint(&self, company_id: &str) -> Result<Option<Checkpoint>, CoreError> {
        Ok(self.checkpoints.read().map_err(|_| lock_err("checkpoints"))?.get(company_id).cloned())
    }

    async fn put_batch(&self, batch: BatchJob) -> Result<(), CoreError> {
        self.batches.write().map_err(|_| lock_err("batches"))?.insert(batch.id.clone(), batch);
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<BatchJob, CoreError> {
        self.batches
            .read()
            .map_err(|_| lock_err("batches"))?
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("batch {id}")))
    }

    async fn list_batches(&self) -> Result<Vec<BatchJob>, CoreError> {
        Ok(self.batches.read().map_err(|_| lock_err("batches"))?.values().cloned().collect())
    }

    async fn delete_batch(&self, id: &str) -> Result<(), CoreError> {
        self.batches.write().map_err(|_| lock_err("batches"))?.remove(id);
        Ok(())
    }

    async fn try_acquire_lease(&self, company_id: &str, owner: &str) -> Result<bool, CoreError> {
        let mut companies = self.companies.write().map_err(|_| lock_err("companies"))?;
        let company = companies
            .get_mut(company_id)
            .ok_or_else(|| CoreError::NotFound(format!("company {company_id}")))?;
        match &company.lease_owner {
            None => {
                company.lease_owner = Some(owner.to_string());
                Ok(true)
            }
            Some(current) if current == owner => Ok(true),
            Some(_) => Ok(false),
        }
    }
}
