use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{BatchJob, BatchStatus};
use crate::ports::Storage;

/// Abstraction over "run one company through the pipeline", so the
/// scheduler doesn't need to be generic over the fetcher/LLM/storage type
/// parameters `PipelineRunner` carries.
#[async_trait::async_trait]
pub trait CompanyRunner: Send + Sync {
    async fn run_company(&self, company_id: &str) -> Result<(), CoreError>;
}

struct ActiveBatch {
    queue: VecDeque<String>,
    in_flight: usize,
    cap: usize,
    priority: i32,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    paused: bool,
}

struct DispatcherState {
    batches: HashMap<String, ActiveBatch>,
}

/// Fair round-robin dispatcher across concurrently active batches
/// (spec.md §6), generalized from the teacher's `JobManager` mpsc/`JoinSet`
/// queue-worker pattern (jobs/mod.rs) — one channel-fed consumer loop there
/// served a single flat job queue; here the loop round-robins across many
/// independently paused/cancelled batches while respecting both a global
/// and a per-batch concurrency cap.
pub struct BatchScheduler<S: Storage> {
    storage: Arc<S>,
    runner: Arc<dyn CompanyRunner>,
    global_semaphore: Arc<Semaphore>,
    state: Arc<Mutex<DispatcherState>>,
    wake: Arc<Notify>,
}

impl<S: Storage + 'static> BatchScheduler<S> {
    pub fn new(storage: Arc<S>, runner: Arc<dyn CompanyRunner>, global_concurrency: usize) -> Self {
        let scheduler = BatchScheduler {
            storage,
            runner,
            global_semaphore: Arc::new(Semaphore::new(global_concurrency.max(1))),
            state: Arc::new(Mutex::new(DispatcherState { batches: HashMap::new() })),
            wake: Arc::new(Notify::new()),
        };
        scheduler.spawn_dispatcher();
        scheduler
    }

    pub async fn create_batch(
        &self,
        name: String,
        priority: i32,
        company_ids: Vec<String>,
        per_batch_concurrency_cap: usize,
        now: DateTime<Utc>,
    ) -> Result<BatchJob, CoreError> {
        let batch = BatchJob::new(Uuid::new_v4().to_string(), name, priority, per_batch_concurrency_cap, company_ids, now);
        self.storage.put_batch(batch.clone()).await?;
        Ok(batch)
    }

    pub async fn start_batch(&self, batch_id: &str) -> Result<(), CoreError> {
        let mut batch = self.storage.get_batch(batch_id).await?;
        if !matches!(batch.status, BatchStatus::Pending | BatchStatus::Paused) {
            return Err(CoreError::InvalidState(format!("batch {batch_id} cannot be started from {:?}", batch.status)));
        }
        batch.status = BatchStatus::Processing;
        self.storage.put_batch(batch.clone()).await?;
        tracing::info!(batch_id, company_count = batch.company_ids.len(), "batch started");

        let mut state = self.state.lock().await;
        let entry = state.batches.entry(batch_id.to_string()).or_insert_with(|| ActiveBatch {
            queue: VecDeque::new(),
            in_flight: 0,
            cap: batch.per_batch_concurrency_cap.max(1),
            priority: batch.priority,
            created_at: batch.created_at,
            cancel: CancellationToken::new(),
            paused: false,
        });
        entry.paused = false;
        if entry.queue.is_empty() && entry.in_flight == 0 {
            entry.queue = batch.company_ids.iter().cloned().collect();
        }
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    /// Pause a batch: in-flight companies finish their current `run_company`
    /// call, but no new ones start from this batch's queue until resumed.
    pub async fn pause_batch(&self, batch_id: &str) -> Result<(), CoreError> {
        let mut batch = self.storage.get_batch(batch_id).await?;
        batch.status = BatchStatus::Paused;
        self.storage.put_batch(batch).await?;

        let mut state = self.state.lock().await;
        if let Some(active) = state.batches.get_mut(batch_id) {
            active.paused = true;
        }
        Ok(())
    }

    pub async fn resume_batch(&self, batch_id: &str) -> Result<(), CoreError> {
        self.start_batch(batch_id).await
    }

    /// Cancel a batch outright: its remaining queue is dropped and its
    /// cancellation token is tripped so the dispatcher stops pulling from it.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<(), CoreError> {
        let mut batch = self.storage.get_batch(batch_id).await?;
        batch.status = BatchStatus::Cancelled;
        self.storage.put_batch(batch).await?;

        let mut state = self.state.lock().await;
        if let Some(active) = state.batches.remove(batch_id) {
            active.cancel.cancel();
        }
        tracing::info!(batch_id, "batch cancelled");
        Ok(())
    }

    /// Remove completed/cancelled batches older than the retention window
    /// (spec.md §9, `ProcessConfig::batch_retention_days`).
    pub async fn cleanup_expired(&self, retention_days: i64, now: DateTime<Utc>) -> Result<u32, CoreError> {
        let batches = self.storage.list_batches().await?;
        let mut removed = 0;
        for batch in batches {
            let is_terminal = matches!(batch.status, BatchStatus::Completed | BatchStatus::Cancelled);
            let age = now.signed_duration_since(batch.created_at);
            if is_terminal && age.num_days() >= retention_days {
                self.storage.delete_batch(&batch.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn spawn_dispatcher(&self) {
        let state = self.state.clone();
        let storage = self.storage.clone();
        let runner = self.runner.clone();
        let global = self.global_semaphore.clone();
        let wake = self.wake.clone();

        tokio::spawn(async move {
            let mut join_set: JoinSet<(String, String, Result<(), CoreError>)> = JoinSet::new();
            loop {
                let round = {
                    let mut guard = state.lock().await;
                    pick_round(&mut guard)
                };

                if round.is_empty() {
                    tokio::select! {
                        _ = wake.notified() => {}
                        Some(finished) = join_set.join_next(), if !join_set.is_empty() => {
                            if let Ok((batch_id, _company_id, result)) = finished {
                                record_completion(&state, &storage, &batch_id, result).await;
                            }
                        }
                    }
                    continue;
                }

                for (batch_id, company_id, cancel) in round {
                    mark_dispatched(&storage, &batch_id).await;
                    let Ok(permit) = global.clone().acquire_owned().await else { break };
                    let runner = runner.clone();
                    let cancel_for_task = cancel.clone();
                    join_set.spawn(async move {
                        let _permit = permit;
                        let result = tokio::select! {
                            r = runner.run_company(&company_id) => r,
                            _ = cancel_for_task.cancelled() => Err(CoreError::Cancelled),
                        };
                        (batch_id, company_id, result)
                    });
                }

                while let Some(finished) = join_set.try_join_next() {
                    if let Ok((batch_id, _company_id, result)) = finished {
                        record_completion(&state, &storage, &batch_id, result).await;
                    }
                }
            }
        });
    }
}

/// Enumerate batches eligible to start another company, sorted by
/// `(priority ascending, createdAt ascending)` — lower priority number means
/// earlier — and pop at most one company per eligible batch. Called once per
/// dispatcher round so two equal-priority batches advance in lockstep rather
/// than one draining to its per-batch cap before the other gets a turn.
fn pick_round(state: &mut DispatcherState) -> Vec<(String, String, CancellationToken)> {
    let mut candidates: Vec<String> = state
        .batches
        .iter()
        .filter(|(_, b)| !b.paused && !b.queue.is_empty() && b.in_flight < b.cap)
        .map(|(id, _)| id.clone())
        .collect();

    candidates.sort_by(|a, b| {
        let ba = &state.batches[a];
        let bb = &state.batches[b];
        ba.priority.cmp(&bb.priority).then(ba.created_at.cmp(&bb.created_at))
    });

    let mut picked = Vec::new();
    for batch_id in candidates {
        if let Some(active) = state.batches.get_mut(&batch_id) {
            if let Some(company_id) = active.queue.pop_front() {
                active.in_flight += 1;
                picked.push((batch_id, company_id, active.cancel.clone()));
            }
        }
    }
    picked
}

/// Move one company from `pending` to `in_progress` in the persisted batch
/// counters at the moment it's handed to a task, so the counters reflect
/// reality even while the task is still waiting on the global semaphore.
async fn mark_dispatched<S: Storage>(storage: &Arc<S>, batch_id: &str) {
    if let Ok(mut batch) = storage.get_batch(batch_id).await {
        batch.counts.pending = batch.counts.pending.saturating_sub(1);
        batch.counts.in_progress += 1;
        let _ = storage.put_batch(batch).await;
    }
}

async fn record_completion<S: Storage>(
    state: &Arc<Mutex<DispatcherState>>,
    storage: &Arc<S>,
    batch_id: &str,
    result: Result<(), CoreError>,
) {
    let mut finished_batch = false;
    {
        let mut guard = state.lock().await;
        if let Some(active) = guard.batches.get_mut(batch_id) {
            active.in_flight = active.in_flight.saturating_sub(1);
            finished_batch = active.queue.is_empty() && active.in_flight == 0;
        }
    }

    if let Ok(mut batch) = storage.get_batch(batch_id).await {
        batch.counts.in_progress = batch.counts.in_progress.saturating_sub(1);
        match result {
            Ok(()) => batch.counts.succeeded += 1,
            Err(_) => batch.counts.failed += 1,
        }
        if finished_batch && batch.status == BatchStatus::Processing {
            batch.status = BatchStatus::Completed;
            tracing::info!(batch_id, succeeded = batch.counts.succeeded, failed = batch.counts.failed, "batch completed");
        }
        let _ = storage.put_batch(batch).await;
    }

    if finished_batch {
        state.lock().await.batches.remove(batch_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRunner {
        calls: AtomicUsize,
        max_concurrent: AtomicUsize,
        current: AtomicUsize,
    }

    impl CountingRunner {
        fn new() -> Self {
            CountingRunner { calls: AtomicUsize::new(0), max_concurrent: AtomicUsize::new(0), current: AtomicUsize::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl CompanyRunner for CountingRunner {
        async fn run_company(&self, _company_id: &str) -> Result<(), CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batch_runs_all_companies() {
        let storage = Arc::new(MemoryStorage::new());
        let runner = Arc::new(CountingRunner::new());
        let scheduler = BatchScheduler::new(storage.clone(), runner.clone(), 10);

        let batch = scheduler
            .create_batch(
                "b1".to_string(),
                0,
                vec!["co1".to_string(), "co2".to_string(), "co3".to_string()],
                10,
                Utc::now(),
            )
            .await
            .unwrap();
        scheduler.start_batch(&batch.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);

        let stored = storage.get_batch(&batch.id).await.unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_eq!(stored.counts.succeeded, 3);
    }

    #[tokio::test]
    async fn test_per_batch_cap_limits_concurrency() {
        let storage = Arc::new(MemoryStorage::new());
        let runner = Arc::new(CountingRunner::new());
        let scheduler = BatchScheduler::new(storage.clone(), runner.clone(), 10);

        let ids: Vec<String> = (0..5).map(|i| format!("co{i}")).collect();
        let batch = scheduler.create_batch("b1".to_string(), 0, ids, 2, Utc::now()).await.unwrap();
        scheduler.start_batch(&batch.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(runner.max_concurrent.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancel_batch_stops_remaining_work() {
        let storage = Arc::new(MemoryStorage::new());
        let runner = Arc::new(CountingRunner::new());
        let scheduler = BatchScheduler::new(storage.clone(), runner.clone(), 1);

        let ids: Vec<String> = (0..10).map(|i| format!("co{i}")).collect();
        let batch = scheduler.create_batch("b1".to_string(), 0, ids, 1, Utc::now()).await.unwrap();
        scheduler.start_batch(&batch.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.cancel_batch(&batch.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(runner.calls.load(Ordering::SeqCst) < 10);
    }

    #[tokio::test]
    async fn test_cleanup_expired_removes_old_terminal_batches() {
        let storage = Arc::new(MemoryStorage::new());
        let runner = Arc::new(CountingRunner::new());
        let scheduler = BatchScheduler::new(storage.clone(), runner, 5);

        let old_created_at = Utc::now() - chrono::Duration::days(30);
        let mut batch = BatchJob::new("old".to_string(), "old batch".to_string(), 0, 1, vec![], old_created_at);
        batch.status = BatchStatus::Completed;
        storage.put_batch(batch).await.unwrap();

        let removed = scheduler.cleanup_expired(7, Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(storage.get_batch("old").await.is_err());
    }
}
