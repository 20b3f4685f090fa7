use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::progress::{self, ProgressStore};
use super::{BatchJob, JobContext, MessageCode, StepOutcome, StepReport};
use crate::diagnostics::{DiagnosticLog, TracingDiagnostics};

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Persisted state of one job id.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub step: u32,
    pub per_step: u32,
    pub current_count: u64,
    pub total_count: Option<u64>,
    pub params: Value,
}

impl JobProgress {
    pub async fn load(store: &dyn ProgressStore, job_id: &str) -> Result<Option<Self>> {
        let Some(step) = progress::get_u64(store, &progress::key(job_id, progress::STEP)).await?
        else {
            return Ok(None);
        };
        let per_step = progress::get_u64(store, &progress::key(job_id, progress::PER_STEP))
            .await?
            .ok_or_else(|| anyhow!("job {} has a step but no per_step", job_id))?;
        let current_count =
            progress::get_u64(store, &progress::key(job_id, progress::CURRENT_COUNT))
                .await?
                .unwrap_or(0);
        let total_count =
            progress::get_u64(store, &progress::key(job_id, progress::TOTAL_COUNT)).await?;
        let params = match store.get(&progress::key(job_id, progress::PARAMS)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("job {} has unreadable params", job_id))?,
            None => Value::Null,
        };
        Ok(Some(Self {
            step: u32::try_from(step).context("persisted step out of range")?,
            per_step: u32::try_from(per_step).context("persisted per_step out of range")?,
            current_count,
            total_count,
            params,
        }))
    }

    async fn save_all(&self, store: &dyn ProgressStore, job_id: &str) -> Result<()> {
        store
            .set(&progress::key(job_id, progress::PARAMS), &self.params.to_string())
            .await?;
        store
            .set(&progress::key(job_id, progress::PER_STEP), &self.per_step.to_string())
            .await?;
        self.save_counters(store, job_id).await
    }

    async fn save_counters(&self, store: &dyn ProgressStore, job_id: &str) -> Result<()> {
        store
            .set(
                &progress::key(job_id, progress::CURRENT_COUNT),
                &self.current_count.to_string(),
            )
            .await?;
        if let Some(total) = self.total_count {
            store
                .set(&progress::key(job_id, progress::TOTAL_COUNT), &total.to_string())
                .await?;
        }
        // Step last: its presence marks the job as started.
        store
            .set(&progress::key(job_id, progress::STEP), &self.step.to_string())
            .await
    }

    fn context<'a>(&'a self, job_id: &'a str, store: &'a dyn ProgressStore) -> JobContext<'a> {
        JobContext {
            job_id,
            params: &self.params,
            store,
            step: self.step,
            per_step: self.per_step,
            current_count: self.current_count,
            total_count: self.total_count,
        }
    }
}

/// Drives one job one step per [`dispatch`](Runner::dispatch).
///
/// `pre_fetch` runs once per runner instance. A polling surface that builds a
/// fresh runner per request therefore pre-fetches on every dispatch, while a
/// long-lived runner does so once.
pub struct Runner<J> {
    job: J,
    store: Arc<dyn ProgressStore>,
    diagnostics: Arc<dyn DiagnosticLog>,
    params: Value,
    per_step: Option<u32>,
    lease_ttl: Duration,
    holder: String,
    prefetched: bool,
    current_count: u64,
}

impl<J: BatchJob> Runner<J> {
    pub fn new(job: J, store: Arc<dyn ProgressStore>) -> Self {
        Self {
            job,
            store,
            diagnostics: Arc::new(TracingDiagnostics),
            params: Value::Null,
            per_step: None,
            lease_ttl: DEFAULT_LEASE,
            holder: Uuid::new_v4().to_string(),
            prefetched: false,
            current_count: 0,
        }
    }

    /// Parameters handed to `init` when this dispatch creates the job.
    /// Ignored once the job has persisted progress.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Page size for a newly created job. A resumed job keeps its own.
    pub fn with_per_step(mut self, per_step: u32) -> Self {
        self.per_step = Some(per_step.max(1));
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticLog>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn current_count(&self) -> u64 {
        self.current_count
    }

    pub async fn progress(&self) -> Result<Option<JobProgress>> {
        JobProgress::load(self.store.as_ref(), self.job.id()).await
    }

    /// Presentation text for `code`, using the last known count.
    pub fn get_message(&self, code: MessageCode) -> String {
        self.job.message(code, self.current_count)
    }

    /// Forget persisted progress without running `finish`.
    pub async fn reset(&mut self) -> Result<()> {
        clear_runner_fields(self.store.as_ref(), self.job.id()).await?;
        self.current_count = 0;
        self.prefetched = false;
        info!(job_id = self.job.id(), "job progress reset");
        Ok(())
    }

    /// Run exactly one step of the job.
    #[instrument(skip(self), fields(job_id = self.job.id()))]
    pub async fn dispatch(&mut self) -> Result<StepOutcome> {
        let job_id = self.job.id().to_string();
        if !self
            .store
            .acquire_lease(&job_id, &self.holder, self.lease_ttl)
            .await?
        {
            self.diagnostics
                .log("job already running", json!({ "job_id": job_id }));
            return Ok(StepOutcome::AlreadyRunning);
        }

        let result = self.dispatch_leased(&job_id).await;

        if let Err(err) = self.store.release_lease(&job_id, &self.holder).await {
            warn!(?err, job_id, "failed to release job lease");
        }
        if let Err(err) = &result {
            self.diagnostics.log(
                "job step failed",
                json!({ "job_id": job_id, "error": format!("{:#}", err) }),
            );
        }
        result
    }

    /// Dispatch until done. Fails if another dispatch holds the lease.
    pub async fn run_to_completion(&mut self) -> Result<u64> {
        loop {
            match self.dispatch().await? {
                StepOutcome::Next(step) => {
                    info!(
                        job_id = self.job.id(),
                        step,
                        processed = self.current_count,
                        "job progress"
                    );
                }
                StepOutcome::Done { processed } => return Ok(processed),
                StepOutcome::AlreadyRunning => {
                    return Err(anyhow!("job {} is already running", self.job.id()))
                }
            }
        }
    }

    async fn dispatch_leased(&mut self, job_id: &str) -> Result<StepOutcome> {
        let store = self.store.clone();
        let store = store.as_ref();

        let mut state = match JobProgress::load(store, job_id).await? {
            Some(state) => state,
            None => {
                let state = JobProgress {
                    step: 1,
                    per_step: self.per_step.unwrap_or_else(|| self.job.per_step()).max(1),
                    current_count: 0,
                    total_count: None,
                    params: self.params.clone(),
                };
                // Persist only after init succeeds so a failed init reruns.
                self.job.init(&state.context(job_id, store)).await?;
                state.save_all(store, job_id).await?;
                self.prefetched = false;
                info!(job_id, per_step = state.per_step, "job created");
                state
            }
        };

        if !self.prefetched {
            let total = self.job.pre_fetch(&state.context(job_id, store)).await?;
            if state.total_count.is_none() {
                if let Some(total) = total {
                    state.total_count = Some(total);
                    store
                        .set(&progress::key(job_id, progress::TOTAL_COUNT), &total.to_string())
                        .await?;
                }
            }
            self.prefetched = true;
        }
        self.current_count = state.current_count;

        let satisfied = state
            .total_count
            .is_some_and(|total| state.current_count >= total);
        let report = if satisfied {
            StepReport::default()
        } else {
            self.job
                .process_step(&state.context(job_id, store))
                .await?
        };

        state.current_count += report.processed;
        self.current_count = state.current_count;

        let done = match state.total_count {
            Some(total) if state.current_count >= total => true,
            Some(total) if report.fetched == 0 => {
                self.diagnostics.log(
                    "job input exhausted before total_count",
                    json!({
                        "job_id": job_id,
                        "step": state.step,
                        "current_count": state.current_count,
                        "total_count": total,
                    }),
                );
                true
            }
            Some(_) => false,
            None => report.fetched == 0,
        };

        self.diagnostics.log(
            "job step completed",
            json!({
                "job_id": job_id,
                "step": state.step,
                "offset": state.context(job_id, store).offset(),
                "fetched": report.fetched,
                "processed": report.processed,
                "current_count": state.current_count,
                "total_count": state.total_count,
                "done": done,
            }),
        );

        if !done {
            state.step += 1;
            state.save_counters(store, job_id).await?;
            return Ok(StepOutcome::Next(state.step));
        }

        state.save_counters(store, job_id).await?;
        self.job.finish(&state.context(job_id, store)).await?;
        clear_runner_fields(store, job_id).await?;
        self.prefetched = false;
        info!(job_id, processed = state.current_count, "job finished");
        Ok(StepOutcome::Done {
            processed: state.current_count,
        })
    }
}

async fn clear_runner_fields(store: &dyn ProgressStore, job_id: &str) -> Result<()> {
    // Step first, so a partial clear reads as "not started".
    for field in progress::RUNNER_FIELDS {
        store.delete(&progress::key(job_id, field)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MemoryDiagnostics;
    use crate::jobs::SqliteProgressStore;
    use async_trait::async_trait;
    use sqlx::SqlitePool;
    use std::sync::Mutex;

    /// Pages over `items` and records every offset it was asked for.
    struct PagingJob {
        items: u64,
        known_total: bool,
        fail_at_step: Option<u32>,
        offsets: Arc<Mutex<Vec<u64>>>,
        finished: Arc<Mutex<u32>>,
    }

    impl PagingJob {
        fn new(items: u64, known_total: bool) -> Self {
            Self {
                items,
                known_total,
                fail_at_step: None,
                offsets: Arc::default(),
                finished: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl BatchJob for PagingJob {
        fn id(&self) -> &str {
            "paging"
        }

        async fn pre_fetch(&mut self, _ctx: &JobContext<'_>) -> Result<Option<u64>> {
            Ok(self.known_total.then_some(self.items))
        }

        async fn process_step(&mut self, ctx: &JobContext<'_>) -> Result<StepReport> {
            if self.fail_at_step == Some(ctx.step) {
                anyhow::bail!("source unavailable");
            }
            self.offsets.lock().unwrap().push(ctx.offset());
            let remaining = self.items.saturating_sub(ctx.offset());
            let page = remaining.min(u64::from(ctx.per_step));
            Ok(StepReport {
                fetched: page as usize,
                processed: page,
            })
        }

        async fn finish(&mut self, _ctx: &JobContext<'_>) -> Result<()> {
            *self.finished.lock().unwrap() += 1;
            Ok(())
        }
    }

    async fn store() -> Arc<SqliteProgressStore> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Arc::new(SqliteProgressStore::new(pool))
    }

    #[tokio::test]
    async fn pages_until_total_then_clears_progress() {
        let store = store().await;
        let job = PagingJob::new(125, true);
        let offsets = job.offsets.clone();
        let finished = job.finished.clone();
        let mut runner = Runner::new(job, store.clone()).with_per_step(50);

        assert_eq!(runner.dispatch().await.unwrap(), StepOutcome::Next(2));
        let saved = runner.progress().await.unwrap().unwrap();
        assert_eq!((saved.step, saved.current_count, saved.total_count), (2, 50, Some(125)));

        assert_eq!(runner.dispatch().await.unwrap(), StepOutcome::Next(3));
        assert_eq!(
            runner.dispatch().await.unwrap(),
            StepOutcome::Done { processed: 125 }
        );

        assert_eq!(*offsets.lock().unwrap(), vec![0, 50, 100]);
        assert_eq!(*finished.lock().unwrap(), 1);
        assert_eq!(runner.progress().await.unwrap(), None);
        assert_eq!(runner.get_message(MessageCode::Done), "125 items processed.");
    }

    #[tokio::test]
    async fn resumes_from_persisted_step_with_persisted_page_size() {
        let store = store().await;
        for (field, value) in [
            (progress::STEP, "3"),
            (progress::PER_STEP, "50"),
            (progress::CURRENT_COUNT, "100"),
            (progress::TOTAL_COUNT, "125"),
        ] {
            store.set(&progress::key("paging", field), value).await.unwrap();
        }

        let job = PagingJob::new(125, true);
        let offsets = job.offsets.clone();
        // A different page size on the new runner does not apply to a resumed job.
        let mut runner = Runner::new(job, store).with_per_step(10);
        assert_eq!(
            runner.dispatch().await.unwrap(),
            StepOutcome::Done { processed: 125 }
        );
        assert_eq!(*offsets.lock().unwrap(), vec![100]);
    }

    #[tokio::test]
    async fn lease_held_elsewhere_reports_already_running() {
        let store = store().await;
        let diagnostics = Arc::new(MemoryDiagnostics::default());
        store
            .acquire_lease("paging", "someone-else", Duration::from_secs(60))
            .await
            .unwrap();

        let mut runner = Runner::new(PagingJob::new(10, true), store.clone())
            .with_diagnostics(diagnostics.clone());
        assert_eq!(runner.dispatch().await.unwrap(), StepOutcome::AlreadyRunning);
        assert_eq!(runner.progress().await.unwrap(), None);
        assert!(diagnostics
            .messages()
            .iter()
            .any(|m| m == "job already running"));
        assert!(runner.run_to_completion().await.is_err());

        store.release_lease("paging", "someone-else").await.unwrap();
        assert_eq!(runner.run_to_completion().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn failed_step_does_not_advance() {
        let store = store().await;
        let mut job = PagingJob::new(30, true);
        job.fail_at_step = Some(2);
        let diagnostics = Arc::new(MemoryDiagnostics::default());
        let mut runner = Runner::new(job, store.clone())
            .with_per_step(10)
            .with_diagnostics(diagnostics.clone());

        assert_eq!(runner.dispatch().await.unwrap(), StepOutcome::Next(2));
        assert!(runner.dispatch().await.is_err());
        let saved = runner.progress().await.unwrap().unwrap();
        assert_eq!((saved.step, saved.current_count), (2, 10));
        assert!(diagnostics.messages().iter().any(|m| m == "job step failed"));

        // The lease was released, so a retry goes through once the source recovers.
        runner.job.fail_at_step = None;
        assert_eq!(runner.dispatch().await.unwrap(), StepOutcome::Next(3));
    }

    #[tokio::test]
    async fn unknown_total_finishes_on_empty_page() {
        let store = store().await;
        let job = PagingJob::new(20, false);
        let offsets = job.offsets.clone();
        let mut runner = Runner::new(job, store).with_per_step(10);

        assert_eq!(runner.run_to_completion().await.unwrap(), 20);
        assert_eq!(*offsets.lock().unwrap(), vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn empty_total_finishes_without_processing() {
        let store = store().await;
        let job = PagingJob::new(0, true);
        let offsets = job.offsets.clone();
        let finished = job.finished.clone();
        let mut runner = Runner::new(job, store);

        assert_eq!(
            runner.dispatch().await.unwrap(),
            StepOutcome::Done { processed: 0 }
        );
        assert!(offsets.lock().unwrap().is_empty());
        assert_eq!(*finished.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn exhausted_input_before_total_is_logged_and_ends() {
        let store = store().await;
        let mut job = PagingJob::new(15, true);
        let diagnostics = Arc::new(MemoryDiagnostics::default());
        let mut runner = Runner::new(job, store.clone())
            .with_per_step(10)
            .with_diagnostics(diagnostics.clone());
        // Pretend the source promised more than it holds.
        store
            .set(&progress::key("paging", progress::TOTAL_COUNT), "40")
            .await
            .unwrap();
        store
            .set(&progress::key("paging", progress::STEP), "1")
            .await
            .unwrap();
        store
            .set(&progress::key("paging", progress::PER_STEP), "10")
            .await
            .unwrap();

        assert_eq!(runner.run_to_completion().await.unwrap(), 15);
        assert!(diagnostics
            .messages()
            .iter()
            .any(|m| m == "job input exhausted before total_count"));
    }

    #[tokio::test]
    async fn reset_forgets_progress() {
        let store = store().await;
        let mut runner = Runner::new(PagingJob::new(30, true), store).with_per_step(10);
        runner.dispatch().await.unwrap();
        assert!(runner.progress().await.unwrap().is_some());
        runner.reset().await.unwrap();
        assert_eq!(runner.progress().await.unwrap(), None);
        assert_eq!(runner.current_count(), 0);
    }
}
