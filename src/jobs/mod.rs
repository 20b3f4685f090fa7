//! Resumable batch jobs.
//!
//! A job advances one bounded step per dispatch. Everything needed to resume
//! lives in the [`ProgressStore`]; the [`Runner`] re-derives the page offset
//! from the persisted step on every dispatch.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub mod migrate;
pub mod payouts;
pub mod progress;
pub mod recount;
pub mod runner;
pub mod sync_sales;

pub use migrate::MigrateReferralFields;
pub use payouts::GeneratePayouts;
pub use progress::{ProgressStore, SqliteProgressStore};
pub use recount::RecountAffiliateStats;
pub use runner::{JobProgress, Runner};
pub use sync_sales::{ExternalSale, SalesSource, SyncIntegrationSales};

pub const DEFAULT_PER_STEP: u32 = 100;

/// `(step - 1) * per_step`; steps are 1-based.
pub fn step_offset(step: u32, per_step: u32) -> u64 {
    u64::from(step.saturating_sub(1)) * u64::from(per_step)
}

/// Deserialize job parameters, treating `null` as "all defaults".
pub fn parse_params<T: DeserializeOwned + Default>(params: &Value) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone()).context("invalid job parameters")
}

/// What a job sees on each hook call.
#[derive(Clone, Copy)]
pub struct JobContext<'a> {
    pub job_id: &'a str,
    pub params: &'a Value,
    pub store: &'a dyn ProgressStore,
    pub step: u32,
    pub per_step: u32,
    pub current_count: u64,
    pub total_count: Option<u64>,
}

impl JobContext<'_> {
    pub fn offset(&self) -> u64 {
        step_offset(self.step, self.per_step)
    }

    pub fn key(&self, field: &str) -> String {
        progress::key(self.job_id, field)
    }

    /// Read a job-scoped value persisted by an earlier hook.
    pub async fn load(&self, field: &str) -> Result<Option<String>> {
        self.store.get(&self.key(field)).await
    }

    pub async fn save(&self, field: &str, value: &str) -> Result<()> {
        self.store.set(&self.key(field), value).await
    }

    pub async fn forget(&self, field: &str) -> Result<()> {
        self.store.delete(&self.key(field)).await
    }
}

/// Result of one `process_step` call.
///
/// `fetched` counts input items read from the page; `processed` counts output
/// units added to `current_count`. The two differ whenever items are skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub fetched: usize,
    pub processed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Next(u32),
    Done { processed: u64 },
    /// Another dispatch holds the lease for this job id.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCode {
    Done,
    NothingToDo,
    AlreadyRunning,
    Failed,
}

#[async_trait]
pub trait BatchJob: Send + Sync {
    /// Slug the job's progress is keyed by.
    fn id(&self) -> &str;

    fn per_step(&self) -> u32 {
        DEFAULT_PER_STEP
    }

    /// One-time setup before the first step.
    async fn init(&mut self, _ctx: &JobContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called once per runner instance, before its first step. Returns the
    /// total item count when the job can know it up front.
    async fn pre_fetch(&mut self, _ctx: &JobContext<'_>) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Process at most `ctx.per_step` items starting at `ctx.offset()`.
    async fn process_step(&mut self, ctx: &JobContext<'_>) -> Result<StepReport>;

    /// Completion logic, run exactly once when the job is done.
    async fn finish(&mut self, _ctx: &JobContext<'_>) -> Result<()> {
        Ok(())
    }

    fn message(&self, code: MessageCode, count: u64) -> String {
        match code {
            MessageCode::Done => format!("{} items processed.", count),
            MessageCode::NothingToDo => "There was nothing to process.".to_string(),
            MessageCode::AlreadyRunning => {
                "This job is already running; try again shortly.".to_string()
            }
            MessageCode::Failed => format!(
                "The job stopped after {} items; dispatch it again to resume.",
                count
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn offsets_follow_steps() {
        assert_eq!(step_offset(1, 50), 0);
        assert_eq!(step_offset(3, 50), 100);
        assert_eq!(step_offset(0, 50), 0);
    }

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Params {
        #[serde(default)]
        ids: Vec<i64>,
    }

    #[test]
    fn null_params_mean_defaults() {
        assert_eq!(parse_params::<Params>(&Value::Null).unwrap(), Params::default());
        assert_eq!(
            parse_params::<Params>(&json!({"ids": [1, 2]})).unwrap().ids,
            vec![1, 2]
        );
        assert!(parse_params::<Params>(&json!({"ids": "x"})).is_err());
    }
}
