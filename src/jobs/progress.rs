//! Durable job progress, keyed `"{job_id}:{field}"`, plus the short dispatch
//! lease that keeps two dispatches of one job from overlapping.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::instrument;

use crate::db::Pool;

pub const STEP: &str = "step";
pub const PER_STEP: &str = "per_step";
pub const CURRENT_COUNT: &str = "current_count";
pub const TOTAL_COUNT: &str = "total_count";
pub const PARAMS: &str = "params";

/// Fields owned by the runner and cleared when a job finishes or is reset.
pub const RUNNER_FIELDS: [&str; 5] = [STEP, PER_STEP, CURRENT_COUNT, TOTAL_COUNT, PARAMS];

pub fn key(job_id: &str, field: &str) -> String {
    format!("{}:{}", job_id, field)
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Take the lease for `job_id` unless another holder has an unexpired one.
    /// Re-acquiring one's own lease extends it.
    async fn acquire_lease(&self, job_id: &str, holder: &str, ttl: Duration) -> Result<bool>;

    async fn release_lease(&self, job_id: &str, holder: &str) -> Result<()>;
}

/// Parse a numeric progress value.
pub async fn get_u64(store: &dyn ProgressStore, key: &str) -> Result<Option<u64>> {
    match store.get(key).await? {
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("progress value {} is not a number: {:?}", key, raw))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct SqliteProgressStore {
    pool: Pool,
}

impl SqliteProgressStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM job_progress WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_progress (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to persist job progress")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM job_progress WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn acquire_lease(&self, job_id: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let acquired = sqlx::query_scalar::<_, String>(
            "INSERT INTO job_leases (job_id, holder, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT (job_id) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at \
             WHERE job_leases.expires_at <= ? OR job_leases.holder = excluded.holder \
             RETURNING holder",
        )
        .bind(job_id)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to acquire job lease")?;
        Ok(acquired.is_some())
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, job_id: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM job_leases WHERE job_id = ? AND holder = ?")
            .bind(job_id)
            .bind(holder)
            .execute(&self.pool)
            .await
            .context("failed to release job lease")?;
        Ok(())
    }
}
