use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{progress, BatchJob, JobContext, MessageCode, ProgressStore, StepReport};
use crate::db::{self, Pool};
use crate::diagnostics::{DiagnosticLog, TracingDiagnostics};
use crate::model::{Referral, ReferralStatus};

const COMPLETED_AT: &str = "completed_at";

/// One-off cleanup of referral rows written by older integrations:
/// context tags are trimmed and lowercased, empty currencies take the
/// configured default and customer emails are lowercased.
///
/// Normalizing a context can land a row on a (reference, context) pair that
/// already has a tracked referral. Such a row keeps its legacy context, or is
/// failed when it is only a draft.
pub struct MigrateReferralFields {
    pool: Pool,
    default_currency: String,
    diagnostics: Arc<dyn DiagnosticLog>,
}

impl MigrateReferralFields {
    pub const ID: &'static str = "migrate-referral-fields";

    pub fn new(pool: Pool, default_currency: &str) -> Self {
        Self {
            pool,
            default_currency: default_currency.to_string(),
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticLog>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// When the migration last ran to completion, if ever.
    pub async fn completed_at(store: &dyn ProgressStore) -> Result<Option<String>> {
        store.get(&progress::key(Self::ID, COMPLETED_AT)).await
    }

    fn normalize(&self, referral: &mut Referral) -> bool {
        let mut changed = false;

        let context = referral.context.trim().to_lowercase();
        if context != referral.context {
            referral.context = context;
            changed = true;
        }

        if referral.currency.trim().is_empty() {
            referral.currency = self.default_currency.clone();
            changed = true;
        }

        let email = referral.customer.email.trim().to_lowercase();
        if email != referral.customer.email {
            referral.customer.email = email;
            changed = true;
        }

        changed
    }

    /// Writes the normalized row unless that would give its pair a second
    /// tracked referral. Returns whether a row was written.
    async fn migrate_one(&self, mut referral: Referral, legacy_context: &str) -> Result<bool> {
        let expected = referral.status;
        let moved_pair = referral.context != legacy_context;
        let collision = if moved_pair && expected != ReferralStatus::Failed {
            db::find_live_sibling(&self.pool, &referral.reference, &referral.context, referral.id)
                .await?
        } else {
            None
        };

        if let Some(sibling) = collision {
            let failing = expected == ReferralStatus::Draft;
            let action = if failing { "failed" } else { "left unnormalized" };
            self.diagnostics.log(
                "referral context collides with a tracked referral",
                json!({
                    "job_id": Self::ID,
                    "referral_id": referral.id,
                    "reference": referral.reference,
                    "legacy_context": legacy_context,
                    "context": referral.context,
                    "existing": sibling.id,
                    "status": expected.as_str(),
                    "action": action,
                }),
            );
            if !failing {
                return Ok(false);
            }
            referral.status = ReferralStatus::Failed;
        }

        let written = db::update_referral(&self.pool, &referral, expected).await?;
        if written {
            debug!(referral_id = referral.id, status = %referral.status, "referral fields migrated");
        } else {
            // Moved by a live transition mid-page; the next run picks it up.
            warn!(referral_id = referral.id, "referral changed during migration; skipped");
        }
        Ok(written)
    }
}

#[async_trait]
impl BatchJob for MigrateReferralFields {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn process_step(&mut self, ctx: &JobContext<'_>) -> Result<StepReport> {
        let page = db::list_referrals(&self.pool, ctx.per_step, ctx.offset()).await?;
        let mut changed = 0u64;
        for original in &page {
            let mut referral = original.clone();
            if !self.normalize(&mut referral) {
                continue;
            }
            if self.migrate_one(referral, &original.context).await? {
                changed += 1;
            }
        }
        Ok(StepReport {
            fetched: page.len(),
            processed: changed,
        })
    }

    async fn finish(&mut self, ctx: &JobContext<'_>) -> Result<()> {
        ctx.save(COMPLETED_AT, &Utc::now().to_rfc3339()).await?;
        info!(changed = ctx.current_count, "referral field migration complete");
        Ok(())
    }

    fn message(&self, code: MessageCode, count: u64) -> String {
        match code {
            MessageCode::Done if count == 0 => "All referrals were already up to date.".to_string(),
            MessageCode::Done => format!("{} referrals migrated.", count),
            MessageCode::NothingToDo => "All referrals were already up to date.".to_string(),
            MessageCode::AlreadyRunning => "The referral migration is already running.".to_string(),
            MessageCode::Failed => format!(
                "The migration stopped after updating {} referrals; run it again to resume.",
                count
            ),
        }
    }
}
