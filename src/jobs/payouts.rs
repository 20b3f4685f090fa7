use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::{parse_params, BatchJob, JobContext, MessageCode, StepReport};
use crate::db::{self, PayoutScope};
use crate::lifecycle::ReferralManager;
use crate::model::ReferralStatus;

const MAX_REFERRAL_ID: &str = "max_referral_id";

#[derive(Debug, Default, Deserialize)]
struct PayoutParams {
    #[serde(default)]
    batch: String,
    #[serde(default)]
    affiliate_ids: Vec<i64>,
}

/// Settles unpaid referrals into a named payout batch and keeps one payout
/// row per affiliate summing what that batch paid them.
///
/// The scope is frozen at init by recording the highest referral id, so
/// referrals completed while the batch runs wait for the next one.
pub struct GeneratePayouts {
    manager: Arc<ReferralManager>,
    scope: Option<PayoutScope>,
}

impl GeneratePayouts {
    pub const ID: &'static str = "generate-payouts";

    pub fn new(manager: Arc<ReferralManager>) -> Self {
        Self {
            manager,
            scope: None,
        }
    }

    fn params(ctx: &JobContext<'_>) -> Result<PayoutParams> {
        let params: PayoutParams = parse_params(ctx.params)?;
        if params.batch.trim().is_empty() {
            return Err(anyhow!("generate-payouts needs a non-empty \"batch\" parameter"));
        }
        Ok(params)
    }

    async fn load_scope(ctx: &JobContext<'_>) -> Result<PayoutScope> {
        let params = Self::params(ctx)?;
        let max_referral_id = ctx
            .load(MAX_REFERRAL_ID)
            .await?
            .ok_or_else(|| anyhow!("payout batch {} has no recorded scope", params.batch))?
            .parse::<i64>()
            .context("recorded payout scope is not a referral id")?;
        Ok(PayoutScope {
            batch_key: params.batch,
            max_referral_id,
            affiliate_ids: params.affiliate_ids,
        })
    }

    fn scope(&self) -> Result<&PayoutScope> {
        self.scope
            .as_ref()
            .ok_or_else(|| anyhow!("payout scope was not loaded"))
    }
}

#[async_trait]
impl BatchJob for GeneratePayouts {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn init(&mut self, ctx: &JobContext<'_>) -> Result<()> {
        let params = Self::params(ctx)?;
        let max_id = db::max_referral_id(self.manager.pool()).await?;
        ctx.save(MAX_REFERRAL_ID, &max_id.to_string()).await?;
        info!(batch = %params.batch, max_referral_id = max_id, "payout batch scoped");
        Ok(())
    }

    async fn pre_fetch(&mut self, ctx: &JobContext<'_>) -> Result<Option<u64>> {
        let scope = Self::load_scope(ctx).await?;
        let count = db::count_payout_candidates(self.manager.pool(), &scope).await?;
        self.scope = Some(scope);
        Ok(Some(u64::try_from(count).unwrap_or(0)))
    }

    async fn process_step(&mut self, ctx: &JobContext<'_>) -> Result<StepReport> {
        let pool = self.manager.pool();
        let scope = self.scope()?;
        let page = db::payout_candidates(pool, scope, ctx.per_step, ctx.offset()).await?;

        let mut touched = BTreeSet::new();
        for referral in &page {
            // Rows already settled by an earlier attempt at this step only
            // need their payout row refreshed.
            if referral.status == ReferralStatus::Unpaid {
                self.manager.mark_paid(referral.id, &scope.batch_key).await?;
            }
            touched.insert(referral.affiliate_id);
        }
        for affiliate_id in &touched {
            db::refresh_payout(pool, &scope.batch_key, *affiliate_id).await?;
        }
        debug!(
            batch = %scope.batch_key,
            referrals = page.len(),
            affiliates = touched.len(),
            "payout step settled"
        );

        Ok(StepReport {
            fetched: page.len(),
            processed: page.len() as u64,
        })
    }

    async fn finish(&mut self, ctx: &JobContext<'_>) -> Result<()> {
        ctx.forget(MAX_REFERRAL_ID).await?;
        if let Some(scope) = self.scope.take() {
            info!(batch = %scope.batch_key, referrals = ctx.current_count, "payout batch complete");
        }
        Ok(())
    }

    fn message(&self, code: MessageCode, count: u64) -> String {
        match code {
            MessageCode::Done => format!("{} referrals paid out.", count),
            MessageCode::NothingToDo => "No unpaid referrals to pay out.".to_string(),
            MessageCode::AlreadyRunning => "A payout batch is already being generated.".to_string(),
            MessageCode::Failed => format!(
                "Payout generation stopped after {} referrals; run it again to resume.",
                count
            ),
        }
    }
}
