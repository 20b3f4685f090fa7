use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{parse_params, BatchJob, JobContext, MessageCode, StepReport};
use crate::db::{self, AffiliateFilter, Pool};
use crate::model::AffiliateStatus;

#[derive(Debug, Default, Deserialize)]
struct RecountParams {
    #[serde(default)]
    affiliate_ids: Vec<i64>,
    #[serde(default)]
    status: Option<AffiliateStatus>,
}

/// Recomputes each affiliate's paid referral count and unpaid/paid earnings
/// from the referral table.
pub struct RecountAffiliateStats {
    pool: Pool,
}

impl RecountAffiliateStats {
    pub const ID: &'static str = "recount-affiliate-stats";

    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn filter(ctx: &JobContext<'_>) -> Result<AffiliateFilter> {
        let params: RecountParams = parse_params(ctx.params)?;
        Ok(AffiliateFilter {
            ids: params.affiliate_ids,
            status: params.status,
            ..Default::default()
        })
    }
}

#[async_trait]
impl BatchJob for RecountAffiliateStats {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn init(&mut self, ctx: &JobContext<'_>) -> Result<()> {
        // Fail fast on bad params, before anything is persisted.
        Self::filter(ctx).map(|_| ())
    }

    async fn pre_fetch(&mut self, ctx: &JobContext<'_>) -> Result<Option<u64>> {
        let count = db::count_affiliates(&self.pool, &Self::filter(ctx)?).await?;
        Ok(Some(u64::try_from(count).unwrap_or(0)))
    }

    async fn process_step(&mut self, ctx: &JobContext<'_>) -> Result<StepReport> {
        let filter = AffiliateFilter {
            limit: Some(ctx.per_step),
            offset: ctx.offset(),
            ..Self::filter(ctx)?
        };
        let affiliates = db::query_affiliates(&self.pool, &filter).await?;
        for affiliate in &affiliates {
            let stats = db::referral_stats(&self.pool, affiliate.id).await?;
            db::update_affiliate_stats(&self.pool, affiliate.id, &stats).await?;
            debug!(affiliate_id = affiliate.id, ?stats, "affiliate stats recounted");
        }
        Ok(StepReport {
            fetched: affiliates.len(),
            processed: affiliates.len() as u64,
        })
    }

    fn message(&self, code: MessageCode, count: u64) -> String {
        match code {
            MessageCode::Done => format!("Stats recounted for {} affiliates.", count),
            MessageCode::NothingToDo => "No affiliates matched; nothing to recount.".to_string(),
            MessageCode::AlreadyRunning => {
                "Affiliate stats are already being recounted.".to_string()
            }
            MessageCode::Failed => format!(
                "Recount stopped after {} affiliates; run it again to resume.",
                count
            ),
        }
    }
}
