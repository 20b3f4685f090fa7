//! Backfill referrals from an integration's historical sales.
//!
//! The store behind an integration is reached through [`SalesSource`]; every
//! sale is pushed through the same lifecycle operations a live order would
//! take, so the business rules apply exactly once per reference.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::{BatchJob, JobContext, MessageCode, StepReport};
use crate::lifecycle::{Integration, ReferralManager};
use crate::model::{Customer, Product, ReferralFields, ReferralStatus};

/// One historical sale as the integration reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExternalSale {
    pub reference: String,
    /// `None` when the sale was not attributed to any affiliate.
    pub affiliate_id: Option<i64>,
    pub amount: f64,
    pub order_total: f64,
    pub currency: Option<String>,
    pub description: String,
    pub customer: Customer,
    pub products: Vec<Product>,
    pub visit_id: Option<i64>,
    pub campaign: String,
    /// Whether the order reached its paid/completed state in the store.
    pub completed: bool,
}

impl ExternalSale {
    fn fields(&self) -> ReferralFields {
        ReferralFields {
            status: Some(ReferralStatus::Pending),
            amount: Some(self.amount),
            order_total: Some(self.order_total),
            currency: self.currency.clone(),
            description: Some(self.description.clone()),
            visit_id: self.visit_id,
            campaign: Some(self.campaign.clone()),
            products: Some(self.products.clone()),
            custom: None,
            customer: Some(self.customer.clone()),
        }
    }
}

#[async_trait]
pub trait SalesSource: Send + Sync {
    /// Sales in a stable order, `limit` at a time from `offset`. Skipped
    /// sales make the referral count diverge from the sale count, so the sync
    /// runs until this returns an empty page.
    async fn fetch_sales(&self, offset: u64, limit: u32) -> Result<Vec<ExternalSale>>;
}

enum SaleOutcome {
    Recorded,
    Skipped(&'static str),
    Refused,
}

pub struct SyncIntegrationSales {
    manager: Arc<ReferralManager>,
    source: Arc<dyn SalesSource>,
    context: String,
    id: String,
}

impl SyncIntegrationSales {
    pub fn new(manager: Arc<ReferralManager>, source: Arc<dyn SalesSource>, context: &str) -> Self {
        Self {
            manager,
            source,
            context: context.to_string(),
            id: format!("sync-{}-sales", context),
        }
    }

    async fn sync_one(integration: Integration<'_>, sale: &ExternalSale) -> Result<SaleOutcome> {
        let Some(affiliate_id) = sale.affiliate_id else {
            return Ok(SaleOutcome::Skipped("unattributed"));
        };
        if sale.reference.trim().is_empty() {
            return Ok(SaleOutcome::Skipped("no reference"));
        }

        // Failed rows rank last, so a failed match means nothing else exists.
        let draft_id = match integration.find_referral(&sale.reference).await? {
            Some(existing) if existing.status == ReferralStatus::Draft => existing.id,
            Some(existing) if existing.status == ReferralStatus::Failed => {
                return Ok(SaleOutcome::Skipped("previously refused"));
            }
            Some(existing) if existing.status == ReferralStatus::Pending && sale.completed => {
                return Ok(if integration.complete(&sale.reference).await? {
                    SaleOutcome::Recorded
                } else {
                    SaleOutcome::Refused
                });
            }
            Some(_) => return Ok(SaleOutcome::Skipped("already tracked")),
            None => {
                match integration
                    .create_draft(affiliate_id, &sale.reference, ReferralFields::default())
                    .await?
                {
                    Some(id) => id,
                    None => return Ok(SaleOutcome::Refused),
                }
            }
        };

        if !integration.hydrate(draft_id, sale.fields()).await? {
            return Ok(SaleOutcome::Refused);
        }
        if sale.completed && !integration.complete(&sale.reference).await? {
            return Ok(SaleOutcome::Refused);
        }
        Ok(SaleOutcome::Recorded)
    }
}

#[async_trait]
impl BatchJob for SyncIntegrationSales {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process_step(&mut self, ctx: &JobContext<'_>) -> Result<StepReport> {
        let integration = self
            .manager
            .integration(&self.context)
            .ok_or_else(|| anyhow::anyhow!("integration {} is not registered", self.context))?;

        let sales = self.source.fetch_sales(ctx.offset(), ctx.per_step).await?;
        let mut report = StepReport {
            fetched: sales.len(),
            processed: 0,
        };
        let (mut skipped, mut refused) = (0u32, 0u32);
        for sale in &sales {
            match Self::sync_one(integration, sale).await? {
                SaleOutcome::Recorded => report.processed += 1,
                SaleOutcome::Skipped(reason) => {
                    debug!(reference = %sale.reference, reason, "sale skipped");
                    skipped += 1;
                }
                SaleOutcome::Refused => refused += 1,
            }
        }
        info!(
            context = %self.context,
            step = ctx.step,
            recorded = report.processed,
            skipped,
            refused,
            "sales page synced"
        );
        Ok(report)
    }

    fn message(&self, code: MessageCode, count: u64) -> String {
        match code {
            MessageCode::Done => format!("{} referrals created from {} sales.", count, self.context),
            MessageCode::NothingToDo => format!("No {} sales needed a referral.", self.context),
            MessageCode::AlreadyRunning => {
                format!("The {} sales sync is already running.", self.context)
            }
            MessageCode::Failed => format!(
                "The {} sales sync stopped after {} referrals; run it again to resume.",
                self.context, count
            ),
        }
    }
}
