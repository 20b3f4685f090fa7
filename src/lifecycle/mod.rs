//! Referral lifecycle manager.
//!
//! Every integration funnels its transactions through the operations here:
//!
//! ```text
//! create_draft -> draft --hydrate--> pending --complete--> unpaid --mark_paid--> paid
//!                   |                   \                    /
//!                   +--fail--> failed     +--reject--> rejected
//! ```
//!
//! Each call re-reads the referral before acting because adapters retry the
//! same reference (webhook redelivery). Status writes are compare-and-set on
//! the status that was read. Refusals are returned as `Ok(false)`/`Ok(None)`
//! and recorded in the diagnostic log; only infrastructure failures are `Err`.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::db::{self, Pool};
use crate::diagnostics::{DiagnosticLog, TracingDiagnostics};
use crate::events::{EventKind, EventSink, NoopSink, ReferralEvent};
use crate::model::{Referral, ReferralFields, ReferralStatus};

pub mod guards;
pub mod registry;

pub use guards::{check_business_rules, check_status, Refusal, RefusalKind, ReferralPolicy, RuleInputs};
pub use registry::{Integration, IntegrationRegistry};

/// How a caller names the referral an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferralTarget {
    Id(i64),
    Reference { reference: String, context: String },
}

impl From<i64> for ReferralTarget {
    fn from(id: i64) -> Self {
        ReferralTarget::Id(id)
    }
}

/// A record is resolved by id; its in-memory status is never trusted.
impl From<&Referral> for ReferralTarget {
    fn from(referral: &Referral) -> Self {
        ReferralTarget::Id(referral.id)
    }
}

impl From<(&str, &str)> for ReferralTarget {
    fn from((reference, context): (&str, &str)) -> Self {
        ReferralTarget::Reference {
            reference: reference.to_string(),
            context: context.to_string(),
        }
    }
}

impl ReferralTarget {
    fn describe(&self) -> Value {
        match self {
            ReferralTarget::Id(id) => json!({ "referral_id": id }),
            ReferralTarget::Reference { reference, context } => {
                json!({ "reference": reference, "context": context })
            }
        }
    }
}

pub struct ReferralManager {
    pool: Pool,
    policy: ReferralPolicy,
    integrations: IntegrationRegistry,
    events: Arc<dyn EventSink>,
    diagnostics: Arc<dyn DiagnosticLog>,
}

impl ReferralManager {
    pub fn new(pool: Pool, policy: ReferralPolicy) -> Self {
        Self {
            pool,
            policy,
            integrations: IntegrationRegistry::default(),
            events: Arc::new(NoopSink),
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    pub fn with_integrations(mut self, integrations: IntegrationRegistry) -> Self {
        self.integrations = integrations;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticLog>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn policy(&self) -> &ReferralPolicy {
        &self.policy
    }

    pub fn integrations(&self) -> &IntegrationRegistry {
        &self.integrations
    }

    /// Handle for a registered integration; `None` for unknown contexts.
    pub fn integration<'a>(&'a self, context: &'a str) -> Option<Integration<'a>> {
        self.integrations
            .is_registered(context)
            .then(|| Integration::new(self, context))
    }

    /// Reserve a draft referral before the transaction is fully known.
    ///
    /// Only a missing affiliate id is refused; every other check waits for
    /// [`hydrate`](Self::hydrate) so that failed attempts leave a row behind.
    #[instrument(skip(self, fields))]
    pub async fn create_draft(
        &self,
        affiliate_id: i64,
        reference: &str,
        context: &str,
        fields: ReferralFields,
    ) -> Result<Option<i64>> {
        if affiliate_id <= 0 {
            self.refuse(
                "create_draft",
                json!({ "affiliate_id": affiliate_id, "reference": reference, "context": context }),
                None,
                &Refusal::MissingAffiliate,
            );
            return Ok(None);
        }
        let fields = ReferralFields {
            status: Some(ReferralStatus::Draft),
            ..fields
        };
        let id = db::insert_referral(&self.pool, affiliate_id, reference, context, &fields).await?;
        info!(id, affiliate_id, reference, context, "draft referral created");
        Ok(Some(id))
    }

    /// Fill in a draft and move it to `fields.status` (pending by default).
    ///
    /// A business-rule refusal moves the draft to failed.
    #[instrument(skip(self, fields))]
    pub async fn hydrate(&self, id: i64, fields: ReferralFields) -> Result<bool> {
        let target = ReferralTarget::Id(id);
        let Some(current) = db::get_referral(&self.pool, id).await? else {
            return Ok(self.refuse("hydrate", target.describe(), None, &Refusal::NotFound));
        };
        if let Err(refusal) = check_status("hydrate", current.status, &[ReferralStatus::Draft]) {
            return Ok(self.refuse("hydrate", target.describe(), Some(&current), &refusal));
        }

        let to = fields.status.unwrap_or(ReferralStatus::Pending);
        if to == ReferralStatus::Draft {
            let refusal = Refusal::InvalidFields("hydrate cannot target the draft status");
            return Ok(self.refuse("hydrate", target.describe(), Some(&current), &refusal));
        }

        let mut next = current.clone();
        fields.apply_to(&mut next);
        next.status = to;
        if next.currency.trim().is_empty() {
            next.currency = self.policy.default_currency.clone();
        }

        if to.is_live() {
            if let Err(refusal) = self.evaluate_rules(&next).await? {
                self.refuse("hydrate", target.describe(), Some(&current), &refusal);
                if refusal.is_business_rule() {
                    self.fail_after_refusal(&current).await?;
                }
                return Ok(false);
            }
        }

        if !db::update_referral(&self.pool, &next, ReferralStatus::Draft).await? {
            return self.refuse_raced("hydrate", &target).await;
        }
        if let (true, Some(visit_id)) = (to.is_live(), next.visit_id) {
            db::attach_visit(&self.pool, visit_id, id).await?;
        }

        info!(id, status = %to, amount = next.amount, "referral hydrated");
        if let Some(kind) = event_for(to) {
            self.events.notify(ReferralEvent::new(kind, &next));
        }
        Ok(true)
    }

    /// Draft -> failed, by id.
    pub async fn mark_failed(&self, id: i64) -> Result<bool> {
        self.transition(
            "mark_failed",
            ReferralTarget::Id(id),
            &[ReferralStatus::Draft],
            ReferralStatus::Failed,
        )
        .await
    }

    /// Pending -> unpaid.
    pub async fn complete(&self, target: impl Into<ReferralTarget>) -> Result<bool> {
        self.transition(
            "complete",
            target.into(),
            &[ReferralStatus::Pending],
            ReferralStatus::Unpaid,
        )
        .await
    }

    /// Unpaid (or pending, when allowed) -> rejected. Paid referrals are immutable.
    pub async fn reject(&self, target: impl Into<ReferralTarget>, allow_pending: bool) -> Result<bool> {
        let allowed: &[ReferralStatus] = if allow_pending {
            &[ReferralStatus::Pending, ReferralStatus::Unpaid]
        } else {
            &[ReferralStatus::Unpaid]
        };
        self.transition("reject", target.into(), allowed, ReferralStatus::Rejected)
            .await
    }

    /// Draft -> failed.
    pub async fn fail(&self, target: impl Into<ReferralTarget>) -> Result<bool> {
        self.transition(
            "fail",
            target.into(),
            &[ReferralStatus::Draft],
            ReferralStatus::Failed,
        )
        .await
    }

    /// Unpaid -> paid, stamping the payout batch the referral settled in.
    #[instrument(skip(self))]
    pub async fn mark_paid(&self, id: i64, batch_key: &str) -> Result<bool> {
        let target = ReferralTarget::Id(id);
        let Some(current) = db::get_referral(&self.pool, id).await? else {
            return Ok(self.refuse("mark_paid", target.describe(), None, &Refusal::NotFound));
        };
        if let Err(refusal) = check_status("mark_paid", current.status, &[ReferralStatus::Unpaid]) {
            return Ok(self.refuse("mark_paid", target.describe(), Some(&current), &refusal));
        }
        if !db::mark_referral_paid(&self.pool, id, batch_key).await? {
            return self.refuse_raced("mark_paid", &target).await;
        }
        let mut paid = current;
        paid.status = ReferralStatus::Paid;
        paid.payout_batch = Some(batch_key.to_string());
        debug!(id, batch_key, "referral paid");
        self.events.notify(ReferralEvent::new(EventKind::Paid, &paid));
        Ok(true)
    }

    /// The caller-side duplicate check: a sibling that is neither draft nor failed.
    pub async fn find_live_duplicate(
        &self,
        reference: &str,
        context: &str,
        exclude_id: i64,
    ) -> Result<Option<Referral>> {
        db::find_live_sibling(&self.pool, reference, context, exclude_id).await
    }

    pub async fn get(&self, target: impl Into<ReferralTarget>) -> Result<Option<Referral>> {
        self.resolve(&target.into()).await
    }

    async fn resolve(&self, target: &ReferralTarget) -> Result<Option<Referral>> {
        match target {
            ReferralTarget::Id(id) => db::get_referral(&self.pool, *id).await,
            ReferralTarget::Reference { reference, context } => {
                db::find_referral(&self.pool, reference, context).await
            }
        }
    }

    #[instrument(skip(self, target, allowed))]
    async fn transition(
        &self,
        operation: &'static str,
        target: ReferralTarget,
        allowed: &[ReferralStatus],
        to: ReferralStatus,
    ) -> Result<bool> {
        let Some(current) = self.resolve(&target).await? else {
            return Ok(self.refuse(operation, target.describe(), None, &Refusal::NotFound));
        };
        if let Err(refusal) = check_status(operation, current.status, allowed) {
            return Ok(self.refuse(operation, target.describe(), Some(&current), &refusal));
        }
        if !db::set_referral_status(&self.pool, current.id, current.status, to).await? {
            return self.refuse_raced(operation, &ReferralTarget::Id(current.id)).await;
        }

        info!(id = current.id, from = %current.status, to = %to, operation, "referral transitioned");
        let mut moved = current;
        moved.status = to;
        if let Some(kind) = event_for(to) {
            self.events.notify(ReferralEvent::new(kind, &moved));
        }
        Ok(true)
    }

    /// Gather rule inputs for the would-be stored referral and evaluate them.
    async fn evaluate_rules(&self, next: &Referral) -> Result<Result<(), Refusal>> {
        let affiliate = db::get_affiliate(&self.pool, next.affiliate_id).await?;
        let live_sibling = if next.reference.is_empty() {
            None
        } else {
            db::find_live_sibling(&self.pool, &next.reference, &next.context, next.id)
                .await?
                .map(|r| r.id)
        };
        let visit = match next.visit_id {
            Some(visit_id) => db::get_visit(&self.pool, visit_id).await?,
            None => None,
        };
        let inputs = RuleInputs {
            referral: next,
            integration_enabled: self.integrations.is_enabled(&next.context),
            affiliate: affiliate.as_ref(),
            live_sibling,
            visit: visit.as_ref(),
        };
        Ok(check_business_rules(&self.policy, &inputs))
    }

    async fn fail_after_refusal(&self, draft: &Referral) -> Result<()> {
        if db::set_referral_status(&self.pool, draft.id, ReferralStatus::Draft, ReferralStatus::Failed)
            .await?
        {
            let mut failed = draft.clone();
            failed.status = ReferralStatus::Failed;
            self.events.notify(ReferralEvent::new(EventKind::Failed, &failed));
        }
        Ok(())
    }

    /// Another writer changed the status between our read and write.
    async fn refuse_raced(&self, operation: &'static str, target: &ReferralTarget) -> Result<bool> {
        let current = self.resolve(target).await?;
        let refusal = match &current {
            Some(r) => Refusal::StatusConflict {
                operation,
                actual: r.status,
            },
            None => Refusal::NotFound,
        };
        Ok(self.refuse(operation, target.describe(), current.as_ref(), &refusal))
    }

    fn refuse(
        &self,
        operation: &'static str,
        mut context: Value,
        current: Option<&Referral>,
        refusal: &Refusal,
    ) -> bool {
        if let Some(map) = context.as_object_mut() {
            map.insert("operation".into(), json!(operation));
            map.insert("kind".into(), json!(refusal.kind()));
            map.insert("reason".into(), json!(refusal.to_string()));
            if let Some(r) = current {
                map.insert("referral_id".into(), json!(r.id));
                map.insert("actual_status".into(), json!(r.status));
            }
        }
        debug!(operation, %refusal, "referral operation refused");
        self.diagnostics.log("referral operation refused", context);
        false
    }
}

fn event_for(status: ReferralStatus) -> Option<EventKind> {
    match status {
        ReferralStatus::Unpaid => Some(EventKind::Completed),
        ReferralStatus::Rejected => Some(EventKind::Rejected),
        ReferralStatus::Failed => Some(EventKind::Failed),
        ReferralStatus::Paid => Some(EventKind::Paid),
        ReferralStatus::Draft | ReferralStatus::Pending => None,
    }
}
