//! Guard evaluation for referral transitions.
//!
//! Guards run in a fixed order: existence, then status compatibility, then
//! business rules. Each refusal is a value, never an error.

use serde::Serialize;
use thiserror::Error;

use crate::model::{Affiliate, AffiliateStatus, Referral, ReferralStatus, Visit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalKind {
    Validation,
    StateConflict,
    BusinessRule,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Refusal {
    #[error("an affiliate id is required")]
    MissingAffiliate,
    #[error("invalid fields: {0}")]
    InvalidFields(&'static str),
    #[error("referral not found")]
    NotFound,
    #[error("cannot {operation} a referral in status {actual}")]
    StatusConflict {
        operation: &'static str,
        actual: ReferralStatus,
    },
    #[error("integration {0} is not enabled")]
    IntegrationDisabled(String),
    #[error("affiliate {0} is missing or not active")]
    AffiliateNotActive(i64),
    #[error("customer email matches the affiliate's own email")]
    SelfReferral,
    #[error("reference already tracked by referral {existing}")]
    DuplicateReference { existing: i64 },
    #[error("visit {0} is not valid for this referral")]
    InvalidVisit(i64),
    #[error("zero-amount referrals are not allowed")]
    ZeroAmount,
    #[error("amount {amount} is below the minimum {minimum}")]
    BelowMinimum { amount: f64, minimum: f64 },
}

impl Refusal {
    pub fn kind(&self) -> RefusalKind {
        match self {
            Refusal::MissingAffiliate | Refusal::InvalidFields(_) => RefusalKind::Validation,
            Refusal::NotFound | Refusal::StatusConflict { .. } => RefusalKind::StateConflict,
            _ => RefusalKind::BusinessRule,
        }
    }

    /// Business-rule refusals fail the draft rather than leaving it dangling.
    pub fn is_business_rule(&self) -> bool {
        self.kind() == RefusalKind::BusinessRule
    }
}

/// Tunable parts of the business rules.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferralPolicy {
    pub default_currency: String,
    pub allow_self_referral: bool,
    pub allow_zero_amount: bool,
    pub min_amount: f64,
}

impl Default for ReferralPolicy {
    fn default() -> Self {
        Self {
            default_currency: "usd".to_string(),
            allow_self_referral: false,
            allow_zero_amount: false,
            min_amount: 0.0,
        }
    }
}

/// Require `actual` to be one of `allowed`.
pub fn check_status(
    operation: &'static str,
    actual: ReferralStatus,
    allowed: &[ReferralStatus],
) -> Result<(), Refusal> {
    if allowed.contains(&actual) {
        Ok(())
    } else {
        Err(Refusal::StatusConflict { operation, actual })
    }
}

/// Everything the business rules look at, gathered by the caller.
#[derive(Debug, Clone, Copy)]
pub struct RuleInputs<'a> {
    /// The referral as it would be stored after the transition.
    pub referral: &'a Referral,
    pub integration_enabled: bool,
    pub affiliate: Option<&'a Affiliate>,
    pub live_sibling: Option<i64>,
    pub visit: Option<&'a Visit>,
}

pub fn check_business_rules(policy: &ReferralPolicy, inputs: &RuleInputs<'_>) -> Result<(), Refusal> {
    let referral = inputs.referral;

    if !inputs.integration_enabled {
        return Err(Refusal::IntegrationDisabled(referral.context.clone()));
    }

    let affiliate = match inputs.affiliate {
        Some(a) if a.status == AffiliateStatus::Active => a,
        _ => return Err(Refusal::AffiliateNotActive(referral.affiliate_id)),
    };

    if !policy.allow_self_referral && is_self_referral(affiliate, referral) {
        return Err(Refusal::SelfReferral);
    }

    if let Some(existing) = inputs.live_sibling {
        return Err(Refusal::DuplicateReference { existing });
    }

    if let Some(visit_id) = referral.visit_id {
        let valid = inputs.visit.is_some_and(|v| {
            v.affiliate_id == referral.affiliate_id
                && v.referral_id.map_or(true, |owner| owner == referral.id)
        });
        if !valid {
            return Err(Refusal::InvalidVisit(visit_id));
        }
    }

    if referral.amount == 0.0 {
        if !policy.allow_zero_amount {
            return Err(Refusal::ZeroAmount);
        }
    } else if referral.amount < policy.min_amount {
        return Err(Refusal::BelowMinimum {
            amount: referral.amount,
            minimum: policy.min_amount,
        });
    }

    Ok(())
}

fn is_self_referral(affiliate: &Affiliate, referral: &Referral) -> bool {
    let customer = referral.customer.email.trim();
    let own = affiliate.email.trim();
    !customer.is_empty() && !own.is_empty() && customer.eq_ignore_ascii_case(own)
}
