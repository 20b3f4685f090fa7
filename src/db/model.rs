//! Filters and view models used by repositories.
//!
//! Keep these structs focused on what queries need. Lifecycle rules live in
//! `crate::lifecycle`.

use crate::model::{AffiliateStatus, RateType};

/// Fields required to register an affiliate row.
#[derive(Debug, Clone)]
pub struct NewAffiliate {
    pub user_id: i64,
    pub email: String,
    pub status: AffiliateStatus,
    pub rate: Option<f64>,
    pub rate_type: Option<RateType>,
}

impl NewAffiliate {
    pub fn active(user_id: i64, email: &str) -> Self {
        Self {
            user_id,
            email: email.to_string(),
            status: AffiliateStatus::Active,
            rate: None,
            rate_type: None,
        }
    }
}

/// Filter for affiliate queries. Empty `ids` means no id restriction.
#[derive(Debug, Clone, Default)]
pub struct AffiliateFilter {
    pub ids: Vec<i64>,
    pub status: Option<AffiliateStatus>,
    pub limit: Option<u32>,
    pub offset: u64,
}

/// Recomputed per-affiliate totals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AffiliateStats {
    pub referral_count: i64,
    pub unpaid_earnings: f64,
    pub paid_earnings: f64,
}

/// The fixed set of referrals a payout batch works through.
///
/// Referrals already stamped with `batch_key` stay in scope so that page
/// offsets remain stable while rows move from unpaid to paid.
#[derive(Debug, Clone)]
pub struct PayoutScope {
    pub batch_key: String,
    pub max_referral_id: i64,
    pub affiliate_ids: Vec<i64>,
}
