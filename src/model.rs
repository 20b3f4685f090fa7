use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReferralStatus {
    Draft,
    Pending,
    Unpaid,
    Paid,
    Rejected,
    Failed,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Draft => "draft",
            ReferralStatus::Pending => "pending",
            ReferralStatus::Unpaid => "unpaid",
            ReferralStatus::Paid => "paid",
            ReferralStatus::Rejected => "rejected",
            ReferralStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ReferralStatus::Draft),
            "pending" => Some(ReferralStatus::Pending),
            "unpaid" => Some(ReferralStatus::Unpaid),
            "paid" => Some(ReferralStatus::Paid),
            "rejected" => Some(ReferralStatus::Rejected),
            "failed" => Some(ReferralStatus::Failed),
            _ => None,
        }
    }

    /// Statuses that represent real money owed or settled.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ReferralStatus::Pending | ReferralStatus::Unpaid | ReferralStatus::Paid
        )
    }
}

impl fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AffiliateStatus {
    Active,
    Inactive,
    Pending,
    Rejected,
}

impl AffiliateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AffiliateStatus::Active => "active",
            AffiliateStatus::Inactive => "inactive",
            AffiliateStatus::Pending => "pending",
            AffiliateStatus::Rejected => "rejected",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AffiliateStatus::Active),
            "inactive" => Some(AffiliateStatus::Inactive),
            "pending" => Some(AffiliateStatus::Pending),
            "rejected" => Some(AffiliateStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RateType {
    Percentage,
    Flat,
}

impl RateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateType::Percentage => "percentage",
            RateType::Flat => "flat",
        }
    }

    pub fn parse_rate_type(s: &str) -> Option<Self> {
        match s {
            "percentage" => Some(RateType::Percentage),
            "flat" => Some(RateType::Flat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: Option<String>,
    pub name: String,
    pub price: f64,
    pub referral_amount: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Customer {
    pub name: String,
    pub email: String,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Referral {
    pub id: i64,
    pub affiliate_id: i64,
    pub reference: String,
    pub context: String,
    pub status: ReferralStatus,
    pub amount: f64,
    pub order_total: f64,
    pub currency: String,
    pub description: String,
    pub visit_id: Option<i64>,
    pub campaign: String,
    pub products: Vec<Product>,
    pub custom: Map<String, Value>,
    pub customer: Customer,
    pub payout_batch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial referral data supplied by integrations. `None` leaves the stored
/// value untouched when merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReferralFields {
    pub status: Option<ReferralStatus>,
    pub amount: Option<f64>,
    pub order_total: Option<f64>,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub visit_id: Option<i64>,
    pub campaign: Option<String>,
    pub products: Option<Vec<Product>>,
    pub custom: Option<Map<String, Value>>,
    pub customer: Option<Customer>,
}

impl ReferralFields {
    pub fn pending(amount: f64) -> Self {
        Self {
            status: Some(ReferralStatus::Pending),
            amount: Some(amount),
            ..Default::default()
        }
    }

    /// Merge these fields into `referral`. Custom maps are merged key by key.
    pub fn apply_to(&self, referral: &mut Referral) {
        if let Some(status) = self.status {
            referral.status = status;
        }
        if let Some(amount) = self.amount {
            referral.amount = amount;
        }
        if let Some(total) = self.order_total {
            referral.order_total = total;
        }
        if let Some(currency) = &self.currency {
            referral.currency = currency.clone();
        }
        if let Some(description) = &self.description {
            referral.description = description.clone();
        }
        if let Some(visit_id) = self.visit_id {
            referral.visit_id = Some(visit_id);
        }
        if let Some(campaign) = &self.campaign {
            referral.campaign = campaign.clone();
        }
        if let Some(products) = &self.products {
            referral.products = products.clone();
        }
        if let Some(custom) = &self.custom {
            for (k, v) in custom {
                referral.custom.insert(k.clone(), v.clone());
            }
        }
        if let Some(customer) = &self.customer {
            referral.customer = customer.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Affiliate {
    pub id: i64,
    pub user_id: i64,
    pub email: String,
    pub status: AffiliateStatus,
    pub rate: Option<f64>,
    pub rate_type: Option<RateType>,
    pub referral_count: i64,
    pub unpaid_earnings: f64,
    pub paid_earnings: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Visit {
    pub id: i64,
    pub affiliate_id: i64,
    pub referral_id: Option<i64>,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payout {
    pub id: i64,
    pub batch_key: String,
    pub affiliate_id: i64,
    pub amount: f64,
    pub referral_count: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_str() {
        for s in ["draft", "pending", "unpaid", "paid", "rejected", "failed"] {
            assert_eq!(ReferralStatus::parse_status(s).unwrap().as_str(), s);
        }
        assert!(ReferralStatus::parse_status("refunded").is_none());
    }

    #[test]
    fn live_statuses_exclude_reservations_and_terminal_failures() {
        assert!(!ReferralStatus::Draft.is_live());
        assert!(!ReferralStatus::Failed.is_live());
        assert!(!ReferralStatus::Rejected.is_live());
        assert!(ReferralStatus::Pending.is_live());
        assert!(ReferralStatus::Paid.is_live());
    }

    #[test]
    fn apply_merges_custom_keys() {
        let now = Utc::now();
        let mut r = Referral {
            id: 1,
            affiliate_id: 2,
            reference: "ORD-1".into(),
            context: "shop".into(),
            status: ReferralStatus::Draft,
            amount: 0.0,
            order_total: 0.0,
            currency: String::new(),
            description: String::new(),
            visit_id: None,
            campaign: String::new(),
            products: vec![],
            custom: json!({"a": 1}).as_object().cloned().unwrap(),
            customer: Customer::default(),
            payout_batch: None,
            created_at: now,
            updated_at: now,
        };
        let fields = ReferralFields {
            custom: json!({"b": 2}).as_object().cloned(),
            ..ReferralFields::pending(12.5)
        };
        fields.apply_to(&mut r);
        assert_eq!(r.status, ReferralStatus::Pending);
        assert_eq!(r.amount, 12.5);
        assert_eq!(r.custom.len(), 2);
    }
}
