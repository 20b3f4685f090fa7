use super::model::{AffiliateFilter, AffiliateStats, NewAffiliate, PayoutScope};
use crate::model::{
    Affiliate, AffiliateStatus, Customer, Payout, RateType, Referral, ReferralFields,
    ReferralStatus, Visit,
};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

const REFERRAL_COLUMNS: &str = "id, affiliate_id, reference, context, status, amount, order_total, \
     currency, description, visit_id, campaign, products, custom, customer_name, customer_email, \
     customer_ip, payout_batch, created_at, updated_at";

const AFFILIATE_COLUMNS: &str = "id, user_id, email, status, rate, rate_type, referral_count, \
     unpaid_earnings, paid_earnings, created_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    // sqlx refuses to open a missing file unless asked to create it.
    if !rebuilt.contains("mode=") {
        rebuilt.push(if query_part.is_some() { '&' } else { '?' });
        rebuilt.push_str("mode=rwc");
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Affiliates

#[instrument(skip_all)]
pub async fn insert_affiliate(pool: &Pool, affiliate: &NewAffiliate) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO affiliates (user_id, email, status, rate, rate_type, created_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(affiliate.user_id)
    .bind(&affiliate.email)
    .bind(affiliate.status.as_str())
    .bind(affiliate.rate)
    .bind(affiliate.rate_type.map(|t| t.as_str()))
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn get_affiliate(pool: &Pool, id: i64) -> Result<Option<Affiliate>> {
    let row = sqlx::query(&format!(
        "SELECT {AFFILIATE_COLUMNS} FROM affiliates WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(affiliate_from_row).transpose()
}

fn push_affiliate_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &AffiliateFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if !filter.ids.is_empty() {
        qb.push(" AND id IN (");
        let mut ids = qb.separated(", ");
        for id in &filter.ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
    }
}

#[instrument(skip_all)]
pub async fn query_affiliates(pool: &Pool, filter: &AffiliateFilter) -> Result<Vec<Affiliate>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {AFFILIATE_COLUMNS} FROM affiliates"));
    push_affiliate_filter(&mut qb, filter);
    qb.push(" ORDER BY id ASC");
    // SQLite needs a LIMIT before OFFSET; -1 means unbounded.
    qb.push(" LIMIT ")
        .push_bind(filter.limit.map(i64::from).unwrap_or(-1));
    qb.push(" OFFSET ").push_bind(filter.offset as i64);
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(affiliate_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_affiliates(pool: &Pool, filter: &AffiliateFilter) -> Result<i64> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM affiliates");
    push_affiliate_filter(&mut qb, filter);
    let count: i64 = qb.build_query_scalar().fetch_one(pool).await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn referral_stats(pool: &Pool, affiliate_id: i64) -> Result<AffiliateStats> {
    let (referral_count, unpaid_earnings, paid_earnings): (i64, f64, f64) = sqlx::query_as(
        "SELECT COUNT(CASE WHEN status = 'paid' THEN 1 END), \
                TOTAL(CASE WHEN status = 'unpaid' THEN amount END), \
                TOTAL(CASE WHEN status = 'paid' THEN amount END) \
         FROM referrals WHERE affiliate_id = ?",
    )
    .bind(affiliate_id)
    .fetch_one(pool)
    .await?;
    Ok(AffiliateStats {
        referral_count,
        unpaid_earnings,
        paid_earnings,
    })
}

#[instrument(skip_all)]
pub async fn update_affiliate_stats(pool: &Pool, id: i64, stats: &AffiliateStats) -> Result<()> {
    sqlx::query(
        "UPDATE affiliates SET referral_count = ?, unpaid_earnings = ?, paid_earnings = ? WHERE id = ?",
    )
    .bind(stats.referral_count)
    .bind(stats.unpaid_earnings)
    .bind(stats.paid_earnings)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to persist affiliate stats")?;
    Ok(())
}

fn affiliate_from_row(row: &SqliteRow) -> Result<Affiliate> {
    let id: i64 = row.get("id");
    let status_str: String = row.get("status");
    let status = AffiliateStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("affiliate {} has unknown status {}", id, status_str))?;
    Ok(Affiliate {
        id,
        user_id: row.get("user_id"),
        email: row.get("email"),
        status,
        rate: row.try_get::<Option<f64>, _>("rate").ok().flatten(),
        rate_type: row
            .try_get::<Option<String>, _>("rate_type")
            .ok()
            .flatten()
            .and_then(|s| RateType::parse_rate_type(&s)),
        referral_count: row.get("referral_count"),
        unpaid_earnings: row.get("unpaid_earnings"),
        paid_earnings: row.get("paid_earnings"),
        created_at: row.get("created_at"),
    })
}

// ---------------------------------------------------------------------------
// Visits

#[instrument(skip_all)]
pub async fn insert_visit(pool: &Pool, affiliate_id: i64, url: &str) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO visits (affiliate_id, url, created_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(affiliate_id)
    .bind(url)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn get_visit(pool: &Pool, id: i64) -> Result<Option<Visit>> {
    let row = sqlx::query(
        "SELECT id, affiliate_id, referral_id, url, created_at FROM visits WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| Visit {
        id: row.get("id"),
        affiliate_id: row.get("affiliate_id"),
        referral_id: row.try_get::<Option<i64>, _>("referral_id").ok().flatten(),
        url: row.get("url"),
        created_at: row.get("created_at"),
    }))
}

/// Record that a visit converted into `referral_id`.
#[instrument(skip_all)]
pub async fn attach_visit(pool: &Pool, visit_id: i64, referral_id: i64) -> Result<()> {
    sqlx::query("UPDATE visits SET referral_id = ? WHERE id = ?")
        .bind(referral_id)
        .bind(visit_id)
        .execute(pool)
        .await
        .context("failed to attach visit")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Referrals

/// Insert a referral row. The status defaults to draft when `fields` has none.
#[instrument(skip_all)]
pub async fn insert_referral(
    pool: &Pool,
    affiliate_id: i64,
    reference: &str,
    context: &str,
    fields: &ReferralFields,
) -> Result<i64> {
    let customer = fields.customer.clone().unwrap_or_default();
    let products = serde_json::to_string(&fields.products.clone().unwrap_or_default())?;
    let custom = serde_json::to_string(&fields.custom.clone().unwrap_or_default())?;
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO referrals (affiliate_id, reference, context, status, amount, order_total, currency, description, \
         visit_id, campaign, products, custom, customer_name, customer_email, customer_ip, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(affiliate_id)
    .bind(reference)
    .bind(context)
    .bind(fields.status.unwrap_or(ReferralStatus::Draft).as_str())
    .bind(fields.amount.unwrap_or(0.0))
    .bind(fields.order_total.unwrap_or(0.0))
    .bind(fields.currency.as_deref().unwrap_or(""))
    .bind(fields.description.as_deref().unwrap_or(""))
    .bind(fields.visit_id)
    .bind(fields.campaign.as_deref().unwrap_or(""))
    .bind(products)
    .bind(custom)
    .bind(&customer.name)
    .bind(&customer.email)
    .bind(&customer.ip)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn get_referral(pool: &Pool, id: i64) -> Result<Option<Referral>> {
    let row = sqlx::query(&format!(
        "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(referral_from_row).transpose()
}

/// Look up the referral an integration means by `reference` within `context`.
///
/// When several rows share the pair, live or settled rows win over drafts,
/// drafts win over failed rows, and newer rows win within a rank.
#[instrument(skip_all)]
pub async fn find_referral(pool: &Pool, reference: &str, context: &str) -> Result<Option<Referral>> {
    let row = sqlx::query(&format!(
        "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE reference = ? AND context = ? \
         ORDER BY CASE status WHEN 'failed' THEN 2 WHEN 'draft' THEN 1 ELSE 0 END, id DESC LIMIT 1"
    ))
    .bind(reference)
    .bind(context)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(referral_from_row).transpose()
}

/// A sibling for the same (reference, context) that is neither a draft nor failed.
#[instrument(skip_all)]
pub async fn find_live_sibling(
    pool: &Pool,
    reference: &str,
    context: &str,
    exclude_id: i64,
) -> Result<Option<Referral>> {
    let row = sqlx::query(&format!(
        "SELECT {REFERRAL_COLUMNS} FROM referrals \
         WHERE reference = ? AND context = ? AND id != ? AND status NOT IN ('draft', 'failed') \
         ORDER BY id ASC LIMIT 1"
    ))
    .bind(reference)
    .bind(context)
    .bind(exclude_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(referral_from_row).transpose()
}

/// Write every mutable column of `referral`, provided the stored status is
/// still `expected`. Returns false when another writer moved it first.
#[instrument(skip_all)]
pub async fn update_referral(
    pool: &Pool,
    referral: &Referral,
    expected: ReferralStatus,
) -> Result<bool> {
    let products = serde_json::to_string(&referral.products)?;
    let custom = serde_json::to_string(&referral.custom)?;
    let res = sqlx::query(
        "UPDATE referrals SET affiliate_id = ?, reference = ?, context = ?, status = ?, amount = ?, order_total = ?, \
         currency = ?, description = ?, visit_id = ?, campaign = ?, products = ?, custom = ?, customer_name = ?, \
         customer_email = ?, customer_ip = ?, payout_batch = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(referral.affiliate_id)
    .bind(&referral.reference)
    .bind(&referral.context)
    .bind(referral.status.as_str())
    .bind(referral.amount)
    .bind(referral.order_total)
    .bind(&referral.currency)
    .bind(&referral.description)
    .bind(referral.visit_id)
    .bind(&referral.campaign)
    .bind(products)
    .bind(custom)
    .bind(&referral.customer.name)
    .bind(&referral.customer.email)
    .bind(&referral.customer.ip)
    .bind(referral.payout_batch.as_deref())
    .bind(Utc::now())
    .bind(referral.id)
    .bind(expected.as_str())
    .execute(pool)
    .await
    .context("failed to update referral")?;
    Ok(res.rows_affected() == 1)
}

/// Compare-and-set a referral's status.
#[instrument(skip_all)]
pub async fn set_referral_status(
    pool: &Pool,
    id: i64,
    from: ReferralStatus,
    to: ReferralStatus,
) -> Result<bool> {
    let res = sqlx::query("UPDATE referrals SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await
        .context("failed to update referral status")?;
    Ok(res.rows_affected() == 1)
}

/// Move an unpaid referral to paid and stamp the payout batch it settled in.
#[instrument(skip_all)]
pub async fn mark_referral_paid(pool: &Pool, id: i64, batch_key: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE referrals SET status = 'paid', payout_batch = ?, updated_at = ? WHERE id = ? AND status = 'unpaid'",
    )
    .bind(batch_key)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark referral paid")?;
    Ok(res.rows_affected() == 1)
}

/// Page through all referrals in id order.
#[instrument(skip_all)]
pub async fn list_referrals(pool: &Pool, limit: u32, offset: u64) -> Result<Vec<Referral>> {
    let rows = sqlx::query(&format!(
        "SELECT {REFERRAL_COLUMNS} FROM referrals ORDER BY id ASC LIMIT ? OFFSET ?"
    ))
    .bind(i64::from(limit))
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;
    rows.iter().map(referral_from_row).collect()
}

fn referral_from_row(row: &SqliteRow) -> Result<Referral> {
    let id: i64 = row.get("id");
    let status_str: String = row.get("status");
    let status = ReferralStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("referral {} has unknown status {}", id, status_str))?;

    // Integrations write these blobs with varying quality; a broken blob must
    // not make the row unreadable.
    let products_raw: String = row.get("products");
    let products = serde_json::from_str(&products_raw).unwrap_or_else(|err| {
        warn!(id, ?err, "unreadable products column; treating as empty");
        Vec::new()
    });
    let custom_raw: String = row.get("custom");
    let custom = serde_json::from_str::<Map<String, Value>>(&custom_raw).unwrap_or_else(|err| {
        warn!(id, ?err, "unreadable custom column; treating as empty");
        Map::new()
    });

    Ok(Referral {
        id,
        affiliate_id: row.get("affiliate_id"),
        reference: row.get("reference"),
        context: row.get("context"),
        status,
        amount: row.get("amount"),
        order_total: row.get("order_total"),
        currency: row.get("currency"),
        description: row.get("description"),
        visit_id: row.try_get::<Option<i64>, _>("visit_id").ok().flatten(),
        campaign: row.get("campaign"),
        products,
        custom,
        customer: Customer {
            name: row.get("customer_name"),
            email: row.get("customer_email"),
            ip: row.get("customer_ip"),
        },
        payout_batch: row
            .try_get::<Option<String>, _>("payout_batch")
            .ok()
            .flatten(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ---------------------------------------------------------------------------
// Payouts

#[instrument(skip_all)]
pub async fn max_referral_id(pool: &Pool) -> Result<i64> {
    let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM referrals")
        .fetch_one(pool)
        .await?;
    Ok(id.unwrap_or(0))
}

fn push_payout_scope(qb: &mut QueryBuilder<'_, Sqlite>, scope: &PayoutScope) {
    qb.push(" WHERE id <= ").push_bind(scope.max_referral_id);
    qb.push(" AND (status = 'unpaid' OR (status = 'paid' AND payout_batch = ")
        .push_bind(scope.batch_key.clone())
        .push("))");
    if !scope.affiliate_ids.is_empty() {
        qb.push(" AND affiliate_id IN (");
        let mut ids = qb.separated(", ");
        for id in &scope.affiliate_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
    }
}

#[instrument(skip_all)]
pub async fn count_payout_candidates(pool: &Pool, scope: &PayoutScope) -> Result<i64> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM referrals");
    push_payout_scope(&mut qb, scope);
    let count: i64 = qb.build_query_scalar().fetch_one(pool).await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn payout_candidates(
    pool: &Pool,
    scope: &PayoutScope,
    limit: u32,
    offset: u64,
) -> Result<Vec<Referral>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {REFERRAL_COLUMNS} FROM referrals"));
    push_payout_scope(&mut qb, scope);
    qb.push(" ORDER BY id ASC LIMIT ")
        .push_bind(i64::from(limit))
        .push(" OFFSET ")
        .push_bind(offset as i64);
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(referral_from_row).collect()
}

/// Recompute an affiliate's payout row for `batch_key` from the referrals
/// stamped with that batch. Safe to repeat.
#[instrument(skip_all)]
pub async fn refresh_payout(pool: &Pool, batch_key: &str, affiliate_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO payouts (batch_key, affiliate_id, amount, referral_count, created_at) \
         SELECT ?, ?, TOTAL(amount), COUNT(*), ? FROM referrals WHERE payout_batch = ? AND affiliate_id = ? AND status = 'paid' \
         ON CONFLICT (batch_key, affiliate_id) DO UPDATE SET amount = excluded.amount, referral_count = excluded.referral_count",
    )
    .bind(batch_key)
    .bind(affiliate_id)
    .bind(Utc::now())
    .bind(batch_key)
    .bind(affiliate_id)
    .execute(pool)
    .await
    .context("failed to refresh payout")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_payouts(pool: &Pool, batch_key: &str) -> Result<Vec<Payout>> {
    let rows = sqlx::query(
        "SELECT id, batch_key, affiliate_id, amount, referral_count, created_at FROM payouts WHERE batch_key = ? ORDER BY affiliate_id",
    )
    .bind(batch_key)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| Payout {
            id: row.get("id"),
            batch_key: row.get("batch_key"),
            affiliate_id: row.get("affiliate_id"),
            amount: row.get("amount"),
            referral_count: row.get("referral_count"),
            created_at: row.get("created_at"),
        })
        .collect())
}
