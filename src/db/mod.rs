//! Database module: filter/view models and SQL repositories.
//!
//! - `model`: query filters and row slices used by the lifecycle manager and jobs.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `referral_desk::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{AffiliateFilter, AffiliateStats, NewAffiliate, PayoutScope};
