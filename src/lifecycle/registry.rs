//! Explicit registration of the storefront integrations allowed to drive
//! referrals, and the context-bound handle each adapter works through.

use anyhow::Result;
use std::collections::BTreeMap;

use super::ReferralManager;
use crate::model::{Referral, ReferralFields};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrationRegistry {
    entries: BTreeMap<String, bool>,
}

impl IntegrationRegistry {
    pub fn register(&mut self, context: &str, enabled: bool) {
        self.entries.insert(context.to_string(), enabled);
    }

    pub fn with(mut self, context: &str) -> Self {
        self.register(context, true);
        self
    }

    pub fn is_registered(&self, context: &str) -> bool {
        self.entries.contains_key(context)
    }

    /// Unregistered contexts count as disabled.
    pub fn is_enabled(&self, context: &str) -> bool {
        self.entries.get(context).copied().unwrap_or(false)
    }

    pub fn contexts(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// A lifecycle manager view bound to one integration context. Adapters hold
/// one of these instead of passing their context tag on every call.
#[derive(Clone, Copy)]
pub struct Integration<'a> {
    manager: &'a ReferralManager,
    context: &'a str,
}

impl<'a> Integration<'a> {
    pub(super) fn new(manager: &'a ReferralManager, context: &'a str) -> Self {
        Self { manager, context }
    }

    pub fn context(&self) -> &str {
        self.context
    }

    pub fn is_enabled(&self) -> bool {
        self.manager.integrations().is_enabled(self.context)
    }

    pub async fn create_draft(
        &self,
        affiliate_id: i64,
        reference: &str,
        fields: ReferralFields,
    ) -> Result<Option<i64>> {
        self.manager
            .create_draft(affiliate_id, reference, self.context, fields)
            .await
    }

    pub async fn hydrate(&self, id: i64, fields: ReferralFields) -> Result<bool> {
        self.manager.hydrate(id, fields).await
    }

    pub async fn mark_failed(&self, id: i64) -> Result<bool> {
        self.manager.mark_failed(id).await
    }

    pub async fn complete(&self, reference: &str) -> Result<bool> {
        self.manager.complete((reference, self.context)).await
    }

    pub async fn reject(&self, reference: &str, allow_pending: bool) -> Result<bool> {
        self.manager
            .reject((reference, self.context), allow_pending)
            .await
    }

    pub async fn fail(&self, reference: &str) -> Result<bool> {
        self.manager.fail((reference, self.context)).await
    }

    pub async fn find_referral(&self, reference: &str) -> Result<Option<Referral>> {
        crate::db::find_referral(self.manager.pool(), reference, self.context).await
    }

    pub async fn find_live_duplicate(
        &self,
        reference: &str,
        exclude_id: i64,
    ) -> Result<Option<Referral>> {
        self.manager
            .find_live_duplicate(reference, self.context, exclude_id)
            .await
    }
}
