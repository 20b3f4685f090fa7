//! Domain events emitted on referral transitions.
//!
//! Sinks are fire-and-forget: `notify` must return immediately and a failing
//! consumer never affects the transition that produced the event.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::Referral;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Completed,
    Rejected,
    Failed,
    Paid,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Completed => "referral.completed",
            EventKind::Rejected => "referral.rejected",
            EventKind::Failed => "referral.failed",
            EventKind::Paid => "referral.paid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReferralEvent {
    pub kind: EventKind,
    pub referral_id: i64,
    pub affiliate_id: i64,
    pub reference: String,
    pub context: String,
    pub amount: f64,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
}

impl ReferralEvent {
    pub fn new(kind: EventKind, referral: &Referral) -> Self {
        Self {
            kind,
            referral_id: referral.id,
            affiliate_id: referral.affiliate_id,
            reference: referral.reference.clone(),
            context: referral.context.clone(),
            amount: referral.amount,
            currency: referral.currency.clone(),
            occurred_at: Utc::now(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn notify(&self, event: ReferralEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn notify(&self, event: ReferralEvent) {
        debug!(kind = event.kind.as_str(), referral_id = event.referral_id, "event dropped");
    }
}

/// Forwards events into an unbounded channel for an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ReferralEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReferralEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn notify(&self, event: ReferralEvent) {
        if let Err(err) = self.tx.send(event) {
            debug!(referral_id = err.0.referral_id, "event consumer gone; dropping event");
        }
    }
}

/// Posts each event as JSON to a webhook endpoint on a background task.
#[derive(Clone)]
pub struct WebhookSink {
    http: Client,
    url: Url,
    token: Option<String>,
}

impl fmt::Debug for WebhookSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSink")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebhookSink {
    pub fn new(url: &str, token: Option<String>) -> Result<Self> {
        let url = Url::parse(url).context("invalid webhook URL")?;
        let http = Client::builder()
            .user_agent("referral-desk/0.1")
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build webhook client")?;
        Ok(Self { http, url, token })
    }

    pub fn build_request(&self, event: &ReferralEvent) -> Result<reqwest::Request> {
        let mut req = self
            .http
            .post(self.url.clone())
            .header("Content-Type", "application/json")
            .header("X-Referral-Event", event.kind.as_str())
            .json(event);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req.build().context("failed to build webhook request")
    }

    async fn deliver(http: Client, request: reqwest::Request) -> Result<()> {
        let res = http
            .execute(request)
            .await
            .context("failed to reach webhook")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("webhook error {}: {}", status, body);
        }
        Ok(())
    }
}

impl EventSink for WebhookSink {
    fn notify(&self, event: ReferralEvent) {
        let request = match self.build_request(&event) {
            Ok(req) => req,
            Err(err) => {
                warn!(?err, referral_id = event.referral_id, "dropping event");
                return;
            }
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(referral_id = event.referral_id, "no runtime for webhook delivery; dropping event");
            return;
        };
        let http = self.http.clone();
        let kind = event.kind.as_str();
        let referral_id = event.referral_id;
        handle.spawn(async move {
            if let Err(err) = WebhookSink::deliver(http, request).await {
                warn!(?err, kind, referral_id, "webhook delivery failed");
            }
        });
    }
}
