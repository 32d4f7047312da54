//! Untrusted inbound signals: tracking hits, unsubscribes and provider webhooks.
//!
//! Nothing in here is allowed to fail a caller's response. Errors come back as
//! [`IngestError`] so the route can log them and carry on.

use crate::{
    domain::{
        normalize_email, BounceHistory, BounceKind, Campaign, EmailEvent, EmailEventKind,
        EventMetadata, SubscriberEmail, SuppressionEntry, SuppressionReason,
    },
    store::Store,
};
use anyhow::Context;
use axum::http::HeaderValue;
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Soft bounces needed before an address is suppressed.
pub const SOFT_BOUNCE_LIMIT: i32 = 3;
/// How recent the previous soft bounce must be for the limit to apply.
pub const SOFT_BOUNCE_WINDOW: Duration = Duration::days(7);

const WEBHOOK_SOURCE: &str = "webhook";
const ADMIN_SOURCE: &str = "admin";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Webhook payload is not valid JSON")]
    MalformedPayload(#[source] serde_json::Error),
    #[error("`{0}` is not a valid campaign id")]
    InvalidCampaignId(String),
    #[error("`{0}` is not a valid link index")]
    InvalidLinkIndex(String),
    #[error("Campaign {0} does not exist")]
    UnknownCampaign(Uuid),
    #[error("Event carries no recipient address")]
    MissingRecipient,
    #[error("{0}")]
    InvalidRecipient(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Provider callback as it arrives on the wire.
#[derive(Debug, Default, Deserialize)]
pub struct RawWebhookEvent {
    #[serde(rename = "type", alias = "event", alias = "RecordType")]
    pub kind: String,
    #[serde(alias = "recipient", alias = "Recipient", alias = "Email")]
    pub email: Option<String>,
    pub campaign_id: Option<String>,
    #[serde(alias = "Metadata")]
    pub metadata: Option<RawWebhookMetadata>,
    #[serde(alias = "bounce_kind", alias = "Type")]
    pub bounce_type: Option<String>,
    #[serde(alias = "Description")]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawWebhookMetadata {
    pub campaign_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WebhookPayload {
    Batch(Vec<RawWebhookEvent>),
    Single(RawWebhookEvent),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookEvent {
    Bounced {
        recipient: SubscriberEmail,
        campaign_id: Option<Uuid>,
        kind: BounceKind,
        reason: Option<String>,
    },
    Complained {
        recipient: SubscriberEmail,
        campaign_id: Option<Uuid>,
    },
    Unsubscribed {
        recipient: SubscriberEmail,
        campaign_id: Option<Uuid>,
    },
    Delivered,
    Opened,
    Clicked,
    Unrecognized(String),
}

impl TryFrom<RawWebhookEvent> for WebhookEvent {
    type Error = IngestError;

    fn try_from(raw: RawWebhookEvent) -> Result<Self, Self::Error> {
        let kind = raw.kind.trim().to_lowercase();
        let kind = kind.strip_prefix("email.").unwrap_or(&kind);

        let recipient = || -> Result<SubscriberEmail, IngestError> {
            let email = raw
                .email
                .clone()
                .filter(|e| !e.trim().is_empty())
                .ok_or(IngestError::MissingRecipient)?;
            SubscriberEmail::parse(email).map_err(IngestError::InvalidRecipient)
        };
        // A malformed campaign id only loses the event log entry, not the policy.
        let campaign_id = raw
            .campaign_id
            .as_deref()
            .or_else(|| raw.metadata.as_ref().and_then(|m| m.campaign_id.as_deref()))
            .and_then(|id| Uuid::parse_str(id.trim()).ok());

        Ok(match kind {
            "bounced" | "bounce" => WebhookEvent::Bounced {
                recipient: recipient()?,
                campaign_id,
                kind: bounce_kind(raw.bounce_type.as_deref()),
                reason: raw.reason,
            },
            "complained" | "complaint" | "spamcomplaint" => WebhookEvent::Complained {
                recipient: recipient()?,
                campaign_id,
            },
            "unsubscribed" | "unsubscribe" => WebhookEvent::Unsubscribed {
                recipient: recipient()?,
                campaign_id,
            },
            "delivered" | "delivery" => WebhookEvent::Delivered,
            "opened" | "open" => WebhookEvent::Opened,
            "clicked" | "click" => WebhookEvent::Clicked,
            _ => WebhookEvent::Unrecognized(raw.kind),
        })
    }
}

/// Missing or unknown bounce types are treated as soft.
fn bounce_kind(raw: Option<&str>) -> BounceKind {
    match raw.map(|kind| kind.trim().to_lowercase()).as_deref() {
        Some("hard" | "permanent" | "hardbounce") => BounceKind::Hard,
        _ => BounceKind::Soft,
    }
}

/// Whether a soft bounce, already counted into `history`, tips the address
/// into suppression.
pub fn soft_bounce_escalates(history: BounceHistory, now: OffsetDateTime) -> bool {
    history.bounce_count >= SOFT_BOUNCE_LIMIT
        && history
            .previous_bounce_at
            .is_some_and(|previous| now - previous <= SOFT_BOUNCE_WINDOW)
}

/// Where a click redirect lands: the requested URL as written when it is
/// http(s), the application base otherwise. Only URLs that cannot travel in a
/// `Location` header verbatim are re-serialized.
pub fn click_destination(url: Option<&str>, fallback: &Url) -> String {
    let Some(requested) = url.map(str::trim) else {
        return fallback.to_string();
    };

    match Url::parse(requested) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
            if HeaderValue::from_str(requested).is_ok() {
                requested.to_owned()
            } else {
                parsed.into()
            }
        }
        _ => fallback.to_string(),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WebhookReport {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct EventIngestor {
    store: Arc<dyn Store>,
}

impl EventIngestor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self))]
    pub async fn record_open(
        &self,
        campaign_id: &str,
        email: Option<&str>,
    ) -> Result<(), IngestError> {
        let (campaign, email) = self.tracked_target(campaign_id, email).await?;
        self.record_tracking_event(&campaign, email, EmailEventKind::Opened, None)
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn record_click(
        &self,
        campaign_id: &str,
        link_index: &str,
        url: Option<&str>,
        email: Option<&str>,
    ) -> Result<(), IngestError> {
        let link_index: u32 = link_index
            .trim()
            .parse()
            .map_err(|_| IngestError::InvalidLinkIndex(link_index.to_owned()))?;
        let (campaign, email) = self.tracked_target(campaign_id, email).await?;
        let metadata = EventMetadata {
            url: url.map(Into::into),
            link_index: Some(link_index),
            ..Default::default()
        };
        self.record_tracking_event(&campaign, email, EmailEventKind::Clicked, Some(metadata))
            .await
    }

    /// Returns `true` when the address was subscribed until now.
    #[tracing::instrument(skip(self))]
    pub async fn unsubscribe(
        &self,
        email: Option<&str>,
        campaign_id: Option<&str>,
    ) -> Result<bool, IngestError> {
        let email = parse_recipient(email)?;
        let now = OffsetDateTime::now_utc();
        let flipped = self
            .store
            .unsubscribe(email.as_ref(), now)
            .await
            .context("Failed to unsubscribe")?;

        if flipped {
            let campaign_id = campaign_id.and_then(|id| Uuid::parse_str(id.trim()).ok());
            self.log_campaign_event(campaign_id, &email, EmailEventKind::Unsubscribed, None, now)
                .await?;
        }
        Ok(flipped)
    }

    /// Parses and applies a provider payload. One bad event does not stop the
    /// rest of a batch.
    #[tracing::instrument(skip_all)]
    pub async fn handle_webhook(&self, body: &[u8]) -> Result<WebhookReport, IngestError> {
        let events = match serde_json::from_slice(body).map_err(IngestError::MalformedPayload)? {
            WebhookPayload::Batch(events) => events,
            WebhookPayload::Single(event) => vec![event],
        };

        let mut report = WebhookReport::default();
        for raw in events {
            let outcome = match WebhookEvent::try_from(raw) {
                Ok(event) => self.apply(event, OffsetDateTime::now_utc()).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        error_cause_chain = ?e,
                        error.message = %e,
                        "Failed to process a webhook event. Skipping."
                    );
                }
            }
        }

        Ok(report)
    }

    #[tracing::instrument(skip(self))]
    pub async fn apply(&self, event: WebhookEvent, at: OffsetDateTime) -> Result<(), IngestError> {
        match event {
            WebhookEvent::Bounced {
                recipient,
                campaign_id,
                kind: BounceKind::Hard,
                reason,
            } => {
                self.suppress(&recipient, SuppressionReason::HardBounce, WEBHOOK_SOURCE, reason.clone())
                    .await?;
                self.unsubscribe_address(&recipient, at).await?;
                self.store
                    .record_bounce(recipient.as_ref(), at)
                    .await
                    .context("Failed to record bounce")?;
                self.log_bounce(campaign_id, &recipient, BounceKind::Hard, reason, at)
                    .await
            }
            WebhookEvent::Bounced {
                recipient,
                campaign_id,
                kind: BounceKind::Soft,
                reason,
            } => {
                let history = self
                    .store
                    .record_bounce(recipient.as_ref(), at)
                    .await
                    .context("Failed to record bounce")?;
                if let Some(history) = history.filter(|h| soft_bounce_escalates(*h, at)) {
                    tracing::info!(
                        bounce_count = history.bounce_count,
                        "Repeated soft bounces, suppressing address"
                    );
                    let details = format!(
                        "{} soft bounces, the last two within {} days",
                        history.bounce_count,
                        SOFT_BOUNCE_WINDOW.whole_days()
                    );
                    self.suppress(
                        &recipient,
                        SuppressionReason::ConsecutiveSoftBounce,
                        WEBHOOK_SOURCE,
                        Some(details),
                    )
                    .await?;
                    self.unsubscribe_address(&recipient, at).await?;
                }
                self.log_bounce(campaign_id, &recipient, BounceKind::Soft, reason, at)
                    .await
            }
            WebhookEvent::Complained {
                recipient,
                campaign_id,
            } => {
                self.suppress(&recipient, SuppressionReason::Complaint, WEBHOOK_SOURCE, None)
                    .await?;
                self.unsubscribe_address(&recipient, at).await?;
                self.log_campaign_event(campaign_id, &recipient, EmailEventKind::Complained, None, at)
                    .await
            }
            WebhookEvent::Unsubscribed {
                recipient,
                campaign_id,
            } => {
                if self.unsubscribe_address(&recipient, at).await? {
                    self.log_campaign_event(
                        campaign_id,
                        &recipient,
                        EmailEventKind::Unsubscribed,
                        None,
                        at,
                    )
                    .await?;
                }
                Ok(())
            }
            WebhookEvent::Delivered | WebhookEvent::Opened | WebhookEvent::Clicked => Ok(()),
            WebhookEvent::Unrecognized(kind) => {
                tracing::debug!(kind = %kind, "Ignoring unrecognized webhook event");
                Ok(())
            }
        }
    }

    /// Operator-initiated suppression. Returns `false` if already suppressed.
    #[tracing::instrument(skip(self))]
    pub async fn suppress_manually(
        &self,
        email: &SubscriberEmail,
        details: Option<String>,
    ) -> Result<bool, IngestError> {
        self.suppress(email, SuppressionReason::Manual, ADMIN_SOURCE, details)
            .await
    }

    async fn suppress(
        &self,
        email: &SubscriberEmail,
        reason: SuppressionReason,
        source: &str,
        details: Option<String>,
    ) -> Result<bool, IngestError> {
        let entry = SuppressionEntry::new(email.as_ref(), reason, source, details);
        let inserted = self
            .store
            .insert_suppression(&entry)
            .await
            .context("Failed to insert suppression")?;
        if !inserted {
            tracing::debug!(reason = reason.as_ref(), "Address was already suppressed");
        }
        Ok(inserted)
    }

    async fn unsubscribe_address(
        &self,
        email: &SubscriberEmail,
        at: OffsetDateTime,
    ) -> Result<bool, IngestError> {
        Ok(self
            .store
            .unsubscribe(email.as_ref(), at)
            .await
            .context("Failed to unsubscribe")?)
    }

    async fn tracked_target(
        &self,
        campaign_id: &str,
        email: Option<&str>,
    ) -> Result<(Campaign, SubscriberEmail), IngestError> {
        let id = Uuid::parse_str(campaign_id.trim())
            .map_err(|_| IngestError::InvalidCampaignId(campaign_id.to_owned()))?;
        let email = parse_recipient(email)?;
        let campaign = self
            .store
            .get_campaign(id)
            .await
            .context("Failed to load campaign")?
            .ok_or(IngestError::UnknownCampaign(id))?;
        Ok((campaign, email))
    }

    async fn record_tracking_event(
        &self,
        campaign: &Campaign,
        email: SubscriberEmail,
        kind: EmailEventKind,
        metadata: Option<EventMetadata>,
    ) -> Result<(), IngestError> {
        let event = EmailEvent::new(
            campaign.id,
            snapshot_subscriber(campaign, &email),
            email.as_ref(),
            kind,
            metadata,
            OffsetDateTime::now_utc(),
        );
        self.store
            .record_event(&event)
            .await
            .context("Failed to record tracking event")?;
        Ok(())
    }

    async fn log_bounce(
        &self,
        campaign_id: Option<Uuid>,
        email: &SubscriberEmail,
        kind: BounceKind,
        reason: Option<String>,
        at: OffsetDateTime,
    ) -> Result<(), IngestError> {
        let metadata = EventMetadata {
            bounce_kind: Some(kind),
            reason,
            ..Default::default()
        };
        self.log_campaign_event(campaign_id, email, EmailEventKind::Bounced, Some(metadata), at)
            .await
    }

    /// Appends an event when `campaign_id` names a stored campaign; anything
    /// else is dropped quietly.
    async fn log_campaign_event(
        &self,
        campaign_id: Option<Uuid>,
        email: &SubscriberEmail,
        kind: EmailEventKind,
        metadata: Option<EventMetadata>,
        at: OffsetDateTime,
    ) -> Result<(), IngestError> {
        let Some(campaign_id) = campaign_id else {
            return Ok(());
        };
        let Some(campaign) = self
            .store
            .get_campaign(campaign_id)
            .await
            .context("Failed to load campaign")?
        else {
            return Ok(());
        };

        let event = EmailEvent::new(
            campaign.id,
            snapshot_subscriber(&campaign, email),
            email.as_ref(),
            kind,
            metadata,
            at,
        );
        self.store
            .record_event(&event)
            .await
            .context("Failed to record event")?;
        Ok(())
    }
}

/// Events are attributed to the subscriber the campaign was frozen for, not to
/// whoever holds the address today.
fn snapshot_subscriber(campaign: &Campaign, email: &SubscriberEmail) -> Option<Uuid> {
    campaign
        .recipient_snapshot
        .as_ref()?
        .iter()
        .find(|r| r.email == email.as_ref())
        .map(|r| r.subscriber_id)
}

fn parse_recipient(email: Option<&str>) -> Result<SubscriberEmail, IngestError> {
    let email = email
        .map(normalize_email)
        .filter(|e| !e.is_empty())
        .ok_or(IngestError::MissingRecipient)?;
    SubscriberEmail::parse(email).map_err(IngestError::InvalidRecipient)
}
