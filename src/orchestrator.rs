//! Campaign lifecycle and bulk delivery.

use crate::{
    domain::{
        filter_segment, normalize_email, Audience, Campaign, CampaignChanges, CampaignStatus,
        EmailEvent, EmailEventKind, NewCampaign, NewSegment, Segment, SegmentRule, SnapshotRecipient,
        SubscriberEmail, UNSUBSCRIBE_PLACEHOLDER,
    },
    email_client::{EmailClient, OutgoingEmail},
    personalize::{personalize, PersonalizationContext},
    store::{DeliveryOutcome, Store},
    tracking_links::TrackingLinks,
};
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashSet, VecDeque},
    future::Future,
    ops::AddAssign,
    sync::{Arc, Mutex},
    time::Duration as StdDuration,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::task::JoinSet;
use uuid::Uuid;

const TEST_SUBJECT_PREFIX: &str = "[Test] ";
const DEFAULT_TIMEZONE: &str = "UTC";
const FINISH_ATTEMPTS: u32 = 3;
const FINISH_BACKOFF: StdDuration = StdDuration::from_millis(250);

#[derive(Clone)]
pub struct CampaignOrchestrator {
    store: Arc<dyn Store>,
    email_client: EmailClient,
    links: TrackingLinks,
    concurrency: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Campaign not found")]
    NotFound,
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    Validation(String),
    #[error("No eligible recipients")]
    NoEligibleRecipients,
    #[error("Failed to deliver the test email")]
    Gateway(#[source] reqwest::Error),
    #[error("Something went wrong")]
    Unexpected(#[from] anyhow::Error),
}

#[derive(Debug, Default, Deserialize)]
pub struct ScheduleRequest {
    pub scheduled_for: Option<String>,
    pub timezone: Option<String>,
}

/// A campaign that has entered `sending` with its recipients frozen.
#[derive(Debug)]
pub struct SendJob {
    campaign: Campaign,
    recipients: Vec<SnapshotRecipient>,
}

impl SendJob {
    pub fn campaign_id(&self) -> Uuid {
        self.campaign.id
    }

    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SendReport {
    pub status: CampaignStatus,
    pub recipient_count: i64,
    pub delivered_count: i64,
    pub failed_count: i64,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct PreflightReport {
    pub has_subject: bool,
    pub has_content: bool,
    pub has_unsubscribe_link: bool,
    pub has_test_send: bool,
    pub has_audience: bool,
    pub eligible_recipients: usize,
    pub ready: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Tally {
    sent: usize,
    failed: usize,
}

impl AddAssign for Tally {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.failed += other.failed;
    }
}

/// Everything a delivery worker needs, shared by all workers of one send.
struct DeliveryContext {
    store: Arc<dyn Store>,
    email_client: EmailClient,
    links: TrackingLinks,
    campaign_id: Uuid,
    subject: String,
    preheader: Option<String>,
    html_content: String,
    queue: Mutex<VecDeque<SnapshotRecipient>>,
}

impl DeliveryContext {
    fn next_recipient(&self) -> Option<SnapshotRecipient> {
        self.queue.lock().ok()?.pop_front()
    }
}

impl CampaignOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        email_client: EmailClient,
        links: TrackingLinks,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            email_client,
            links,
            concurrency: concurrency.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[tracing::instrument(skip(self, new), fields(campaign_id = tracing::field::Empty))]
    pub async fn create(&self, new: NewCampaign) -> Result<Campaign, CampaignError> {
        let campaign = Campaign::draft(new);
        tracing::Span::current().record("campaign_id", tracing::field::display(campaign.id));

        self.store
            .insert_campaign(&campaign)
            .await
            .context("Failed to store a new campaign")?;
        Ok(campaign)
    }

    pub async fn get(&self, id: Uuid) -> Result<Campaign, CampaignError> {
        self.store
            .get_campaign(id)
            .await
            .context("Failed to load campaign")?
            .ok_or(CampaignError::NotFound)
    }

    pub async fn list(&self) -> Result<Vec<Campaign>, CampaignError> {
        Ok(self
            .store
            .list_campaigns()
            .await
            .context("Failed to list campaigns")?)
    }

    #[tracing::instrument(skip(self, changes))]
    pub async fn update(&self, id: Uuid, changes: CampaignChanges) -> Result<Campaign, CampaignError> {
        let mut campaign = self.get(id).await?;
        if !campaign.status.is_editable() {
            return Err(not_allowed("edit", campaign.status));
        }

        let expected = campaign.status;
        campaign.apply(changes);
        self.save(&campaign, expected).await?;
        Ok(campaign)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), CampaignError> {
        let campaign = self.get(id).await?;
        if !campaign.status.can_delete() {
            return Err(not_allowed("delete", campaign.status));
        }

        let deleted = self
            .store
            .delete_campaign(id, campaign.status)
            .await
            .context("Failed to delete campaign")?;
        if !deleted {
            return Err(concurrent_change());
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn schedule(
        &self,
        id: Uuid,
        request: ScheduleRequest,
    ) -> Result<Campaign, CampaignError> {
        let mut campaign = self.get(id).await?;
        if !campaign.status.can_schedule() {
            return Err(not_allowed("schedule", campaign.status));
        }

        let scheduled_for = request
            .scheduled_for
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| CampaignError::Validation("Schedule time is required".into()))?;
        let scheduled_for = OffsetDateTime::parse(scheduled_for.trim(), &Rfc3339).map_err(|e| {
            CampaignError::Validation(format!("Schedule time is not an RFC 3339 timestamp: {e}"))
        })?;
        let timezone = request
            .timezone
            .filter(|tz| !tz.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TIMEZONE.into());

        campaign.status = CampaignStatus::Scheduled;
        campaign.scheduled_for = Some(scheduled_for);
        campaign.scheduled_timezone = Some(timezone);
        campaign.updated_at = OffsetDateTime::now_utc();
        self.save(&campaign, CampaignStatus::Draft).await?;
        Ok(campaign)
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel_schedule(&self, id: Uuid) -> Result<Campaign, CampaignError> {
        let mut campaign = self.get(id).await?;
        if !campaign.status.can_cancel_schedule() {
            return Err(not_allowed("cancel the schedule of", campaign.status));
        }

        campaign.status = CampaignStatus::Draft;
        campaign.clear_schedule();
        campaign.updated_at = OffsetDateTime::now_utc();
        self.save(&campaign, CampaignStatus::Scheduled).await?;
        Ok(campaign)
    }

    /// Resolves the audience, freezes it and moves the campaign to `sending`.
    /// Nothing is written when the audience turns out empty.
    #[tracing::instrument(skip(self))]
    pub async fn prepare_send(&self, id: Uuid) -> Result<SendJob, CampaignError> {
        let mut campaign = self.get(id).await?;
        if !campaign.status.can_send() {
            return Err(not_allowed("send", campaign.status));
        }

        let recipients = self.resolve_recipients(&campaign.audience).await?;
        if recipients.is_empty() {
            return Err(CampaignError::NoEligibleRecipients);
        }

        let started = self
            .store
            .start_sending(id, campaign.status, &recipients)
            .await
            .context("Failed to freeze the recipient snapshot")?;
        if !started {
            return Err(concurrent_change());
        }

        tracing::info!(recipient_count = recipients.len(), "Campaign entered sending");
        campaign.status = CampaignStatus::Sending;
        campaign.recipient_count = recipients.len() as i64;
        campaign.recipient_snapshot = Some(recipients.clone());
        Ok(SendJob {
            campaign,
            recipients,
        })
    }

    /// Dispatches a prepared send through a fixed pool of workers and writes
    /// the terminal status once every worker has finished.
    #[tracing::instrument(skip_all, fields(campaign_id = %job.campaign.id))]
    pub async fn deliver(&self, job: SendJob) -> Result<SendReport, anyhow::Error> {
        let recipient_count = job.recipients.len() as i64;
        let workers = self.concurrency.min(job.recipients.len()).max(1);
        let context = Arc::new(DeliveryContext {
            store: Arc::clone(&self.store),
            email_client: self.email_client.clone(),
            links: self.links.clone(),
            campaign_id: job.campaign.id,
            subject: job.campaign.subject,
            preheader: job.campaign.preheader,
            html_content: job.campaign.html_content,
            queue: Mutex::new(job.recipients.into()),
        });

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(delivery_worker(Arc::clone(&context)));
        }

        let mut tally = Tally::default();
        while let Some(worker) = pool.join_next().await {
            match worker {
                Ok(worker_tally) => tally += worker_tally,
                Err(e) => tracing::error!(
                    error_cause_chain = ?e,
                    error.message = %e,
                    "A delivery worker panicked"
                ),
            }
        }

        let campaign_id = context.campaign_id;
        let outcome = with_retries(FINISH_ATTEMPTS, FINISH_BACKOFF, move || {
            self.finish(campaign_id, recipient_count)
        })
        .await
        .map_err(|e| {
            tracing::error!(
                error_cause_chain = ?e,
                error.message = %e,
                %campaign_id,
                recipient_count,
                "Campaign is stuck in sending, its delivery outcome could not be recorded"
            );
            e
        })?;
        let delivered_count = outcome.delivered_count;

        tracing::info!(
            sent = tally.sent,
            failed = tally.failed,
            delivered_count,
            status = outcome.status.as_ref(),
            "Campaign delivery finished"
        );

        Ok(SendReport {
            status: outcome.status,
            recipient_count,
            delivered_count,
            failed_count: outcome.failed_count,
        })
    }

    /// Derives the counts from the event log and writes the terminal status.
    async fn finish(
        &self,
        campaign_id: Uuid,
        recipient_count: i64,
    ) -> Result<DeliveryOutcome, anyhow::Error> {
        let delivered_count = self
            .store
            .list_events(campaign_id, &[EmailEventKind::Delivered])
            .await
            .context("Failed to count delivered events")?
            .len() as i64;
        let outcome = DeliveryOutcome {
            status: CampaignStatus::after_delivery(delivered_count),
            sent_at: OffsetDateTime::now_utc(),
            delivered_count,
            failed_count: recipient_count - delivered_count,
        };
        self.store
            .finish_sending(campaign_id, &outcome)
            .await
            .context("Failed to record delivery outcome")?;
        Ok(outcome)
    }

    pub async fn send_campaign(&self, id: Uuid) -> Result<SendReport, CampaignError> {
        let job = self.prepare_send(id).await?;
        Ok(self.deliver(job).await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn send_test(&self, id: Uuid, email: Option<String>) -> Result<(), CampaignError> {
        let email = email
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| CampaignError::Validation("Test email address is required".into()))?;
        let recipient = SubscriberEmail::parse(email).map_err(CampaignError::Validation)?;
        let campaign = self.get(id).await?;

        let html_content = personalize(
            &campaign.html_content,
            &PersonalizationContext {
                campaign_id: campaign.id,
                recipient: recipient.as_ref(),
                preheader: campaign.preheader.as_deref(),
                links: &self.links,
                tracking: false,
            },
        )?;
        let subject = format!("{TEST_SUBJECT_PREFIX}{}", campaign.subject);
        let unsubscribe_url = self.links.unsubscribe(recipient.as_ref(), Some(campaign.id));

        self.email_client
            .send_email(&OutgoingEmail {
                recipient: &recipient,
                subject: &subject,
                html_content: &html_content,
                unsubscribe_url: unsubscribe_url.as_str(),
                campaign_id: Some(campaign.id),
            })
            .await
            .map_err(CampaignError::Gateway)?;

        self.store
            .add_test_recipient(id, recipient.as_ref())
            .await
            .context("Failed to remember the test recipient")?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn preflight(&self, id: Uuid) -> Result<PreflightReport, CampaignError> {
        let campaign = self.get(id).await?;

        let eligible_recipients = match self.resolve_recipients(&campaign.audience).await {
            Ok(recipients) => recipients.len(),
            Err(CampaignError::Validation(_)) => 0,
            Err(e) => return Err(e),
        };
        let has_subject = !campaign.subject.trim().is_empty();
        let has_content = !campaign.html_content.trim().is_empty();
        let has_unsubscribe_link = campaign.html_content.contains(UNSUBSCRIBE_PLACEHOLDER)
            || campaign.html_content.contains("/unsubscribe");
        let has_test_send = !campaign.test_recipients.is_empty();
        let has_audience = campaign.audience_confirmed;

        Ok(PreflightReport {
            has_subject,
            has_content,
            has_unsubscribe_link,
            has_test_send,
            has_audience,
            eligible_recipients,
            ready: has_subject
                && has_content
                && has_unsubscribe_link
                && has_test_send
                && has_audience
                && eligible_recipients > 0,
        })
    }

    #[tracing::instrument(skip(self, new))]
    pub async fn create_segment(&self, new: NewSegment) -> Result<Segment, CampaignError> {
        if new.name.trim().is_empty() {
            return Err(CampaignError::Validation("Segment name is required".into()));
        }

        let segment = Segment::new(new);
        self.store
            .insert_segment(&segment)
            .await
            .context("Failed to store segment")?;
        self.refresh_segment(segment.id).await
    }

    /// Recomputes the cached size of a saved segment.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_segment(&self, id: Uuid) -> Result<Segment, CampaignError> {
        let mut segment = self
            .store
            .get_segment(id)
            .await
            .context("Failed to load segment")?
            .ok_or(CampaignError::NotFound)?;

        let subscribers = self
            .store
            .list_subscribed()
            .await
            .context("Failed to list subscribers")?;
        segment.subscriber_count = filter_segment(subscribers, Some(&segment.rule)).len() as i64;
        self.store
            .update_segment_count(id, segment.subscriber_count)
            .await
            .context("Failed to update segment size")?;
        Ok(segment)
    }

    async fn resolve_recipients(
        &self,
        audience: &Audience,
    ) -> Result<Vec<SnapshotRecipient>, CampaignError> {
        let rule: Option<SegmentRule> = match audience {
            Audience::All => None,
            Audience::Segment { segment_id } => Some(
                self.store
                    .get_segment(*segment_id)
                    .await
                    .context("Failed to load segment")?
                    .ok_or_else(|| {
                        CampaignError::Validation(format!("Segment {segment_id} does not exist"))
                    })?
                    .rule,
            ),
            Audience::Rules { rule } => Some(rule.clone()),
        };

        let subscribers = self
            .store
            .list_subscribed()
            .await
            .context("Failed to list subscribers")?;
        let suppressed: HashSet<String> = self
            .store
            .suppressed_emails()
            .await
            .context("Failed to load suppression list")?
            .iter()
            .map(|email| normalize_email(email))
            .collect();

        Ok(filter_segment(subscribers, rule.as_ref())
            .into_iter()
            .filter(|s| !suppressed.contains(&normalize_email(&s.email)))
            .map(|s| SnapshotRecipient {
                email: s.email,
                subscriber_id: s.id,
            })
            .collect())
    }

    async fn save(&self, campaign: &Campaign, expected: CampaignStatus) -> Result<(), CampaignError> {
        let saved = self
            .store
            .update_campaign(campaign, expected)
            .await
            .context("Failed to save campaign")?;
        if !saved {
            return Err(concurrent_change());
        }
        Ok(())
    }
}

async fn delivery_worker(context: Arc<DeliveryContext>) -> Tally {
    let mut tally = Tally::default();

    while let Some(recipient) = context.next_recipient() {
        match deliver_to(&context, &recipient).await {
            Ok(()) => tally.sent += 1,
            Err(e) => {
                tally.failed += 1;
                tracing::error!(
                    error_cause_chain = ?e,
                    error.message = %e,
                    recipient = %recipient.email,
                    "Failed to deliver campaign to a recipient. Skipping."
                );
            }
        }
    }

    tally
}

async fn deliver_to(
    context: &DeliveryContext,
    recipient: &SnapshotRecipient,
) -> Result<(), anyhow::Error> {
    let email = SubscriberEmail::parse(recipient.email.clone()).map_err(|e| anyhow!(e))?;
    let html_content = personalize(
        &context.html_content,
        &PersonalizationContext {
            campaign_id: context.campaign_id,
            recipient: email.as_ref(),
            preheader: context.preheader.as_deref(),
            links: &context.links,
            tracking: true,
        },
    )?;
    let unsubscribe_url = context
        .links
        .unsubscribe(email.as_ref(), Some(context.campaign_id));

    context
        .email_client
        .send_email(&OutgoingEmail {
            recipient: &email,
            subject: &context.subject,
            html_content: &html_content,
            unsubscribe_url: unsubscribe_url.as_str(),
            campaign_id: Some(context.campaign_id),
        })
        .await
        .context("Email gateway rejected the message")?;

    context
        .store
        .record_event(&EmailEvent::new(
            context.campaign_id,
            Some(recipient.subscriber_id),
            email.as_ref(),
            EmailEventKind::Delivered,
            None,
            OffsetDateTime::now_utc(),
        ))
        .await
        .context("Failed to record delivery")
}

/// Runs `operation` until it succeeds or `attempts` runs out, waiting a little
/// longer after each failure. Returns the last error.
async fn with_retries<T, F, Fut>(
    attempts: u32,
    backoff: StdDuration,
    mut operation: F,
) -> Result<T, anyhow::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, anyhow::Error>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                tracing::warn!(error.message = %e, attempt, "Retrying after failure");
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn not_allowed(action: &str, status: CampaignStatus) -> CampaignError {
    CampaignError::InvalidState(format!(
        "Cannot {action} a campaign that is {}",
        status.as_ref()
    ))
}

fn concurrent_change() -> CampaignError {
    CampaignError::InvalidState("Campaign was changed by another request".into())
}
