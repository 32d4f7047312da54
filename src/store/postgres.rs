use super::{DeliveryOutcome, Store};
use crate::domain::{
    Audience, BounceHistory, Campaign, CampaignStatus, EmailEvent, EmailEventKind,
    EventMetadata, Segment, SegmentRule, SnapshotRecipient, Subscriber, SuppressionEntry,
    SuppressionReason,
};
use anyhow::Context;
use axum::async_trait;
use serde_json::Value;
use sqlx::{types::Json, FromRow, PgPool, Postgres, Transaction};
use std::collections::HashSet;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgStore {
    db_pool: PgPool,
}

impl PgStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    pub fn db_pool(&self) -> &PgPool {
        &self.db_pool
    }

    #[tracing::instrument(skip_all)]
    pub async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::migrate!("./migrations")
            .run(&self.db_pool)
            .await
            .context("Failed to migrate database")
    }
}

const CAMPAIGN_COLUMNS: &str = r#"
    id, subject, preheader, content, html_content, status, audience,
    audience_confirmed, scheduled_for, scheduled_timezone, sent_at,
    recipient_count, recipient_snapshot, delivered_count, failed_count,
    test_recipients, created_by, created_at, updated_at
"#;

const EVENT_COLUMNS: &str =
    "id, campaign_id, subscriber_id, email, kind, metadata, created_at";

#[derive(FromRow)]
struct CampaignRow {
    id: Uuid,
    subject: String,
    preheader: Option<String>,
    content: Json<Value>,
    html_content: String,
    status: String,
    audience: Json<Audience>,
    audience_confirmed: bool,
    scheduled_for: Option<OffsetDateTime>,
    scheduled_timezone: Option<String>,
    sent_at: Option<OffsetDateTime>,
    recipient_count: i64,
    recipient_snapshot: Option<Json<Vec<SnapshotRecipient>>>,
    delivered_count: i64,
    failed_count: i64,
    test_recipients: Vec<String>,
    created_by: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = anyhow::Error;

    fn try_from(row: CampaignRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            subject: row.subject,
            preheader: row.preheader,
            content: row.content.0,
            html_content: row.html_content,
            status: CampaignStatus::try_from(row.status).map_err(anyhow::Error::msg)?,
            audience: row.audience.0,
            audience_confirmed: row.audience_confirmed,
            scheduled_for: row.scheduled_for,
            scheduled_timezone: row.scheduled_timezone,
            sent_at: row.sent_at,
            recipient_count: row.recipient_count,
            recipient_snapshot: row.recipient_snapshot.map(|snapshot| snapshot.0),
            delivered_count: row.delivered_count,
            failed_count: row.failed_count,
            test_recipients: row.test_recipients,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    id: Uuid,
    campaign_id: Uuid,
    subscriber_id: Option<Uuid>,
    email: String,
    kind: String,
    metadata: Option<Json<EventMetadata>>,
    created_at: OffsetDateTime,
}

impl TryFrom<EventRow> for EmailEvent {
    type Error = anyhow::Error;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            campaign_id: row.campaign_id,
            subscriber_id: row.subscriber_id,
            email: row.email,
            kind: EmailEventKind::try_from(row.kind).map_err(anyhow::Error::msg)?,
            metadata: row.metadata.map(|metadata| metadata.0),
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct SuppressionRow {
    id: Uuid,
    email: String,
    reason: String,
    source: String,
    details: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<SuppressionRow> for SuppressionEntry {
    type Error = anyhow::Error;

    fn try_from(row: SuppressionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            email: row.email,
            reason: SuppressionReason::try_from(row.reason).map_err(anyhow::Error::msg)?,
            source: row.source,
            details: row.details,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct SegmentRow {
    id: Uuid,
    name: String,
    rule: Json<SegmentRule>,
    subscriber_count: i64,
    created_at: OffsetDateTime,
}

impl From<SegmentRow> for Segment {
    fn from(row: SegmentRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            rule: row.rule.0,
            subscriber_count: row.subscriber_count,
            created_at: row.created_at,
        }
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, anyhow::Error>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl Store for PgStore {
    #[tracing::instrument(skip_all, fields(campaign_id = %campaign.id))]
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, subject, preheader, content, html_content, status, audience,
                audience_confirmed, scheduled_for, scheduled_timezone, sent_at,
                recipient_count, recipient_snapshot, delivered_count, failed_count,
                test_recipients, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(campaign.id)
        .bind(&campaign.subject)
        .bind(&campaign.preheader)
        .bind(Json(&campaign.content))
        .bind(&campaign.html_content)
        .bind(campaign.status.as_ref())
        .bind(Json(&campaign.audience))
        .bind(campaign.audience_confirmed)
        .bind(campaign.scheduled_for)
        .bind(&campaign.scheduled_timezone)
        .bind(campaign.sent_at)
        .bind(campaign.recipient_count)
        .bind(campaign.recipient_snapshot.as_ref().map(Json))
        .bind(campaign.delivered_count)
        .bind(campaign.failed_count)
        .bind(&campaign.test_recipients)
        .bind(&campaign.created_by)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&self.db_pool)
        .await
        .context("Failed to insert campaign")?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, anyhow::Error> {
        let row = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await
        .context("Failed to fetch campaign")?;

        row.map(Campaign::try_from).transpose()
    }

    #[tracing::instrument(skip_all)]
    async fn list_campaigns(&self) -> Result<Vec<Campaign>, anyhow::Error> {
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY created_at DESC"
        ))
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to list campaigns")?;

        convert_all(rows)
    }

    #[tracing::instrument(skip_all, fields(campaign_id = %campaign.id, expected = expected.as_ref()))]
    async fn update_campaign(
        &self,
        campaign: &Campaign,
        expected: CampaignStatus,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                subject = $1,
                preheader = $2,
                content = $3,
                html_content = $4,
                status = $5,
                audience = $6,
                audience_confirmed = $7,
                scheduled_for = $8,
                scheduled_timezone = $9,
                updated_at = $10
            WHERE id = $11 AND status = $12
            "#,
        )
        .bind(&campaign.subject)
        .bind(&campaign.preheader)
        .bind(Json(&campaign.content))
        .bind(&campaign.html_content)
        .bind(campaign.status.as_ref())
        .bind(Json(&campaign.audience))
        .bind(campaign.audience_confirmed)
        .bind(campaign.scheduled_for)
        .bind(&campaign.scheduled_timezone)
        .bind(campaign.updated_at)
        .bind(campaign.id)
        .bind(expected.as_ref())
        .execute(&self.db_pool)
        .await
        .context("Failed to update campaign")?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_campaign(
        &self,
        id: Uuid,
        expected: CampaignStatus,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM campaigns WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(expected.as_ref())
            .execute(&self.db_pool)
            .await
            .context("Failed to delete campaign")?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn add_test_recipient(&self, id: Uuid, email: &str) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET test_recipients = array_append(test_recipients, $2)
            WHERE id = $1 AND NOT ($2 = ANY(test_recipients))
            "#,
        )
        .bind(id)
        .bind(email)
        .execute(&self.db_pool)
        .await
        .context("Failed to record test recipient")?;

        Ok(())
    }

    #[tracing::instrument(skip(self, snapshot), fields(recipients = snapshot.len()))]
    async fn start_sending(
        &self,
        id: Uuid,
        expected: CampaignStatus,
        snapshot: &[SnapshotRecipient],
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                status = $3,
                recipient_count = $4,
                recipient_snapshot = $5,
                updated_at = now()
            WHERE id = $1 AND status = $2 AND recipient_snapshot IS NULL
            "#,
        )
        .bind(id)
        .bind(expected.as_ref())
        .bind(CampaignStatus::Sending.as_ref())
        .bind(snapshot.len() as i64)
        .bind(Json(snapshot))
        .execute(&self.db_pool)
        .await
        .context("Failed to start sending campaign")?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn finish_sending(
        &self,
        id: Uuid,
        outcome: &DeliveryOutcome,
    ) -> Result<(), anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                status = $2,
                sent_at = $3,
                delivered_count = $4,
                failed_count = $5,
                updated_at = $3
            WHERE id = $1 AND status = $6
            "#,
        )
        .bind(id)
        .bind(outcome.status.as_ref())
        .bind(outcome.sent_at)
        .bind(outcome.delivered_count)
        .bind(outcome.failed_count)
        .bind(CampaignStatus::Sending.as_ref())
        .execute(&self.db_pool)
        .await
        .context("Failed to finish sending campaign")?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Campaign {id} is not sending"))
        }
    }

    #[tracing::instrument(skip(self))]
    async fn due_campaigns(&self, now: OffsetDateTime) -> Result<Vec<Uuid>, anyhow::Error> {
        sqlx::query_scalar(
            r#"
            SELECT id FROM campaigns
            WHERE status = $1 AND scheduled_for <= $2
            ORDER BY scheduled_for
            "#,
        )
        .bind(CampaignStatus::Scheduled.as_ref())
        .bind(now)
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to fetch due campaigns")
    }

    #[tracing::instrument(skip_all, fields(subscriber_id = %subscriber.id))]
    async fn insert_subscriber(&self, subscriber: &Subscriber) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO subscribers (
                id, email, subscribed, source, tags, subscribed_at, unsubscribed_at,
                last_emailed_at, last_opened_at, last_clicked_at, emails_received,
                bounce_count, last_bounce_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(subscriber.id)
        .bind(&subscriber.email)
        .bind(subscriber.subscribed)
        .bind(&subscriber.source)
        .bind(&subscriber.tags)
        .bind(subscriber.subscribed_at)
        .bind(subscriber.unsubscribed_at)
        .bind(subscriber.last_emailed_at)
        .bind(subscriber.last_opened_at)
        .bind(subscriber.last_clicked_at)
        .bind(subscriber.emails_received)
        .bind(subscriber.bounce_count)
        .bind(subscriber.last_bounce_at)
        .execute(&self.db_pool)
        .await
        .context("Failed to insert subscriber")?;

        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn list_subscribed(&self) -> Result<Vec<Subscriber>, anyhow::Error> {
        sqlx::query_as::<_, Subscriber>(
            "SELECT * FROM subscribers WHERE subscribed ORDER BY subscribed_at",
        )
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to fetch subscribed subscribers")
    }

    #[tracing::instrument(skip(self))]
    async fn find_subscriber(&self, email: &str) -> Result<Option<Subscriber>, anyhow::Error> {
        sqlx::query_as::<_, Subscriber>("SELECT * FROM subscribers WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.db_pool)
            .await
            .context("Failed to fetch subscriber")
    }

    #[tracing::instrument(skip(self))]
    async fn unsubscribe(&self, email: &str, at: OffsetDateTime) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE subscribers SET subscribed = FALSE, unsubscribed_at = $2
            WHERE email = $1 AND subscribed
            "#,
        )
        .bind(email)
        .bind(at)
        .execute(&self.db_pool)
        .await
        .context("Failed to unsubscribe subscriber")?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn record_bounce(
        &self,
        email: &str,
        at: OffsetDateTime,
    ) -> Result<Option<BounceHistory>, anyhow::Error> {
        let row: Option<(i32, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            WITH previous AS (
                SELECT id, last_bounce_at FROM subscribers
                WHERE email = $1
                FOR UPDATE
            )
            UPDATE subscribers AS s
            SET bounce_count = s.bounce_count + 1, last_bounce_at = $2
            FROM previous
            WHERE s.id = previous.id
            RETURNING s.bounce_count, previous.last_bounce_at
            "#,
        )
        .bind(email)
        .bind(at)
        .fetch_optional(&self.db_pool)
        .await
        .context("Failed to record bounce")?;

        Ok(row.map(|(bounce_count, previous_bounce_at)| BounceHistory {
            bounce_count,
            previous_bounce_at,
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn suppressed_emails(&self) -> Result<HashSet<String>, anyhow::Error> {
        let emails: Vec<String> = sqlx::query_scalar("SELECT email FROM suppressions")
            .fetch_all(&self.db_pool)
            .await
            .context("Failed to fetch suppressed emails")?;

        Ok(emails.into_iter().collect())
    }

    #[tracing::instrument(skip_all, fields(reason = entry.reason.as_ref()))]
    async fn insert_suppression(&self, entry: &SuppressionEntry) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO suppressions (id, email, reason, source, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(&entry.email)
        .bind(entry.reason.as_ref())
        .bind(&entry.source)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.db_pool)
        .await
        .context("Failed to insert suppression")?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip_all)]
    async fn list_suppressions(&self) -> Result<Vec<SuppressionEntry>, anyhow::Error> {
        let rows = sqlx::query_as::<_, SuppressionRow>(
            r#"
            SELECT id, email, reason, source, details, created_at
            FROM suppressions
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to list suppressions")?;

        convert_all(rows)
    }

    #[tracing::instrument(
        skip_all,
        fields(campaign_id = %event.campaign_id, kind = event.kind.as_ref())
    )]
    async fn record_event(&self, event: &EmailEvent) -> Result<(), anyhow::Error> {
        let mut transaction = self
            .db_pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        insert_event(&mut transaction, event).await?;
        update_engagement(&mut transaction, event).await?;

        transaction
            .commit()
            .await
            .context("Failed to commit transaction")?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn list_events(
        &self,
        campaign_id: Uuid,
        kinds: &[EmailEventKind],
    ) -> Result<Vec<EmailEvent>, anyhow::Error> {
        let kinds: Vec<String> = kinds.iter().map(|k| k.as_ref().to_owned()).collect();
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM email_events
            WHERE campaign_id = $1 AND (cardinality($2::text[]) = 0 OR kind = ANY($2))
            ORDER BY created_at
            "#
        ))
        .bind(campaign_id)
        .bind(kinds)
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to list email events")?;

        convert_all(rows)
    }

    #[tracing::instrument(skip(self))]
    async fn recent_events(
        &self,
        campaign_id: Uuid,
        limit: usize,
    ) -> Result<Vec<EmailEvent>, anyhow::Error> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM email_events
            WHERE campaign_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(campaign_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to list recent email events")?;

        convert_all(rows)
    }

    #[tracing::instrument(skip_all, fields(segment_id = %segment.id))]
    async fn insert_segment(&self, segment: &Segment) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO segments (id, name, rule, subscriber_count, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(segment.id)
        .bind(&segment.name)
        .bind(Json(&segment.rule))
        .bind(segment.subscriber_count)
        .bind(segment.created_at)
        .execute(&self.db_pool)
        .await
        .context("Failed to insert segment")?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_segment(&self, id: Uuid) -> Result<Option<Segment>, anyhow::Error> {
        let row = sqlx::query_as::<_, SegmentRow>(
            "SELECT id, name, rule, subscriber_count, created_at FROM segments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await
        .context("Failed to fetch segment")?;

        Ok(row.map(Segment::from))
    }

    #[tracing::instrument(skip_all)]
    async fn list_segments(&self) -> Result<Vec<Segment>, anyhow::Error> {
        let rows = sqlx::query_as::<_, SegmentRow>(
            "SELECT id, name, rule, subscriber_count, created_at FROM segments ORDER BY created_at",
        )
        .fetch_all(&self.db_pool)
        .await
        .context("Failed to list segments")?;

        Ok(rows.into_iter().map(Segment::from).collect())
    }

    #[tracing::instrument(skip(self))]
    async fn update_segment_count(&self, id: Uuid, count: i64) -> Result<(), anyhow::Error> {
        sqlx::query("UPDATE segments SET subscriber_count = $2 WHERE id = $1")
            .bind(id)
            .bind(count)
            .execute(&self.db_pool)
            .await
            .context("Failed to update segment count")?;

        Ok(())
    }
}

#[tracing::instrument(skip_all)]
async fn insert_event(
    transaction: &mut Transaction<'_, Postgres>,
    event: &EmailEvent,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO email_events (id, campaign_id, subscriber_id, email, kind, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(event.id)
    .bind(event.campaign_id)
    .bind(event.subscriber_id)
    .bind(&event.email)
    .bind(event.kind.as_ref())
    .bind(event.metadata.as_ref().map(Json))
    .bind(event.created_at)
    .execute(&mut **transaction)
    .await
    .context("Failed to insert email event")?;

    Ok(())
}

#[tracing::instrument(skip_all)]
async fn update_engagement(
    transaction: &mut Transaction<'_, Postgres>,
    event: &EmailEvent,
) -> Result<(), anyhow::Error> {
    let query = match event.kind {
        EmailEventKind::Delivered => {
            r#"
            UPDATE subscribers
            SET emails_received = emails_received + 1, last_emailed_at = $2
            WHERE email = $1
            "#
        }
        EmailEventKind::Opened => "UPDATE subscribers SET last_opened_at = $2 WHERE email = $1",
        EmailEventKind::Clicked => "UPDATE subscribers SET last_clicked_at = $2 WHERE email = $1",
        _ => return Ok(()),
    };

    sqlx::query(query)
        .bind(&event.email)
        .bind(event.created_at)
        .execute(&mut **transaction)
        .await
        .context("Failed to update subscriber engagement")?;

    Ok(())
}
