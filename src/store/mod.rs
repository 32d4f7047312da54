//! Persistence seam of the engine.
//!
//! Every method that pairs an event with a derived update (delivery counters,
//! engagement timestamps) runs as one unit in the backing store, so a crash can
//! not keep one half and lose the other.

mod memory;
mod postgres;

use crate::domain::{
    BounceHistory, Campaign, CampaignStatus, EmailEvent, EmailEventKind, Segment,
    SnapshotRecipient, Subscriber, SuppressionEntry,
};
use axum::async_trait;
use std::collections::HashSet;
use time::OffsetDateTime;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Terminal numbers of a delivery run, written in one go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub status: CampaignStatus,
    pub sent_at: OffsetDateTime,
    pub delivered_count: i64,
    pub failed_count: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), anyhow::Error>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, anyhow::Error>;

    async fn list_campaigns(&self) -> Result<Vec<Campaign>, anyhow::Error>;

    /// Writes the editable fields, status and schedule of `campaign` if the
    /// stored status still equals `expected`. Never touches the snapshot or
    /// delivery counters. Returns `false` when the guard did not hold.
    async fn update_campaign(
        &self,
        campaign: &Campaign,
        expected: CampaignStatus,
    ) -> Result<bool, anyhow::Error>;

    async fn delete_campaign(
        &self,
        id: Uuid,
        expected: CampaignStatus,
    ) -> Result<bool, anyhow::Error>;

    /// Adds `email` to the campaign's test recipients unless already listed.
    async fn add_test_recipient(&self, id: Uuid, email: &str) -> Result<(), anyhow::Error>;

    /// Moves the campaign from `expected` to `sending` and freezes the
    /// snapshot. Fails the guard if a snapshot already exists.
    async fn start_sending(
        &self,
        id: Uuid,
        expected: CampaignStatus,
        snapshot: &[SnapshotRecipient],
    ) -> Result<bool, anyhow::Error>;

    async fn finish_sending(
        &self,
        id: Uuid,
        outcome: &DeliveryOutcome,
    ) -> Result<(), anyhow::Error>;

    /// Scheduled campaigns whose time is at or before `now`.
    async fn due_campaigns(&self, now: OffsetDateTime) -> Result<Vec<Uuid>, anyhow::Error>;

    async fn insert_subscriber(&self, subscriber: &Subscriber) -> Result<(), anyhow::Error>;

    async fn list_subscribed(&self) -> Result<Vec<Subscriber>, anyhow::Error>;

    async fn find_subscriber(&self, email: &str) -> Result<Option<Subscriber>, anyhow::Error>;

    /// Flips a subscribed address to unsubscribed. Returns `false` when there
    /// was nothing to change, leaving the first `unsubscribed_at` intact.
    async fn unsubscribe(&self, email: &str, at: OffsetDateTime) -> Result<bool, anyhow::Error>;

    /// Increments the bounce counter and stamps `last_bounce_at`. `None` when
    /// no subscriber owns the address.
    async fn record_bounce(
        &self,
        email: &str,
        at: OffsetDateTime,
    ) -> Result<Option<BounceHistory>, anyhow::Error>;

    async fn suppressed_emails(&self) -> Result<HashSet<String>, anyhow::Error>;

    /// Idempotent insert keyed by email. Returns `false` if already present.
    async fn insert_suppression(&self, entry: &SuppressionEntry) -> Result<bool, anyhow::Error>;

    async fn list_suppressions(&self) -> Result<Vec<SuppressionEntry>, anyhow::Error>;

    /// Appends `event` and applies its subscriber side effect: delivered bumps
    /// `emails_received`/`last_emailed_at`, opened and clicked stamp
    /// `last_opened_at`/`last_clicked_at`.
    async fn record_event(&self, event: &EmailEvent) -> Result<(), anyhow::Error>;

    /// Events of one campaign in chronological order. Empty `kinds` means all.
    async fn list_events(
        &self,
        campaign_id: Uuid,
        kinds: &[EmailEventKind],
    ) -> Result<Vec<EmailEvent>, anyhow::Error>;

    /// Newest first.
    async fn recent_events(
        &self,
        campaign_id: Uuid,
        limit: usize,
    ) -> Result<Vec<EmailEvent>, anyhow::Error>;

    async fn insert_segment(&self, segment: &Segment) -> Result<(), anyhow::Error>;

    async fn get_segment(&self, id: Uuid) -> Result<Option<Segment>, anyhow::Error>;

    async fn list_segments(&self) -> Result<Vec<Segment>, anyhow::Error>;

    async fn update_segment_count(&self, id: Uuid, count: i64) -> Result<(), anyhow::Error>;
}
