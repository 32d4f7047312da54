use super::{DeliveryOutcome, Store};
use crate::domain::{
    BounceHistory, Campaign, CampaignStatus, EmailEvent, EmailEventKind, Segment,
    SnapshotRecipient, Subscriber, SuppressionEntry,
};
use anyhow::anyhow;
use axum::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};
use time::OffsetDateTime;
use uuid::Uuid;

/// Process-local backend. One lock guards all tables, so each method is atomic
/// exactly like its transactional Postgres counterpart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    campaigns: HashMap<Uuid, Campaign>,
    subscribers: HashMap<String, Subscriber>,
    suppressions: HashMap<String, SuppressionEntry>,
    events: Vec<EmailEvent>,
    segments: HashMap<Uuid, Segment>,
}

impl MemoryStore {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>, anyhow::Error> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("Memory store lock is poisoned"))
    }
}

fn by_creation<T>(items: impl Iterator<Item = T>, key: impl Fn(&T) -> OffsetDateTime) -> Vec<T> {
    let mut items: Vec<T> = items.collect();
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), anyhow::Error> {
        let mut tables = self.tables()?;
        if tables.campaigns.contains_key(&campaign.id) {
            return Err(anyhow!("Campaign {} already exists", campaign.id));
        }
        tables.campaigns.insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, anyhow::Error> {
        Ok(self.tables()?.campaigns.get(&id).cloned())
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>, anyhow::Error> {
        let tables = self.tables()?;
        let mut campaigns = by_creation(tables.campaigns.values().cloned(), |c| c.created_at);
        campaigns.reverse();
        Ok(campaigns)
    }

    async fn update_campaign(
        &self,
        campaign: &Campaign,
        expected: CampaignStatus,
    ) -> Result<bool, anyhow::Error> {
        let mut tables = self.tables()?;
        let Some(stored) = tables.campaigns.get_mut(&campaign.id) else {
            return Ok(false);
        };
        if stored.status != expected {
            return Ok(false);
        }

        stored.subject.clone_from(&campaign.subject);
        stored.preheader.clone_from(&campaign.preheader);
        stored.content.clone_from(&campaign.content);
        stored.html_content.clone_from(&campaign.html_content);
        stored.status = campaign.status;
        stored.audience.clone_from(&campaign.audience);
        stored.audience_confirmed = campaign.audience_confirmed;
        stored.scheduled_for = campaign.scheduled_for;
        stored.scheduled_timezone.clone_from(&campaign.scheduled_timezone);
        stored.updated_at = campaign.updated_at;
        Ok(true)
    }

    async fn delete_campaign(
        &self,
        id: Uuid,
        expected: CampaignStatus,
    ) -> Result<bool, anyhow::Error> {
        let mut tables = self.tables()?;
        match tables.campaigns.get(&id) {
            Some(campaign) if campaign.status == expected => {
                tables.campaigns.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_test_recipient(&self, id: Uuid, email: &str) -> Result<(), anyhow::Error> {
        let mut tables = self.tables()?;
        let campaign = tables
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Campaign {id} does not exist"))?;
        if !campaign.test_recipients.iter().any(|e| e == email) {
            campaign.test_recipients.push(email.to_owned());
        }
        Ok(())
    }

    async fn start_sending(
        &self,
        id: Uuid,
        expected: CampaignStatus,
        snapshot: &[SnapshotRecipient],
    ) -> Result<bool, anyhow::Error> {
        let mut tables = self.tables()?;
        let Some(campaign) = tables.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        if campaign.status != expected || campaign.recipient_snapshot.is_some() {
            return Ok(false);
        }

        campaign.status = CampaignStatus::Sending;
        campaign.recipient_count = snapshot.len() as i64;
        campaign.recipient_snapshot = Some(snapshot.to_vec());
        campaign.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn finish_sending(
        &self,
        id: Uuid,
        outcome: &DeliveryOutcome,
    ) -> Result<(), anyhow::Error> {
        let mut tables = self.tables()?;
        let campaign = tables
            .campaigns
            .get_mut(&id)
            .filter(|c| c.status == CampaignStatus::Sending)
            .ok_or_else(|| anyhow!("Campaign {id} is not sending"))?;

        campaign.status = outcome.status;
        campaign.sent_at = Some(outcome.sent_at);
        campaign.delivered_count = outcome.delivered_count;
        campaign.failed_count = outcome.failed_count;
        campaign.updated_at = outcome.sent_at;
        Ok(())
    }

    async fn due_campaigns(&self, now: OffsetDateTime) -> Result<Vec<Uuid>, anyhow::Error> {
        let tables = self.tables()?;
        let due = tables.campaigns.values().filter(|c| {
            c.status == CampaignStatus::Scheduled && c.scheduled_for.is_some_and(|at| at <= now)
        });
        Ok(by_creation(due, |c| c.scheduled_for.unwrap_or(c.created_at))
            .into_iter()
            .map(|c| c.id)
            .collect())
    }

    async fn insert_subscriber(&self, subscriber: &Subscriber) -> Result<(), anyhow::Error> {
        let mut tables = self.tables()?;
        if tables.subscribers.contains_key(&subscriber.email) {
            return Err(anyhow!("Subscriber {} already exists", subscriber.email));
        }
        tables
            .subscribers
            .insert(subscriber.email.clone(), subscriber.clone());
        Ok(())
    }

    async fn list_subscribed(&self) -> Result<Vec<Subscriber>, anyhow::Error> {
        let tables = self.tables()?;
        let subscribed = tables.subscribers.values().filter(|s| s.subscribed).cloned();
        Ok(by_creation(subscribed, |s| s.subscribed_at))
    }

    async fn find_subscriber(&self, email: &str) -> Result<Option<Subscriber>, anyhow::Error> {
        Ok(self.tables()?.subscribers.get(email).cloned())
    }

    async fn unsubscribe(&self, email: &str, at: OffsetDateTime) -> Result<bool, anyhow::Error> {
        let mut tables = self.tables()?;
        match tables.subscribers.get_mut(email) {
            Some(subscriber) if subscriber.subscribed => {
                subscriber.subscribed = false;
                subscriber.unsubscribed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_bounce(
        &self,
        email: &str,
        at: OffsetDateTime,
    ) -> Result<Option<BounceHistory>, anyhow::Error> {
        let mut tables = self.tables()?;
        Ok(tables.subscribers.get_mut(email).map(|subscriber| {
            let previous_bounce_at = subscriber.last_bounce_at.replace(at);
            subscriber.bounce_count += 1;
            BounceHistory {
                bounce_count: subscriber.bounce_count,
                previous_bounce_at,
            }
        }))
    }

    async fn suppressed_emails(&self) -> Result<HashSet<String>, anyhow::Error> {
        Ok(self.tables()?.suppressions.keys().cloned().collect())
    }

    async fn insert_suppression(&self, entry: &SuppressionEntry) -> Result<bool, anyhow::Error> {
        let mut tables = self.tables()?;
        if tables.suppressions.contains_key(&entry.email) {
            return Ok(false);
        }
        tables.suppressions.insert(entry.email.clone(), entry.clone());
        Ok(true)
    }

    async fn list_suppressions(&self) -> Result<Vec<SuppressionEntry>, anyhow::Error> {
        let tables = self.tables()?;
        Ok(by_creation(tables.suppressions.values().cloned(), |s| {
            s.created_at
        }))
    }

    async fn record_event(&self, event: &EmailEvent) -> Result<(), anyhow::Error> {
        let mut tables = self.tables()?;
        if let Some(subscriber) = tables.subscribers.get_mut(&event.email) {
            match event.kind {
                EmailEventKind::Delivered => {
                    subscriber.emails_received += 1;
                    subscriber.last_emailed_at = Some(event.created_at);
                }
                EmailEventKind::Opened => subscriber.last_opened_at = Some(event.created_at),
                EmailEventKind::Clicked => subscriber.last_clicked_at = Some(event.created_at),
                _ => {}
            }
        }
        tables.events.push(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        campaign_id: Uuid,
        kinds: &[EmailEventKind],
    ) -> Result<Vec<EmailEvent>, anyhow::Error> {
        let tables = self.tables()?;
        let events = tables
            .events
            .iter()
            .filter(|e| e.campaign_id == campaign_id)
            .filter(|e| kinds.is_empty() || kinds.contains(&e.kind))
            .cloned();
        Ok(by_creation(events, |e| e.created_at))
    }

    async fn recent_events(
        &self,
        campaign_id: Uuid,
        limit: usize,
    ) -> Result<Vec<EmailEvent>, anyhow::Error> {
        let mut events = self.list_events(campaign_id, &[]).await?;
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    async fn insert_segment(&self, segment: &Segment) -> Result<(), anyhow::Error> {
        self.tables()?.segments.insert(segment.id, segment.clone());
        Ok(())
    }

    async fn get_segment(&self, id: Uuid) -> Result<Option<Segment>, anyhow::Error> {
        Ok(self.tables()?.segments.get(&id).cloned())
    }

    async fn list_segments(&self) -> Result<Vec<Segment>, anyhow::Error> {
        let tables = self.tables()?;
        Ok(by_creation(tables.segments.values().cloned(), |s| {
            s.created_at
        }))
    }

    async fn update_segment_count(&self, id: Uuid, count: i64) -> Result<(), anyhow::Error> {
        if let Some(segment) = self.tables()?.segments.get_mut(&id) {
            segment.subscriber_count = count;
        }
        Ok(())
    }
}
