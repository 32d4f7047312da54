use super::{CampaignStatus, SegmentRule};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Placeholder the rendered body uses where the unsubscribe URL belongs.
pub const UNSUBSCRIBE_PLACEHOLDER: &str = "{{unsubscribe_url}}";

#[derive(Clone, Debug, Serialize)]
pub struct Campaign {
    pub id: Uuid,
    pub subject: String,
    pub preheader: Option<String>,
    pub content: Value,
    pub html_content: String,
    pub status: CampaignStatus,
    pub audience: Audience,
    pub audience_confirmed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scheduled_for: Option<OffsetDateTime>,
    pub scheduled_timezone: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub sent_at: Option<OffsetDateTime>,
    pub recipient_count: i64,
    #[serde(skip_serializing)]
    pub recipient_snapshot: Option<Vec<SnapshotRecipient>>,
    pub delivered_count: i64,
    pub failed_count: i64,
    pub test_recipients: Vec<String>,
    pub created_by: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Campaign {
    pub fn draft(new: NewCampaign) -> Self {
        let now = OffsetDateTime::now_utc();

        Self {
            id: Uuid::new_v4(),
            subject: new.subject,
            preheader: new.preheader.filter(|p| !p.trim().is_empty()),
            content: new.content,
            html_content: new.html_content,
            status: CampaignStatus::Draft,
            audience_confirmed: new.audience.is_some(),
            audience: new.audience.unwrap_or_default(),
            scheduled_for: None,
            scheduled_timezone: None,
            sent_at: None,
            recipient_count: 0,
            recipient_snapshot: None,
            delivered_count: 0,
            failed_count: 0,
            test_recipients: Vec::new(),
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies an edit and moves a scheduled campaign back to draft, clearing
    /// both schedule fields together.
    pub fn apply(&mut self, changes: CampaignChanges) {
        if let Some(subject) = changes.subject {
            self.subject = subject;
        }
        if let Some(preheader) = changes.preheader {
            self.preheader = Some(preheader).filter(|p| !p.trim().is_empty());
        }
        if let Some(content) = changes.content {
            self.content = content;
        }
        if let Some(html_content) = changes.html_content {
            self.html_content = html_content;
        }
        if let Some(audience) = changes.audience {
            self.audience = audience;
            self.audience_confirmed = true;
        }

        let status = self.status.after_edit();
        if status != self.status {
            self.status = status;
            self.clear_schedule();
        }
        self.updated_at = OffsetDateTime::now_utc();
    }

    pub fn clear_schedule(&mut self) {
        self.scheduled_for = None;
        self.scheduled_timezone = None;
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NewCampaign {
    #[serde(default)]
    pub subject: String,
    pub preheader: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub html_content: String,
    pub audience: Option<Audience>,
    pub created_by: Option<String>,
}

/// Partial edit; absent fields stay untouched, an empty preheader clears it.
#[derive(Debug, Default, Deserialize)]
pub struct CampaignChanges {
    pub subject: Option<String>,
    pub preheader: Option<String>,
    pub content: Option<Value>,
    pub html_content: Option<String>,
    pub audience: Option<Audience>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Audience {
    #[default]
    All,
    Segment {
        segment_id: Uuid,
    },
    Rules {
        rule: SegmentRule,
    },
}

/// One frozen recipient of a send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecipient {
    pub email: String,
    pub subscriber_id: Uuid,
}
