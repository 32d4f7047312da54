use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventKind {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
}

impl AsRef<str> for EmailEventKind {
    fn as_ref(&self) -> &'static str {
        match self {
            EmailEventKind::Delivered => "delivered",
            EmailEventKind::Opened => "opened",
            EmailEventKind::Clicked => "clicked",
            EmailEventKind::Bounced => "bounced",
            EmailEventKind::Complained => "complained",
            EmailEventKind::Unsubscribed => "unsubscribed",
        }
    }
}

impl TryFrom<String> for EmailEventKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_ref() {
            "delivered" => Ok(EmailEventKind::Delivered),
            "opened" => Ok(EmailEventKind::Opened),
            "clicked" => Ok(EmailEventKind::Clicked),
            "bounced" => Ok(EmailEventKind::Bounced),
            "complained" => Ok(EmailEventKind::Complained),
            "unsubscribed" => Ok(EmailEventKind::Unsubscribed),
            other => Err(format!("`{other}` is not a valid variant of EmailEventKind")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceKind {
    Hard,
    Soft,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounce_kind: Option<BounceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Append-only record of something that happened to one recipient of one
/// campaign.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EmailEvent {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub subscriber_id: Option<Uuid>,
    pub email: String,
    pub kind: EmailEventKind,
    pub metadata: Option<EventMetadata>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl EmailEvent {
    pub fn new(
        campaign_id: Uuid,
        subscriber_id: Option<Uuid>,
        email: impl Into<String>,
        kind: EmailEventKind,
        metadata: Option<EventMetadata>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            subscriber_id,
            email: email.into(),
            kind,
            metadata,
            created_at,
        }
    }
}
