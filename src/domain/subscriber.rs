use super::SubscriberEmail;
use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Debug, FromRow, Serialize)]
pub struct Subscriber {
    pub id: Uuid,
    pub email: String,
    pub subscribed: bool,
    pub source: Option<String>,
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub subscribed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub unsubscribed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_emailed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_opened_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_clicked_at: Option<OffsetDateTime>,
    pub emails_received: i64,
    pub bounce_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_bounce_at: Option<OffsetDateTime>,
}

impl Subscriber {
    /// A freshly opted-in subscriber with no engagement history.
    pub fn new(email: SubscriberEmail, source: Option<String>, tags: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.as_ref().to_owned(),
            subscribed: true,
            source,
            tags,
            subscribed_at: OffsetDateTime::now_utc(),
            unsubscribed_at: None,
            last_emailed_at: None,
            last_opened_at: None,
            last_clicked_at: None,
            emails_received: 0,
            bounce_count: 0,
            last_bounce_at: None,
        }
    }
}

/// Bounce counters as they stand right after a bounce has been recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BounceHistory {
    pub bounce_count: i32,
    pub previous_bounce_at: Option<OffsetDateTime>,
}
