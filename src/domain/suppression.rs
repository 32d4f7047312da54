use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    HardBounce,
    Complaint,
    Manual,
    ConsecutiveSoftBounce,
}

impl AsRef<str> for SuppressionReason {
    fn as_ref(&self) -> &'static str {
        match self {
            SuppressionReason::HardBounce => "hard_bounce",
            SuppressionReason::Complaint => "complaint",
            SuppressionReason::Manual => "manual",
            SuppressionReason::ConsecutiveSoftBounce => "consecutive_soft_bounce",
        }
    }
}

impl TryFrom<String> for SuppressionReason {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_ref() {
            "hard_bounce" => Ok(SuppressionReason::HardBounce),
            "complaint" => Ok(SuppressionReason::Complaint),
            "manual" => Ok(SuppressionReason::Manual),
            "consecutive_soft_bounce" => Ok(SuppressionReason::ConsecutiveSoftBounce),
            other => Err(format!(
                "`{other}` is not a valid variant of SuppressionReason"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SuppressionEntry {
    pub id: Uuid,
    pub email: String,
    pub reason: SuppressionReason,
    pub source: String,
    pub details: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SuppressionEntry {
    pub fn new(
        email: impl Into<String>,
        reason: SuppressionReason,
        source: impl Into<String>,
        details: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            reason,
            source: source.into(),
            details,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}
