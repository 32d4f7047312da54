use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Failed,
}

impl CampaignStatus {
    /// Content, audience and schedule can only change before sending starts.
    pub fn is_editable(self) -> bool {
        matches!(self, CampaignStatus::Draft | CampaignStatus::Scheduled)
    }

    pub fn can_schedule(self) -> bool {
        self == CampaignStatus::Draft
    }

    pub fn can_cancel_schedule(self) -> bool {
        self == CampaignStatus::Scheduled
    }

    pub fn can_send(self) -> bool {
        matches!(self, CampaignStatus::Draft | CampaignStatus::Scheduled)
    }

    pub fn can_delete(self) -> bool {
        self.is_editable()
    }

    /// Status a campaign lands in once an edit has been accepted.
    pub fn after_edit(self) -> CampaignStatus {
        match self {
            CampaignStatus::Scheduled => CampaignStatus::Draft,
            other => other,
        }
    }

    /// Terminal status of a finished delivery run.
    pub fn after_delivery(delivered_count: i64) -> CampaignStatus {
        if delivered_count == 0 {
            CampaignStatus::Failed
        } else {
            CampaignStatus::Sent
        }
    }
}

impl AsRef<str> for CampaignStatus {
    fn as_ref(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Failed => "failed",
        }
    }
}

impl TryFrom<String> for CampaignStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_ref() {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "sent" => Ok(CampaignStatus::Sent),
            "failed" => Ok(CampaignStatus::Failed),
            other => Err(format!("`{other}` is not a valid variant of CampaignStatus")),
        }
    }
}
