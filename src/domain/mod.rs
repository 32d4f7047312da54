mod campaign;
mod campaign_status;
mod email_event;
mod segment;
mod subscriber;
mod subscriber_email;
mod suppression;

pub use campaign::{
    Audience, Campaign, CampaignChanges, NewCampaign, SnapshotRecipient, UNSUBSCRIBE_PLACEHOLDER,
};
pub use campaign_status::CampaignStatus;
pub use email_event::{BounceKind, EmailEvent, EmailEventKind, EventMetadata};
pub use segment::{filter as filter_segment, NewSegment, Segment, SegmentRule};
pub use subscriber::{BounceHistory, Subscriber};
pub use subscriber_email::{normalize as normalize_email, SubscriberEmail};
pub use suppression::{SuppressionEntry, SuppressionReason};
