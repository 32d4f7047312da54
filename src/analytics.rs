//! On-demand campaign reports computed from the event log.

use crate::domain::{Campaign, EmailEvent, EmailEventKind};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

pub const TIMELINE_HOURS: i64 = 72;
pub const DEFAULT_RECENT_EVENTS: usize = 50;
pub const MAX_RECENT_EVENTS: usize = 500;

#[derive(Debug, Serialize)]
pub struct CampaignAnalytics {
    pub campaign_id: Uuid,
    pub recipient_count: i64,
    pub summary: Summary,
    pub links: Vec<LinkClicks>,
    pub timeline: Vec<TimelineBucket>,
    pub recent_events: Vec<EmailEvent>,
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct Summary {
    pub delivered: usize,
    pub opened: usize,
    pub clicked: usize,
    pub bounced: usize,
    pub complained: usize,
    pub unsubscribed: usize,
    pub open_rate: f64,
    pub click_rate: f64,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct LinkClicks {
    pub url: String,
    pub total_clicks: usize,
    pub unique_clicks: usize,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct TimelineBucket {
    /// Hours elapsed since `sent_at`, starting at 0.
    pub hour: i64,
    pub opens: usize,
    pub clicks: usize,
}

pub fn summarize(
    campaign: &Campaign,
    events: &[EmailEvent],
    recent_events: Vec<EmailEvent>,
) -> CampaignAnalytics {
    CampaignAnalytics {
        campaign_id: campaign.id,
        recipient_count: campaign.recipient_count,
        summary: summary(events, campaign.recipient_count),
        links: link_clicks(events),
        timeline: campaign
            .sent_at
            .map(|sent_at| timeline(events, sent_at))
            .unwrap_or_default(),
        recent_events,
    }
}

pub fn summary(events: &[EmailEvent], recipient_count: i64) -> Summary {
    let distinct = |kind: EmailEventKind| {
        events
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.email.as_str())
            .collect::<HashSet<_>>()
            .len()
    };

    let opened = distinct(EmailEventKind::Opened);
    let clicked = distinct(EmailEventKind::Clicked);

    Summary {
        delivered: events
            .iter()
            .filter(|e| e.kind == EmailEventKind::Delivered)
            .count(),
        opened,
        clicked,
        bounced: distinct(EmailEventKind::Bounced),
        complained: distinct(EmailEventKind::Complained),
        unsubscribed: distinct(EmailEventKind::Unsubscribed),
        open_rate: rate(opened, recipient_count),
        click_rate: rate(clicked, recipient_count),
    }
}

/// Percentage with one decimal; zero when nobody was sent to.
pub fn rate(count: usize, recipient_count: i64) -> f64 {
    if recipient_count <= 0 {
        return 0.0;
    }
    let percent = count as f64 / recipient_count as f64 * 100.0;
    (percent * 10.0).round() / 10.0
}

pub fn link_clicks(events: &[EmailEvent]) -> Vec<LinkClicks> {
    let mut by_url: HashMap<&str, (usize, HashSet<&str>)> = HashMap::new();

    for event in events.iter().filter(|e| e.kind == EmailEventKind::Clicked) {
        let Some(url) = event.metadata.as_ref().and_then(|m| m.url.as_deref()) else {
            continue;
        };
        let (total, recipients) = by_url.entry(url).or_default();
        *total += 1;
        recipients.insert(event.email.as_str());
    }

    let mut links: Vec<LinkClicks> = by_url
        .into_iter()
        .map(|(url, (total_clicks, recipients))| LinkClicks {
            url: url.to_owned(),
            total_clicks,
            unique_clicks: recipients.len(),
        })
        .collect();
    links.sort_by(|a, b| {
        b.total_clicks
            .cmp(&a.total_clicks)
            .then_with(|| a.url.cmp(&b.url))
    });
    links
}

pub fn timeline(events: &[EmailEvent], sent_at: OffsetDateTime) -> Vec<TimelineBucket> {
    let mut buckets: BTreeMap<i64, (usize, usize)> = BTreeMap::new();
    let window_end = sent_at + Duration::hours(TIMELINE_HOURS);

    for event in events {
        if event.created_at < sent_at || event.created_at >= window_end {
            continue;
        }
        let hour = (event.created_at - sent_at).whole_hours();
        match event.kind {
            EmailEventKind::Opened => buckets.entry(hour).or_default().0 += 1,
            EmailEventKind::Clicked => buckets.entry(hour).or_default().1 += 1,
            _ => {}
        }
    }

    buckets
        .into_iter()
        .map(|(hour, (opens, clicks))| TimelineBucket {
            hour,
            opens,
            clicks,
        })
        .collect()
}
