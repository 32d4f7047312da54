use crate::helpers::{campaign_body, TestApp};
use claims::{assert_err, assert_none, assert_ok, assert_some, assert_some_eq};
use mailcast::{
    domain::{CampaignStatus, EmailEventKind, SuppressionEntry, SuppressionReason},
    store::{DeliveryOutcome, Store},
};
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};
use wiremock::{
    matchers::{body_partial_json, path},
    Mock, ResponseTemplate,
};

async fn suppressions(app: &TestApp) -> Vec<Value> {
    app.get("/admin/suppressions").await.json().await.unwrap()
}

#[tokio::test]
async fn sends_are_counted_from_the_event_log() {
    // given
    let app = TestApp::spawn_on_postgres().await;
    Mock::given(path("/email"))
        .and(body_partial_json(json!({ "To": "bob@example.com" })))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .mount(&app.email_server)
        .await;
    app.accept_all_email().await;
    app.add_subscriber("ann@example.com").await;
    app.add_subscriber("bob@example.com").await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let response = app.send_campaign(id).await;
    let campaign = app.wait_for_delivery(id).await;

    // then
    assert_eq!(response.status().as_u16(), 202);
    assert_eq!(campaign["status"], "sent");
    assert_eq!(campaign["recipient_count"], 2);
    assert_eq!(campaign["delivered_count"], 1);
    assert_eq!(campaign["failed_count"], 1);

    let delivered = app
        .store
        .list_events(id, &[EmailEventKind::Delivered])
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].email, "ann@example.com");

    let ann = app.store.find_subscriber("ann@example.com").await.unwrap().unwrap();
    assert_eq!(ann.emails_received, 1);
    assert_some!(ann.last_emailed_at);
    let bob = app.store.find_subscriber("bob@example.com").await.unwrap().unwrap();
    assert_eq!(bob.emails_received, 0);
    assert_none!(bob.last_emailed_at);
}

#[tokio::test]
async fn the_recipient_snapshot_is_frozen_once_sending_starts() {
    // given
    let app = TestApp::spawn_on_postgres().await;
    app.accept_all_email().await;
    let ann_id = app.add_subscriber("ann@example.com").await;
    let id = app.create_campaign(&campaign_body()).await;
    app.send_campaign(id).await;
    app.wait_for_delivery(id).await;

    // when
    app.add_subscriber("late@example.com").await;
    let restarted = app
        .store
        .start_sending(id, CampaignStatus::Sent, &[])
        .await
        .unwrap();
    let resent = app.send_campaign(id).await;

    // then
    assert!(!restarted);
    assert_eq!(resent.status().as_u16(), 409);
    let campaign = app.store.get_campaign(id).await.unwrap().unwrap();
    let snapshot = campaign.recipient_snapshot.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].email, "ann@example.com");
    assert_eq!(snapshot[0].subscriber_id, ann_id);
    assert_eq!(campaign.recipient_count, 1);
}

#[tokio::test]
async fn only_a_sending_campaign_can_be_finished() {
    // given
    let app = TestApp::spawn_on_postgres().await;
    let id = app.create_campaign(&campaign_body()).await;
    let outcome = DeliveryOutcome {
        status: CampaignStatus::Sent,
        sent_at: OffsetDateTime::now_utc(),
        delivered_count: 1,
        failed_count: 0,
    };

    // when
    let result = app.store.finish_sending(id, &outcome).await;

    // then
    assert_err!(result);
    let campaign = app.store.get_campaign(id).await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Draft);
    assert_none!(campaign.sent_at);
}

#[tokio::test]
async fn event_listing_filters_by_kind() {
    // given
    let app = TestApp::spawn_on_postgres().await;
    app.accept_all_email().await;
    app.add_subscriber("ann@example.com").await;
    let id = app.create_campaign(&campaign_body()).await;
    app.send_campaign(id).await;
    app.wait_for_delivery(id).await;
    let email = app.sent_emails().await.remove(0);
    app.get_url(&app.local_link(&email.link_with_path_prefix("/track/open/")))
        .await;
    app.get_url(&app.local_link(&email.link_with_path_prefix("/track/click/")))
        .await;

    // when
    let everything = app.store.list_events(id, &[]).await.unwrap();
    let engagement = app
        .store
        .list_events(id, &[EmailEventKind::Opened, EmailEventKind::Clicked])
        .await
        .unwrap();
    let complaints = app
        .store
        .list_events(id, &[EmailEventKind::Complained])
        .await
        .unwrap();

    // then
    assert_eq!(everything.len(), 3);
    assert_eq!(engagement.len(), 2);
    assert!(engagement
        .iter()
        .all(|e| matches!(e.kind, EmailEventKind::Opened | EmailEventKind::Clicked)));
    assert!(complaints.is_empty());

    let ann = app.store.find_subscriber("ann@example.com").await.unwrap().unwrap();
    assert_some!(ann.last_opened_at);
    assert_some!(ann.last_clicked_at);
}

#[tokio::test]
async fn soft_bounces_escalate_on_postgres() {
    // given
    let app = TestApp::spawn_on_postgres().await;
    app.add_subscriber("ann@example.com").await;
    let bounce = json!({ "type": "bounce", "email": "ann@example.com", "bounce_type": "soft" });

    // when
    app.post_webhook(&json!([bounce, bounce]).to_string(), None).await;
    let before_third = suppressions(&app).await;
    app.post_webhook(&bounce.to_string(), None).await;

    // then
    assert!(before_third.is_empty());
    let entries = suppressions(&app).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["reason"], "consecutive_soft_bounce");
    let ann = app.store.find_subscriber("ann@example.com").await.unwrap().unwrap();
    assert_eq!(ann.bounce_count, 3);
    assert!(!ann.subscribed);
}

#[tokio::test]
async fn bounce_history_reports_the_previous_bounce() {
    // given
    let app = TestApp::spawn_on_postgres().await;
    app.add_subscriber("ann@example.com").await;
    let first = OffsetDateTime::now_utc() - Duration::days(10);
    let second = OffsetDateTime::now_utc();

    // when
    let initial = app.store.record_bounce("ann@example.com", first).await.unwrap();
    let followup = app.store.record_bounce("ann@example.com", second).await.unwrap();
    let stranger = app.store.record_bounce("nobody@example.com", second).await.unwrap();

    // then
    let initial = initial.unwrap();
    assert_eq!(initial.bounce_count, 1);
    assert_none!(initial.previous_bounce_at);
    let followup = followup.unwrap();
    assert_eq!(followup.bounce_count, 2);
    let previous = followup.previous_bounce_at.unwrap();
    assert!((previous - first).abs() < Duration::seconds(1));
    assert_none!(stranger);
}

#[tokio::test]
async fn an_address_is_suppressed_at_most_once() {
    // given
    let app = TestApp::spawn_on_postgres().await;
    app.add_subscriber("ann@example.com").await;
    let hard_bounce = json!({ "type": "email.bounced", "email": "ann@example.com", "bounce_type": "hard" });
    let complaint = json!({ "type": "complaint", "email": "ann@example.com" });

    // when
    app.post_webhook(&json!([hard_bounce, complaint]).to_string(), None)
        .await;
    let inserted = app
        .store
        .insert_suppression(&SuppressionEntry::new(
            "ann@example.com",
            SuppressionReason::Manual,
            "admin",
            None,
        ))
        .await;

    // then
    assert!(!assert_ok!(inserted));
    let entries = suppressions(&app).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["reason"], "hard_bounce");
}

#[tokio::test]
async fn unsubscribing_keeps_the_first_timestamp() {
    // given
    let app = TestApp::spawn_on_postgres().await;
    app.add_subscriber("ann@example.com").await;
    let first = OffsetDateTime::now_utc() - Duration::hours(1);

    // when
    let changed = app.store.unsubscribe("ann@example.com", first).await.unwrap();
    let again = app
        .store
        .unsubscribe("ann@example.com", OffsetDateTime::now_utc())
        .await
        .unwrap();

    // then
    assert!(changed);
    assert!(!again);
    let ann = app.store.find_subscriber("ann@example.com").await.unwrap().unwrap();
    assert!(!ann.subscribed);
    let unsubscribed_at = ann.unsubscribed_at.unwrap();
    assert!((unsubscribed_at - first).abs() < Duration::seconds(1));
}

#[tokio::test]
async fn webhook_events_attribute_snapshot_recipients() {
    // given
    let app = TestApp::spawn_on_postgres().await;
    app.accept_all_email().await;
    let ann_id = app.add_subscriber("ann@example.com").await;
    let id = app.create_campaign(&campaign_body()).await;
    app.send_campaign(id).await;
    app.wait_for_delivery(id).await;
    let body = json!({
        "RecordType": "SpamComplaint",
        "Email": "ann@example.com",
        "Metadata": { "campaign_id": id.to_string() }
    });

    // when
    app.post_webhook(&body.to_string(), None).await;

    // then
    let events = app
        .store
        .list_events(id, &[EmailEventKind::Complained])
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_some_eq!(events[0].subscriber_id, ann_id);
}
