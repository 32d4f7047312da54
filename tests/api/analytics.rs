use crate::helpers::{campaign_body, TestApp};
use serde_json::Value;
use uuid::Uuid;

async fn analytics(app: &TestApp, id: Uuid, query: &str) -> Value {
    let response = app
        .get(&format!("/admin/campaigns/{id}/analytics{query}"))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    response.json().await.unwrap()
}

#[tokio::test]
async fn drafts_have_empty_analytics() {
    // given
    let app = TestApp::spawn().await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let report = analytics(&app, id, "").await;

    // then
    assert_eq!(report["recipient_count"], 0);
    assert_eq!(report["summary"]["delivered"], 0);
    assert_eq!(report["summary"]["open_rate"], 0.0);
    assert_eq!(report["links"], serde_json::json!([]));
    assert_eq!(report["timeline"], serde_json::json!([]));
}

#[tokio::test]
async fn engagement_is_counted_per_recipient() {
    // given
    let app = TestApp::spawn().await;
    app.accept_all_email().await;
    for email in ["ann@example.com", "bob@example.com", "cid@example.com"] {
        app.add_subscriber(email).await;
    }
    let id = app.create_campaign(&campaign_body()).await;
    app.send_campaign(id).await;
    app.wait_for_delivery(id).await;

    let emails = app.sent_emails().await;
    let ann = emails.iter().find(|e| e.to == "ann@example.com").unwrap();
    let open = app.local_link(&ann.link_with_path_prefix("/track/open/"));
    let click = app.local_link(&ann.link_with_path_prefix("/track/click/"));
    app.get_url(&open).await;
    app.get_url(&open).await;
    app.get_url(&click).await;

    // when
    let report = analytics(&app, id, "").await;

    // then
    let summary = &report["summary"];
    assert_eq!(summary["delivered"], 3);
    assert_eq!(summary["opened"], 1);
    assert_eq!(summary["clicked"], 1);
    assert_eq!(summary["open_rate"], 33.3);
    assert_eq!(summary["click_rate"], 33.3);

    assert_eq!(report["links"][0]["url"], "https://shop.example.com/sale");
    assert_eq!(report["links"][0]["total_clicks"], 1);
    assert_eq!(report["links"][0]["unique_clicks"], 1);

    assert_eq!(report["timeline"][0]["hour"], 0);
    assert_eq!(report["timeline"][0]["opens"], 2);
    assert_eq!(report["timeline"][0]["clicks"], 1);
}

#[tokio::test]
async fn recent_events_are_limited_on_request() {
    // given
    let app = TestApp::spawn().await;
    app.accept_all_email().await;
    for email in ["ann@example.com", "bob@example.com", "cid@example.com"] {
        app.add_subscriber(email).await;
    }
    let id = app.create_campaign(&campaign_body()).await;
    app.send_campaign(id).await;
    app.wait_for_delivery(id).await;

    // when
    let all = analytics(&app, id, "").await;
    let limited = analytics(&app, id, "?recent=2").await;

    // then
    assert_eq!(all["recent_events"].as_array().unwrap().len(), 3);
    assert_eq!(limited["recent_events"].as_array().unwrap().len(), 2);
}
