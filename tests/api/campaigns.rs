use crate::helpers::{campaign_body, TestApp};
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::{
    matchers::{any, method, path},
    Mock, ResponseTemplate,
};

#[tokio::test]
async fn new_campaigns_start_as_unconfirmed_drafts() {
    // given
    let app = TestApp::spawn().await;

    // when
    let response = app.post_json("/admin/campaigns", &campaign_body()).await;

    // then
    assert_eq!(response.status().as_u16(), 201);
    let campaign: Value = response.json().await.unwrap();
    assert_eq!(campaign["status"], "draft");
    assert_eq!(campaign["audience"]["type"], "all");
    assert_eq!(campaign["audience_confirmed"], false);
    assert_eq!(campaign["recipient_count"], 0);
}

#[tokio::test]
async fn created_campaigns_are_listed() {
    // given
    let app = TestApp::spawn().await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let campaigns: Vec<Value> = app.get("/admin/campaigns").await.json().await.unwrap();

    // then
    assert_eq!(campaigns.len(), 1);
    assert_eq!(campaigns[0]["id"], id.to_string());
}

#[tokio::test]
async fn unknown_campaigns_are_not_found() {
    // given
    let app = TestApp::spawn().await;
    let id = Uuid::new_v4();

    // when
    let get = app.get(&format!("/admin/campaigns/{id}")).await;
    let send = app.send_campaign(id).await;
    let analytics = app.get(&format!("/admin/campaigns/{id}/analytics")).await;

    // then
    assert_eq!(get.status().as_u16(), 404);
    assert_eq!(send.status().as_u16(), 404);
    assert_eq!(analytics.status().as_u16(), 404);
}

#[tokio::test]
async fn editing_a_scheduled_campaign_returns_it_to_draft() {
    // given
    let app = TestApp::spawn().await;
    let id = app.create_campaign(&campaign_body()).await;
    let scheduled = app
        .post_json(
            &format!("/admin/campaigns/{id}/schedule"),
            &json!({ "scheduled_for": "2099-03-01T09:00:00Z", "timezone": "Europe/Warsaw" }),
        )
        .await;
    assert_eq!(scheduled.status().as_u16(), 200);

    // when
    let response = app
        .put_json(
            &format!("/admin/campaigns/{id}"),
            &json!({ "subject": "Spring sale, extended" }),
        )
        .await;

    // then
    assert_eq!(response.status().as_u16(), 200);
    let campaign: Value = response.json().await.unwrap();
    assert_eq!(campaign["status"], "draft");
    assert_eq!(campaign["subject"], "Spring sale, extended");
    assert_eq!(campaign["scheduled_for"], Value::Null);
}

#[tokio::test]
async fn scheduling_requires_a_valid_time() {
    // given
    let app = TestApp::spawn().await;
    let id = app.create_campaign(&campaign_body()).await;

    for body in [json!({}), json!({ "scheduled_for": "next tuesday" })] {
        // when
        let response = app
            .post_json(&format!("/admin/campaigns/{id}/schedule"), &body)
            .await;

        // then
        assert_eq!(response.status().as_u16(), 400, "body: {body}");
    }
    assert_eq!(app.get_campaign(id).await["status"], "draft");
}

#[tokio::test]
async fn cancelling_a_schedule_requires_a_scheduled_campaign() {
    // given
    let app = TestApp::spawn().await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let response = app
        .post_empty(&format!("/admin/campaigns/{id}/cancel-schedule"))
        .await;

    // then
    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
async fn drafts_can_be_deleted() {
    // given
    let app = TestApp::spawn().await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let response = app.delete(&format!("/admin/campaigns/{id}")).await;

    // then
    assert_eq!(response.status().as_u16(), 204);
    let gone = app.get(&format!("/admin/campaigns/{id}")).await;
    assert_eq!(gone.status().as_u16(), 404);
}

#[tokio::test]
async fn sent_campaigns_cannot_be_edited_or_deleted() {
    // given
    let app = TestApp::spawn().await;
    app.accept_all_email().await;
    app.add_subscriber("ann@example.com").await;
    let id = app.create_campaign(&campaign_body()).await;
    assert_eq!(app.send_campaign(id).await.status().as_u16(), 202);
    app.wait_for_delivery(id).await;

    // when
    let edit = app
        .put_json(&format!("/admin/campaigns/{id}"), &json!({ "subject": "Oops" }))
        .await;
    let delete = app.delete(&format!("/admin/campaigns/{id}")).await;

    // then
    assert_eq!(edit.status().as_u16(), 409);
    assert_eq!(delete.status().as_u16(), 409);
}

#[tokio::test]
async fn test_sends_are_prefixed_and_untracked() {
    // given
    let app = TestApp::spawn().await;
    Mock::given(path("/email"))
        .and(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&app.email_server)
        .await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let response = app
        .post_json(
            &format!("/admin/campaigns/{id}/send-test"),
            &json!({ "email": "Reviewer@Example.com" }),
        )
        .await;

    // then
    assert_eq!(response.status().as_u16(), 200);
    let emails = app.sent_emails().await;
    assert_eq!(emails[0].to, "reviewer@example.com");
    assert_eq!(emails[0].subject, "[Test] Spring sale");
    assert!(!emails[0].html.contains("/track/"));
    emails[0].link_with_path_prefix("/unsubscribe");

    let campaign = app.get_campaign(id).await;
    assert_eq!(campaign["status"], "draft");
    assert_eq!(campaign["test_recipients"], json!(["reviewer@example.com"]));
}

#[tokio::test]
async fn test_sends_need_a_recipient() {
    // given
    let app = TestApp::spawn().await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let response = app
        .post_empty(&format!("/admin/campaigns/{id}/send-test"))
        .await;

    // then
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn gateway_failures_during_test_sends_are_reported() {
    // given
    let app = TestApp::spawn().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .mount(&app.email_server)
        .await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let response = app
        .post_json(
            &format!("/admin/campaigns/{id}/send-test"),
            &json!({ "email": "reviewer@example.com" }),
        )
        .await;

    // then
    assert_eq!(response.status().as_u16(), 502);
    assert_eq!(app.get_campaign(id).await["test_recipients"], json!([]));
}

#[tokio::test]
async fn preflight_reports_what_is_missing() {
    // given
    let app = TestApp::spawn().await;
    app.add_subscriber("ann@example.com").await;
    app.add_subscriber("bob@example.com").await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let report: Value = app
        .get(&format!("/admin/campaigns/{id}/preflight"))
        .await
        .json()
        .await
        .unwrap();

    // then
    assert_eq!(report["has_subject"], true);
    assert_eq!(report["has_content"], true);
    assert_eq!(report["has_unsubscribe_link"], true);
    assert_eq!(report["has_test_send"], false);
    assert_eq!(report["has_audience"], false);
    assert_eq!(report["eligible_recipients"], 2);
    assert_eq!(report["ready"], false);
}

#[tokio::test]
async fn segments_can_be_saved_and_targeted() {
    // given
    let app = TestApp::spawn().await;
    app.add_subscriber_with("ann@example.com", Some("checkout"), &["vip"]).await;
    app.add_subscriber_with("bob@example.com", Some("import"), &[]).await;

    // when
    let response = app
        .post_json(
            "/admin/segments",
            &json!({
                "name": "VIPs",
                "rule": {
                    "match": "all",
                    "conditions": [{ "field": "tags", "operator": "contains", "value": "vip" }]
                }
            }),
        )
        .await;

    // then
    assert_eq!(response.status().as_u16(), 201);
    let segment: Value = response.json().await.unwrap();
    assert_eq!(segment["subscriber_count"], 1);

    let segment_id = segment["id"].as_str().unwrap();
    let id = app.create_campaign(&campaign_body()).await;
    app.put_json(
        &format!("/admin/campaigns/{id}"),
        &json!({ "audience": { "type": "segment", "segment_id": segment_id } }),
    )
    .await;
    let report: Value = app
        .get(&format!("/admin/campaigns/{id}/preflight"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(report["eligible_recipients"], 1);
    assert_eq!(report["has_audience"], true);
}
