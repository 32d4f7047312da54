use crate::helpers::{campaign_body, TestApp};
use serde_json::{json, Value};
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, ResponseTemplate,
};

#[tokio::test]
async fn sending_is_accepted_and_finishes_in_the_background() {
    // given
    let app = TestApp::spawn().await;
    Mock::given(path("/email"))
        .and(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&app.email_server)
        .await;
    for email in ["ann@example.com", "bob@example.com", "cid@example.com"] {
        app.add_subscriber(email).await;
    }
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let response = app.send_campaign(id).await;

    // then
    assert_eq!(response.status().as_u16(), 202);
    let accepted: Value = response.json().await.unwrap();
    assert_eq!(accepted["status"], "sending");
    assert_eq!(accepted["recipient_count"], 3);

    let campaign = app.wait_for_delivery(id).await;
    assert_eq!(campaign["status"], "sent");
    assert_eq!(campaign["recipient_count"], 3);
    assert_eq!(campaign["delivered_count"], 3);
    assert_eq!(campaign["failed_count"], 0);
    assert_ne!(campaign["sent_at"], Value::Null);
}

#[tokio::test]
async fn every_email_carries_tracking_and_an_unsubscribe_link() {
    // given
    let app = TestApp::spawn().await;
    app.accept_all_email().await;
    app.add_subscriber("ann@example.com").await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    app.send_campaign(id).await;
    app.wait_for_delivery(id).await;

    // then
    let emails = app.sent_emails().await;
    assert_eq!(emails.len(), 1);
    let email = &emails[0];
    assert_eq!(email.to, "ann@example.com");
    assert_eq!(email.subject, "Spring sale");
    assert!(email.html.contains("Everything 20% off"));
    assert!(!email.html.contains("{{unsubscribe_url}}"));

    let click = email.link_with_path_prefix("/track/click/");
    let destination = click
        .query_pairs()
        .find(|(k, _)| k == "url")
        .map(|(_, v)| v.into_owned());
    assert_eq!(destination.as_deref(), Some("https://shop.example.com/sale"));
    email.link_with_path_prefix(&format!("/track/open/{id}"));
    email.link_with_path_prefix("/unsubscribe");
}

#[tokio::test]
async fn partial_gateway_failures_still_finish_the_send() {
    // given
    let app = TestApp::spawn().await;
    let failing = ["user7@example.com", "user42@example.com", "user99@example.com"];
    for email in failing {
        Mock::given(path("/email"))
            .and(body_partial_json(json!({ "To": email })))
            .respond_with(ResponseTemplate::new(500))
            .with_priority(1)
            .mount(&app.email_server)
            .await;
    }
    app.accept_all_email().await;
    for i in 0..100 {
        app.add_subscriber(&format!("user{i}@example.com")).await;
    }
    let id = app.create_campaign(&campaign_body()).await;

    // when
    app.send_campaign(id).await;
    let campaign = app.wait_for_delivery(id).await;

    // then
    assert_eq!(campaign["status"], "sent");
    assert_eq!(campaign["recipient_count"], 100);
    assert_eq!(campaign["delivered_count"], 97);
    assert_eq!(campaign["failed_count"], 3);
}

#[tokio::test]
async fn a_send_where_nothing_was_delivered_fails() {
    // given
    let app = TestApp::spawn().await;
    Mock::given(path("/email"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&app.email_server)
        .await;
    app.add_subscriber("ann@example.com").await;
    app.add_subscriber("bob@example.com").await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    app.send_campaign(id).await;
    let campaign = app.wait_for_delivery(id).await;

    // then
    assert_eq!(campaign["status"], "failed");
    assert_eq!(campaign["delivered_count"], 0);
    assert_eq!(campaign["failed_count"], 2);
}

#[tokio::test]
async fn campaigns_without_eligible_recipients_are_rejected() {
    // given
    let app = TestApp::spawn().await;
    app.add_subscriber("ann@example.com").await;
    let suppressed = app
        .post_json("/admin/suppressions", &json!({ "email": "ann@example.com" }))
        .await;
    assert_eq!(suppressed.status().as_u16(), 201);
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let response = app.send_campaign(id).await;

    // then
    assert_eq!(response.status().as_u16(), 422);
    let campaign = app.get_campaign(id).await;
    assert_eq!(campaign["status"], "draft");
    assert_eq!(campaign["recipient_count"], 0);
}

#[tokio::test]
async fn suppressed_addresses_are_left_out_of_the_snapshot() {
    // given
    let app = TestApp::spawn().await;
    Mock::given(path("/email"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&app.email_server)
        .await;
    app.add_subscriber("ann@example.com").await;
    app.add_subscriber("bob@example.com").await;
    app.post_json("/admin/suppressions", &json!({ "email": "BOB@example.com" }))
        .await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let accepted: Value = app.send_campaign(id).await.json().await.unwrap();

    // then
    assert_eq!(accepted["recipient_count"], 1);
    let campaign = app.wait_for_delivery(id).await;
    assert_eq!(campaign["delivered_count"], 1);
    assert_eq!(app.sent_emails().await[0].to, "ann@example.com");
}

#[tokio::test]
async fn a_campaign_is_only_sent_once() {
    // given
    let app = TestApp::spawn().await;
    Mock::given(path("/email"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&app.email_server)
        .await;
    app.add_subscriber("ann@example.com").await;
    let id = app.create_campaign(&campaign_body()).await;

    // when
    let first = app.send_campaign(id).await;
    app.wait_for_delivery(id).await;
    let second = app.send_campaign(id).await;

    // then
    assert_eq!(first.status().as_u16(), 202);
    assert_eq!(second.status().as_u16(), 409);
}

#[tokio::test]
async fn repeated_manual_suppressions_are_idempotent() {
    // given
    let app = TestApp::spawn().await;

    // when
    let first = app
        .post_json("/admin/suppressions", &json!({ "email": "ann@example.com", "details": "asked by phone" }))
        .await;
    let second = app
        .post_json("/admin/suppressions", &json!({ "email": "Ann@Example.com" }))
        .await;
    let invalid = app
        .post_json("/admin/suppressions", &json!({ "email": "not-an-email" }))
        .await;

    // then
    assert_eq!(first.status().as_u16(), 201);
    assert_eq!(second.status().as_u16(), 200);
    assert_eq!(invalid.status().as_u16(), 400);
    let entries: Vec<Value> = app.get("/admin/suppressions").await.json().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["email"], "ann@example.com");
    assert_eq!(entries[0]["reason"], "manual");
}
