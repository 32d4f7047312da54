use super::log_ingest_failure;
use crate::app_state::AppState;
use askama_axum::Template;
use axum::{
    extract::{Query, State},
    routing::get,
    Router,
};
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    // POST serves one-click unsubscribes from mail clients.
    Router::new().route("/unsubscribe", get(unsubscribe).post(unsubscribe))
}

#[derive(Default, Deserialize)]
struct UnsubscribeParams {
    email: Option<String>,
    campaign: Option<String>,
}

#[tracing::instrument(name = "Unsubscribe", skip_all)]
async fn unsubscribe(
    State(app_state): State<AppState>,
    params: Option<Query<UnsubscribeParams>>,
) -> UnsubscribedTemplate<'static> {
    let params = params.map(|Query(p)| p).unwrap_or_default();

    match app_state
        .ingestor
        .unsubscribe(params.email.as_deref(), params.campaign.as_deref())
        .await
    {
        Ok(true) => tracing::info!("Subscriber opted out"),
        Ok(false) => {}
        Err(e) => log_ingest_failure("unsubscribe", &e),
    }

    UnsubscribedTemplate {
        title: "Unsubscribed",
        message: "You have been unsubscribed and will not receive further campaign emails.",
    }
}

#[derive(Template)]
#[template(path = "web/unsubscribed.html")]
struct UnsubscribedTemplate<'a> {
    title: &'a str,
    message: &'a str,
}
