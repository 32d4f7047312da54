use super::log_ingest_failure;
use crate::app_state::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use secrecy::ExposeSecret;

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/email", post(email_webhook))
}

/// Always acknowledges authenticated deliveries so the provider does not retry.
#[tracing::instrument(name = "Email provider webhook", skip_all)]
async fn email_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(secret) = &app_state.webhook_secret {
        let provided = headers
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(secret.expose_secret().as_str()) {
            tracing::warn!("Rejected webhook without a valid secret");
            return StatusCode::UNAUTHORIZED;
        }
    }

    match app_state.ingestor.handle_webhook(&body).await {
        Ok(report) => tracing::info!(
            processed = report.processed,
            failed = report.failed,
            "Webhook handled"
        ),
        Err(e) => log_ingest_failure("handle a webhook", &e),
    }

    StatusCode::OK
}
