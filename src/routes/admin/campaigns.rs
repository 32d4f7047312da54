use crate::{
    analytics::{self, CampaignAnalytics, DEFAULT_RECENT_EVENTS, MAX_RECENT_EVENTS},
    app_state::AppState,
    domain::{Campaign, CampaignChanges, CampaignStatus, NewCampaign},
    orchestrator::{CampaignError, PreflightReport, ScheduleRequest},
    utils::error_body,
};
use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/campaigns", post(create_campaign).get(list_campaigns))
        .route(
            "/admin/campaigns/:id",
            get(get_campaign).put(update_campaign).delete(delete_campaign),
        )
        .route("/admin/campaigns/:id/send-test", post(send_test))
        .route("/admin/campaigns/:id/schedule", post(schedule_campaign))
        .route("/admin/campaigns/:id/cancel-schedule", post(cancel_schedule))
        .route("/admin/campaigns/:id/send", post(send_campaign))
        .route("/admin/campaigns/:id/preflight", get(preflight))
        .route("/admin/campaigns/:id/analytics", get(campaign_analytics))
}

impl IntoResponse for CampaignError {
    fn into_response(self) -> Response {
        let status = match &self {
            CampaignError::NotFound => StatusCode::NOT_FOUND,
            CampaignError::InvalidState(_) => StatusCode::CONFLICT,
            CampaignError::Validation(_) => StatusCode::BAD_REQUEST,
            CampaignError::NoEligibleRecipients => StatusCode::UNPROCESSABLE_ENTITY,
            CampaignError::Gateway(_) => StatusCode::BAD_GATEWAY,
            CampaignError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(
                error_cause_chain = ?self,
                error.message = %self,
                "Campaign request failed"
            );
        }

        error_body(status, &self.to_string())
    }
}

#[tracing::instrument(name = "Create campaign", skip_all)]
async fn create_campaign(
    State(app_state): State<AppState>,
    Json(new): Json<NewCampaign>,
) -> Result<(StatusCode, Json<Campaign>), CampaignError> {
    let campaign = app_state.orchestrator.create(new).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

#[tracing::instrument(name = "List campaigns", skip_all)]
async fn list_campaigns(
    State(app_state): State<AppState>,
) -> Result<Json<Vec<Campaign>>, CampaignError> {
    Ok(Json(app_state.orchestrator.list().await?))
}

#[tracing::instrument(name = "Get campaign", skip(app_state))]
async fn get_campaign(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, CampaignError> {
    Ok(Json(app_state.orchestrator.get(id).await?))
}

#[tracing::instrument(name = "Update campaign", skip(app_state, changes))]
async fn update_campaign(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(changes): Json<CampaignChanges>,
) -> Result<Json<Campaign>, CampaignError> {
    Ok(Json(app_state.orchestrator.update(id, changes).await?))
}

#[tracing::instrument(name = "Delete campaign", skip(app_state))]
async fn delete_campaign(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, CampaignError> {
    app_state.orchestrator.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Default, Deserialize)]
struct SendTestRequest {
    email: Option<String>,
}

#[tracing::instrument(name = "Send test email", skip(app_state, body))]
async fn send_test(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<SendTestRequest>>,
) -> Result<StatusCode, CampaignError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    app_state.orchestrator.send_test(id, request.email).await?;
    Ok(StatusCode::OK)
}

#[tracing::instrument(name = "Schedule campaign", skip(app_state, body))]
async fn schedule_campaign(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ScheduleRequest>>,
) -> Result<Json<Campaign>, CampaignError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(app_state.orchestrator.schedule(id, request).await?))
}

#[tracing::instrument(name = "Cancel campaign schedule", skip(app_state))]
async fn cancel_schedule(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, CampaignError> {
    Ok(Json(app_state.orchestrator.cancel_schedule(id).await?))
}

#[derive(Serialize)]
struct SendAccepted {
    campaign_id: Uuid,
    status: CampaignStatus,
    recipient_count: usize,
}

/// Freezes the audience right away and delivers in the background.
#[tracing::instrument(name = "Send campaign", skip(app_state))]
async fn send_campaign(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<SendAccepted>), CampaignError> {
    let job = app_state.orchestrator.prepare_send(id).await?;
    let accepted = SendAccepted {
        campaign_id: job.campaign_id(),
        status: CampaignStatus::Sending,
        recipient_count: job.recipient_count(),
    };

    let orchestrator = app_state.orchestrator.clone();
    tokio::spawn(
        async move {
            if let Err(e) = orchestrator.deliver(job).await {
                tracing::error!(
                    error_cause_chain = ?e,
                    error.message = %e,
                    "Campaign delivery did not finish"
                );
            }
        }
        .in_current_span(),
    );

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

#[tracing::instrument(name = "Campaign preflight", skip(app_state))]
async fn preflight(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PreflightReport>, CampaignError> {
    Ok(Json(app_state.orchestrator.preflight(id).await?))
}

#[derive(Deserialize)]
struct AnalyticsParams {
    recent: Option<usize>,
}

#[tracing::instrument(name = "Campaign analytics", skip(app_state, params))]
async fn campaign_analytics(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    params: Option<Query<AnalyticsParams>>,
) -> Result<Json<CampaignAnalytics>, CampaignError> {
    let campaign = app_state.orchestrator.get(id).await?;
    let recent = params
        .and_then(|Query(p)| p.recent)
        .unwrap_or(DEFAULT_RECENT_EVENTS)
        .min(MAX_RECENT_EVENTS);

    let store = app_state.store();
    let events = store
        .list_events(id, &[])
        .await
        .context("Failed to load campaign events")?;
    let recent_events = store
        .recent_events(id, recent)
        .await
        .context("Failed to load recent events")?;

    Ok(Json(analytics::summarize(&campaign, &events, recent_events)))
}
