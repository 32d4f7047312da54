use crate::{
    app_state::AppState,
    domain::{NewSegment, Segment},
    orchestrator::CampaignError,
};
use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/segments", post(create_segment).get(list_segments))
        .route("/admin/segments/:id", get(get_segment))
}

#[tracing::instrument(name = "Create segment", skip_all)]
async fn create_segment(
    State(app_state): State<AppState>,
    Json(new): Json<NewSegment>,
) -> Result<(StatusCode, Json<Segment>), CampaignError> {
    let segment = app_state.orchestrator.create_segment(new).await?;
    Ok((StatusCode::CREATED, Json(segment)))
}

#[tracing::instrument(name = "List segments", skip_all)]
async fn list_segments(
    State(app_state): State<AppState>,
) -> Result<Json<Vec<Segment>>, CampaignError> {
    let segments = app_state
        .store()
        .list_segments()
        .await
        .context("Failed to list segments")?;
    Ok(Json(segments))
}

/// Returns the segment with a freshly computed subscriber count.
#[tracing::instrument(name = "Get segment", skip(app_state))]
async fn get_segment(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Segment>, CampaignError> {
    Ok(Json(app_state.orchestrator.refresh_segment(id).await?))
}
