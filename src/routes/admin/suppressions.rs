use crate::{
    app_state::AppState,
    domain::{SubscriberEmail, SuppressionEntry},
    utils::{e400, e500, HttpError},
};
use axum::{
    extract::State,
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

pub(super) fn router() -> Router<AppState> {
    Router::new().route(
        "/admin/suppressions",
        post(add_suppression).get(list_suppressions),
    )
}

#[tracing::instrument(name = "List suppressions", skip_all)]
async fn list_suppressions(
    State(app_state): State<AppState>,
) -> Result<Json<Vec<SuppressionEntry>>, HttpError<anyhow::Error>> {
    let suppressions = app_state.store().list_suppressions().await.map_err(e500)?;
    Ok(Json(suppressions))
}

#[derive(Deserialize)]
struct ManualSuppression {
    #[serde(default)]
    email: String,
    details: Option<String>,
}

#[derive(Serialize)]
struct SuppressionAdded {
    email: String,
    created: bool,
}

/// Answers `201` for a new entry and `200` when the address was already listed.
#[tracing::instrument(name = "Add manual suppression", skip_all)]
async fn add_suppression(
    State(app_state): State<AppState>,
    Json(body): Json<ManualSuppression>,
) -> Result<(StatusCode, Json<SuppressionAdded>), HttpError<anyhow::Error>> {
    let email = SubscriberEmail::parse(body.email).map_err(e400)?;
    let created = app_state
        .ingestor
        .suppress_manually(&email, body.details)
        .await
        .map_err(|e| e500(e.into()))?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(SuppressionAdded {
            email: email.as_ref().to_owned(),
            created,
        }),
    ))
}
