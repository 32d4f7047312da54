use super::log_ingest_failure;
use crate::{app_state::AppState, ingest::click_destination};
use axum::{
    extract::{Path, Query, State},
    http::header::{CACHE_CONTROL, CONTENT_TYPE, EXPIRES, PRAGMA},
    response::{IntoResponse, Redirect},
    routing::get,
    Router,
};
use serde::Deserialize;

/// 1x1 transparent GIF.
pub const TRANSPARENT_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/track/open/:campaign_id", get(track_open))
        .route("/track/click/:campaign_id/:link_index", get(track_click))
}

#[derive(Default, Deserialize)]
struct OpenParams {
    email: Option<String>,
}

#[derive(Default, Deserialize)]
struct ClickParams {
    url: Option<String>,
    email: Option<String>,
}

#[tracing::instrument(name = "Record open", skip_all, fields(campaign_id = %campaign_id))]
async fn track_open(
    State(app_state): State<AppState>,
    Path(campaign_id): Path<String>,
    params: Option<Query<OpenParams>>,
) -> impl IntoResponse {
    let params = params.map(|Query(p)| p).unwrap_or_default();

    if let Err(e) = app_state
        .ingestor
        .record_open(&campaign_id, params.email.as_deref())
        .await
    {
        log_ingest_failure("record an open", &e);
    }

    (
        [
            (CONTENT_TYPE, "image/gif"),
            (CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0"),
            (PRAGMA, "no-cache"),
            (EXPIRES, "0"),
        ],
        TRANSPARENT_GIF,
    )
}

#[tracing::instrument(
    name = "Record click",
    skip_all,
    fields(campaign_id = %campaign_id, link_index = %link_index)
)]
async fn track_click(
    State(app_state): State<AppState>,
    Path((campaign_id, link_index)): Path<(String, String)>,
    params: Option<Query<ClickParams>>,
) -> Redirect {
    let params = params.map(|Query(p)| p).unwrap_or_default();

    if let Err(e) = app_state
        .ingestor
        .record_click(
            &campaign_id,
            &link_index,
            params.url.as_deref(),
            params.email.as_deref(),
        )
        .await
    {
        log_ingest_failure("record a click", &e);
    }

    Redirect::to(&click_destination(
        params.url.as_deref(),
        app_state.links.base_url(),
    ))
}
