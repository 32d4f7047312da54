//! Operator JSON API. Expected to sit behind an authenticating proxy.

use crate::app_state::AppState;
use axum::Router;

mod campaigns;
mod segments;
mod suppressions;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(campaigns::router())
        .merge(segments::router())
        .merge(suppressions::router())
}
