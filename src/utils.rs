use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt::Debug;

pub fn e500<T>(error: T) -> HttpError<T>
where
    T: Debug,
{
    HttpError::InternalServerError(error)
}

pub fn e400<T>(message: String) -> HttpError<T>
where
    T: Debug,
{
    HttpError::BadRequest(message)
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError<T>
where
    T: Debug,
{
    #[error("{0}")]
    BadRequest(String),
    #[error("Something went wrong")]
    InternalServerError(#[from] T),
}

impl<T> IntoResponse for HttpError<T>
where
    T: Debug,
{
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => error_body(StatusCode::BAD_REQUEST, &message),
            Self::InternalServerError(e) => {
                tracing::error!(error_cause_chain = ?e, "Request failed");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong")
            }
        }
    }
}

/// JSON error body shared by the admin endpoints.
pub fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
