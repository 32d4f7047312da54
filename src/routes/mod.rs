use crate::ingest::IngestError;

pub mod admin;
pub mod health_check;
pub mod tracking;
pub mod unsubscribe;
pub mod webhooks;

/// Public endpoints swallow ingest failures; bad input is a warning, anything
/// else an error.
fn log_ingest_failure(action: &str, e: &IngestError) {
    match e {
        IngestError::Unexpected(_) => tracing::error!(
            error_cause_chain = ?e,
            error.message = %e,
            "Failed to {action}"
        ),
        _ => tracing::warn!(error.message = %e, "Ignored request to {action}"),
    }
}
