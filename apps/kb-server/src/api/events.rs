use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::responses::{json_ok, problem_response};
use crate::AppState;

/// Stored audit event by id, read from the journal.
pub(crate) async fn get_event(State(state): State<AppState>, Path(event_id): Path<String>) -> Response {
    match state.emitter().get(&event_id).await {
        Ok(Some(event)) => json_ok(event),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": "Event not found"}))).into_response(),
        Err(err) => {
            warn!(event_id = %event_id, "event lookup failed: {err}");
            problem_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Error",
                Some("audit journal unavailable"),
            )
        }
    }
}
