use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use kb_protocol::{Consistency, SwitchRequest};
use serde_json::json;
use tracing::warn;

use crate::responses::{json_ok, problem_response, with_mode};
use crate::worldview::SwitchError;
use crate::AppState;

pub(crate) const CONSISTENCY_HEADER: &str = "x-consistency";

fn switch_error_response(err: SwitchError) -> Response {
    let detail = err.to_string();
    match err {
        SwitchError::Conflict => problem_response(StatusCode::CONFLICT, "Conflict", Some(&detail)),
        SwitchError::BadRequest(_) => problem_response(StatusCode::BAD_REQUEST, "Bad Request", Some(&detail)),
        SwitchError::NotFound(_) => problem_response(StatusCode::NOT_FOUND, "Not Found", Some(&detail)),
        SwitchError::Invalid(_) => problem_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Unprocessable Entity",
            Some(&detail),
        ),
        SwitchError::DeliveryPending { response } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "type": "about:blank",
                "title": "Dependency Unavailable",
                "status": 503,
                "detail": detail,
                "code": "dependency_unavailable",
                "eventId": response.event_id,
                "switch": response,
            })),
        )
            .into_response(),
        SwitchError::Internal(_) => {
            warn!("worldview switch failed: {detail}");
            problem_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", Some(&detail))
        }
    }
}

/// Atomically move the live bundle/access-model pair.
pub(crate) async fn switch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SwitchRequest>, JsonRejection>,
) -> Response {
    let consistency = match headers.get(CONSISTENCY_HEADER).map(|v| v.to_str()) {
        None => Consistency::Eventual,
        Some(Ok(raw)) => match Consistency::parse(raw) {
            Some(c) => c,
            None => {
                return problem_response(
                    StatusCode::BAD_REQUEST,
                    "Bad Request",
                    Some("X-Consistency must be 'strong' or 'eventual'"),
                )
            }
        },
        Some(Err(_)) => {
            return problem_response(
                StatusCode::BAD_REQUEST,
                "Bad Request",
                Some("X-Consistency is not valid text"),
            )
        }
    };
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return problem_response(StatusCode::BAD_REQUEST, "Bad Request", Some(&rejection.body_text()))
        }
    };
    let response = match state.coordinator().switch(request, consistency).await {
        Ok(switched) => json_ok(switched),
        Err(err) => switch_error_response(err),
    };
    with_mode(response, state.mode().snapshot().mode)
}

pub(crate) async fn status(State(state): State<AppState>) -> Response {
    match state.coordinator().status().await {
        Ok(status) => {
            let mode = status.config.mode;
            with_mode(json_ok(status), mode)
        }
        Err(err) => {
            warn!("mode status failed: {err}");
            problem_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", None)
        }
    }
}
