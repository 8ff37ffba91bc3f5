use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use kb_protocol::{ErrorEnvelope, Phase, WorkflowRequest};

use crate::engine::EngineError;
use crate::phase_deadline;
use crate::responses::{envelope_response, json_ok, with_mode};
use crate::AppState;

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation { .. } => StatusCode::BAD_REQUEST,
        EngineError::PathRejected(_) => StatusCode::FORBIDDEN,
        EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn run_phase(
    state: AppState,
    phase: Phase,
    headers: HeaderMap,
    body: Result<Json<WorkflowRequest>, JsonRejection>,
) -> Response {
    // one snapshot for both the header and the run
    let mode = state.mode().snapshot().mode;
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let envelope = ErrorEnvelope {
                error: "invalid request".into(),
                detail: rejection.body_text(),
                workflow_id: uuid::Uuid::new_v4().to_string(),
                run_id: None,
                event_id: None,
            };
            return with_mode(envelope_response(StatusCode::BAD_REQUEST, &envelope), mode);
        }
    };
    let deadline = phase_deadline::for_request(&headers, state.engine().default_deadline());
    let response = match state.engine().submit(phase, request, mode, deadline).await {
        Ok(envelope) => json_ok(envelope),
        Err(err) => envelope_response(status_for(&err), &err.envelope()),
    };
    with_mode(response, mode)
}

pub(crate) async fn ack(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<WorkflowRequest>, JsonRejection>,
) -> Response {
    run_phase(state, Phase::Ack, headers, body).await
}

pub(crate) async fn plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<WorkflowRequest>, JsonRejection>,
) -> Response {
    run_phase(state, Phase::Plan, headers, body).await
}

pub(crate) async fn borrow(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<WorkflowRequest>, JsonRejection>,
) -> Response {
    run_phase(state, Phase::Borrow, headers, body).await
}

pub(crate) async fn diff(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<WorkflowRequest>, JsonRejection>,
) -> Response {
    run_phase(state, Phase::Diff, headers, body).await
}

pub(crate) async fn cr(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<WorkflowRequest>, JsonRejection>,
) -> Response {
    run_phase(state, Phase::Cr, headers, body).await
}
