use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use kb_protocol::ModeConfig;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::responses::{json_ok, problem_response, with_mode};
use crate::AppState;

/// Liveness plus audit backlog. `degraded` once a replay pass has run and
/// events are still pending, or while the sink reports itself unreachable.
pub(crate) async fn health(State(state): State<AppState>) -> Response {
    let mode = state.mode().snapshot().mode;
    let emitter = state.emitter();
    let pending = match emitter.pending_count().await {
        Ok(n) => n,
        Err(err) => {
            warn!("health: journal unavailable: {err}");
            return with_mode(
                problem_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Error",
                    Some("audit journal unavailable"),
                ),
                mode,
            );
        }
    };
    let degraded = !emitter.sink().available() || (pending > 0 && emitter.swept());
    let status = if degraded { "degraded" } else { "ok" };
    with_mode(
        json_ok(json!({
            "status": status,
            "mode": mode,
            "pending_events": pending,
        })),
        mode,
    )
}

#[derive(Serialize)]
struct ConfigView<'a> {
    #[serde(flatten)]
    config: &'a ModeConfig,
    deps: Value,
}

pub(crate) async fn config(State(state): State<AppState>) -> Response {
    let snapshot = state.mode().snapshot();
    let view = ConfigView {
        config: &snapshot,
        deps: state.deps().report(),
    };
    with_mode(json_ok(view), snapshot.mode)
}
