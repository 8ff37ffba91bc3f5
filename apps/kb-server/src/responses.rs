use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use kb_protocol::{ErrorEnvelope, Mode, ProblemDetails};
use serde::Serialize;

/// Response header carrying the current operating mode.
pub(crate) const MODE_HEADER: &str = "x-kb-mode";

pub(crate) fn json_ok<T: Serialize>(body: T) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

pub(crate) fn problem_response(status: StatusCode, title: &str, detail: Option<&str>) -> Response {
    let body = ProblemDetails {
        r#type: "about:blank".into(),
        title: title.to_string(),
        status: status.as_u16(),
        detail: detail.map(str::to_string),
        instance: None,
        trace_id: None,
        code: None,
    };
    (status, Json(body)).into_response()
}

pub(crate) fn envelope_response(status: StatusCode, envelope: &ErrorEnvelope) -> Response {
    (status, Json(envelope)).into_response()
}

pub(crate) fn with_mode(mut response: Response, mode: Mode) -> Response {
    response
        .headers_mut()
        .insert(MODE_HEADER, HeaderValue::from_static(mode.as_str()));
    response
}
