use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use once_cell::sync::Lazy;
use std::time::Instant;

/// Access records are emitted when `KB_ACCESS_LOG=1`, or implicitly when the
/// rolling access file is enabled.
static ENABLED: Lazy<bool> = Lazy::new(|| {
    ["KB_ACCESS_LOG", "KB_ACCESS_LOG_ROLL"]
        .iter()
        .any(|key| std::env::var(key).ok().as_deref() == Some("1"))
});

pub(crate) async fn access_log_mw(req: Request<axum::body::Body>, next: Next) -> Response {
    if !*ENABLED {
        return next.run(req).await;
    }
    let started = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let res = next.run(req).await;
    let mode = res
        .headers()
        .get(crate::responses::MODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    tracing::info!(
        target: kb_otel::ACCESS_TARGET,
        method = %method,
        path = %path,
        status = res.status().as_u16(),
        dur_ms = started.elapsed().as_millis() as u64,
        mode = %mode,
        "request"
    );
    res
}
