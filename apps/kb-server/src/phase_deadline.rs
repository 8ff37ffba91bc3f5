use axum::http::HeaderMap;
use std::time::Duration;

pub(crate) const FALLBACK_PHASE_TIMEOUT_MS: u64 = 30_000;
/// Per-request override header, in milliseconds.
pub(crate) const DEADLINE_HEADER: &str = "x-kb-deadline-ms";
const MAX_DEADLINE_MS: u64 = 10 * 60 * 1000;

/// Clamp a configured default into the accepted range.
pub(crate) fn clamp_default(default: Duration) -> Duration {
    default.clamp(Duration::from_millis(1), Duration::from_millis(MAX_DEADLINE_MS))
}

/// Deadline for one request: the header value when it parses, else `default`.
pub(crate) fn for_request(headers: &HeaderMap, default: Duration) -> Duration {
    headers
        .get(DEADLINE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms.min(MAX_DEADLINE_MS)))
        .unwrap_or(default)
}
