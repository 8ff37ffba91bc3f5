use std::{net::SocketAddr, time::Duration};
use tracing::{error, info, warn};

mod access_log;
mod api;
mod app_state;
mod audit;
mod bootstrap;
mod bundles;
mod config;
mod engine;
mod phase_deadline;
mod phases;
mod responses;
mod router;
mod run_registry;
mod tasks;
#[cfg(test)]
mod test_support;
mod worldview;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    kb_otel::init();
    let config = match config::ServerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    config.log_summary();

    let bootstrap::BootstrapOutput {
        router,
        background_tasks,
    } = match bootstrap::build(&config).await {
        Ok(out) => out,
        Err(err) => {
            error!("startup failed: {err:#}");
            std::process::exit(1);
        }
    };
    let app = bootstrap::attach_http_layers(router, config.http_concurrency);

    let listener = match tokio::net::TcpListener::bind(&config.bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(bind = %config.bind, "bind server socket: {err}");
            std::process::exit(1);
        }
    };
    info!(bind = %config.bind, "kb-server listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    info!("shutting down background tasks");
    background_tasks
        .shutdown_with_grace(Duration::from_secs(5))
        .await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!("SIGTERM handler unavailable, waiting for ctrl-c: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod http_tests {
    use super::*;
    use crate::router::paths;
    use crate::test_support::{self, TestServer};
    use axum::{
        body::Body,
        http::{HeaderMap, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    fn app(server: &TestServer) -> Router {
        let (routes, _) = router::build_router();
        bootstrap::attach_http_layers(routes.with_state(server.state.clone()), 64)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, HeaderMap, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let req = match body {
            Some(body) => builder
                .header(axum::http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };
        let resp = app.clone().oneshot(req).await.expect("response");
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.into_body().collect().await.expect("body").to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, headers, value)
    }

    async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, HeaderMap, Value) {
        send(app, "POST", uri, Some(body), &[]).await
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, HeaderMap, Value) {
        send(app, "GET", uri, None, &[]).await
    }

    #[tokio::test]
    async fn plan_smoke_writes_and_audits() {
        let server = test_support::server(&[]).await;
        let app = app(&server);
        let (status, headers, body) = post(&app, paths::PLAN, json!({"task": "Write hello"})).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(headers.get("x-kb-mode").unwrap(), "simulated");
        assert!(body["workflow_id"].as_str().is_some_and(|s| !s.is_empty()));
        let result = &body["result"];
        assert_eq!(result["phase"], "PLAN");
        assert_eq!(result["mode"], "simulated");
        let written = result["written_paths"].as_array().unwrap();
        assert!(!written.is_empty());
        for path in written {
            let path = std::path::Path::new(path.as_str().unwrap());
            assert!(path.starts_with(&server.config.repo_root));
            assert!(path.exists());
        }
        let ids = result["cloudevent_ids"].as_array().unwrap();
        assert!(!ids.is_empty());
        for id in ids {
            let (status, _, event) = get(&app, &format!("/events/{}", id.as_str().unwrap())).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(event["source"], "kb-orchestrator");
            assert_eq!(event["specversion"], "1.0");
        }
        assert!(result.get("audit_degraded").is_none());
    }

    #[tokio::test]
    async fn git_config_write_is_rejected() {
        let server = test_support::server(&[]).await;
        let app = app(&server);
        let (status, _, body) = post(
            &app,
            paths::DIFF,
            json!({"task": "edit git", "paths_to_write": ["/.git/config"]}),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "path not allowed");
        assert_eq!(body["detail"], "Path /.git/config matches deny pattern: /.git/**");
        let event_id = body["event_id"].as_str().unwrap().to_string();
        let (status, _, event) = get(&app, &format!("/events/{event_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(event["type"], "kb.workflow.diff.rejected.v1");
        assert!(!server.config.repo_root.join(".git").exists());
    }

    #[tokio::test]
    async fn retry_with_same_ids_is_idempotent() {
        let server = test_support::server(&[]).await;
        let app = app(&server);
        let req = json!({"task": "ack", "workflow_id": "wf-http", "run_id": "run-1"});
        let (s1, _, first) = post(&app, paths::ACK, req.clone()).await;
        let events = server.sink.delivered().len();
        let (s2, _, second) = post(&app, paths::ACK, req).await;
        assert_eq!((s1, s2), (StatusCode::OK, StatusCode::OK));
        assert_eq!(first, second);
        assert_eq!(server.sink.delivered().len(), events);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_execute_once() {
        let server = test_support::server(&[("KB_SIM_LATENCY_MS", "100")]).await;
        let app = app(&server);
        let req = json!({"task": "plan", "workflow_id": "wf-par", "run_id": "run-1"});
        let mut calls = Vec::new();
        for _ in 0..5 {
            let app = app.clone();
            let req = req.clone();
            calls.push(tokio::spawn(async move { post(&app, paths::PLAN, req).await }));
        }
        let mut bodies = Vec::new();
        for call in calls {
            let (status, _, body) = call.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            bodies.push(body);
        }
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
        let started = server
            .sink
            .delivered()
            .iter()
            .filter(|e| e.kind == "kb.workflow.plan.started.v1")
            .count();
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn failing_sink_degrades_then_replay_recovers() {
        let server = test_support::server(&[]).await;
        let app = app(&server);
        server.sink.set_failing(true);
        let (status, _, body) = post(&app, paths::ACK, json!({"task": "ack"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["audit_degraded"], true);
        let (_, _, health) = get(&app, paths::HEALTH).await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["pending_events"], 3);

        server.sink.set_failing(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let emitter = server.state.emitter();
        for _ in 0..20 {
            emitter.replay_pending().await.unwrap();
            if emitter.pending_count().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (_, _, health) = get(&app, paths::HEALTH).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["pending_events"], 0);
        let ids: Vec<Value> = server.sink.delivered_ids().into_iter().map(Value::from).collect();
        assert_eq!(Value::from(ids), body["result"]["cloudevent_ids"]);
    }

    #[tokio::test]
    async fn declared_phase_must_match_endpoint() {
        let server = test_support::server(&[]).await;
        let app = app(&server);
        let (status, _, body) = post(&app, paths::PLAN, json!({"task": "x", "phase": "CR"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid request");
        assert!(body["detail"].as_str().unwrap().starts_with("phase_mismatch"));

        let (status, _, body) = post(&app, paths::PLAN, json!({"task": "  "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["workflow_id"].is_string());

        let (status, _, _) = post(&app, paths::PLAN, json!({"notes": "no task"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ack_key_is_not_replayed_from_plan() {
        let server = test_support::server(&[]).await;
        let app = app(&server);
        let body = json!({"task": "ack", "workflow_id": "wf", "run_id": "r1"});
        let (status, headers, ack) = post(&app, paths::ACK, body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-kb-mode").unwrap(), ack["result"]["mode"].as_str().unwrap());

        let (status, _, err) = post(&app, paths::PLAN, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{err}");
        assert!(err["detail"].as_str().unwrap().starts_with("phase_mismatch"));
        assert_eq!(err["workflow_id"], "wf");
    }

    #[tokio::test]
    async fn deadline_expiry_returns_504_and_retry_collects_result() {
        let server = test_support::server(&[("KB_SIM_LATENCY_MS", "300")]).await;
        let app = app(&server);
        let req = json!({"task": "cr", "workflow_id": "wf-slow", "run_id": "run-7"});
        let (status, _, body) = send(
            &app,
            "POST",
            paths::CR,
            Some(req.clone()),
            &[(phase_deadline::DEADLINE_HEADER, "50")],
        )
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"], "timeout");
        assert_eq!(body["run_id"], "run-7");

        let (status, _, body) = post(&app, paths::CR, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["run_id"], "run-7");
        assert!(body["result"]["artifacts"]["change_id"].as_str().unwrap().starts_with("CR-"));
    }

    #[tokio::test]
    async fn configured_phase_timeout_applies_without_header() {
        let server =
            test_support::server(&[("KB_SIM_LATENCY_MS", "300"), ("KB_PHASE_TIMEOUT_MS", "50")]).await;
        let app = app(&server);
        let (status, _, body) = post(&app, paths::ACK, json!({"task": "slow ack"})).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT, "{body}");
        assert_eq!(body["error"], "timeout");
    }

    #[tokio::test]
    async fn routes_are_mounted_under_kb_api() {
        let server = test_support::server(&[]).await;
        let app = app(&server);
        let (status, headers, body) = get(&app, "/kb-api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-kb-mode").unwrap(), "simulated");
        assert_eq!(body["status"], "ok");

        let (status, _, body) = post(&app, "/kb-api/borrow", json!({"task": "borrow"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["phase"], "BORROW");

        let (status, headers, body) = get(&app, "/kb-api/config").await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers.contains_key("x-kb-mode"));
        assert_eq!(body["mode"], "simulated");
        assert_eq!(body["events_sink"], "memory");
        assert!(body["deps"]["event_file"]["available"].is_boolean());
        assert_eq!(body["deps"]["nats"]["available"], false);
    }

    #[tokio::test]
    async fn unknown_event_is_404() {
        let server = test_support::server(&[]).await;
        let app = app(&server);
        let (status, _, body) = get(&app, "/events/does-not-exist").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "Event not found"}));
    }

    #[tokio::test]
    async fn mode_switch_commits_and_reports_status() {
        let server = test_support::server(&[]).await;
        let app = app(&server);
        let (status, _, body) = send(
            &app,
            "POST",
            paths::MODE_SWITCH,
            Some(json!({"bundleVersion": "v1", "fgaModelId": "m1"})),
            &[("x-consistency", "strong")],
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["bundleVersion"], "v1");
        assert_eq!(body["fgaModelId"], "m1");
        assert_eq!(body["thresholdsHash"].as_str().unwrap().len(), 64);
        let event_id = body["eventId"].as_str().unwrap().to_string();
        let (status, _, event) = get(&app, &format!("/events/{event_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(event["type"], "kb.worldview.switched.v1");

        let (status, _, status_body) = get(&app, paths::MODE_STATUS).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(status_body["switching"], false);
        assert_eq!(status_body["history"]["count"], 1);
        assert_eq!(status_body["config"]["worldview"]["bundle_version"], "v1");
        assert_eq!(status_body["config"]["version"], 2);

        let (status, _, _) = post(
            &app,
            paths::MODE_SWITCH,
            json!({"bundleVersion": "v9", "fgaModelId": "m1"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, _, status_body) = get(&app, paths::MODE_STATUS).await;
        assert_eq!(status_body["config"]["worldview"]["bundle_version"], "v1");
        assert_eq!(status_body["history"]["count"], 2);

        let (status, _, _) = send(
            &app,
            "POST",
            paths::MODE_SWITCH,
            Some(json!({"bundleVersion": "v2", "fgaModelId": "m1"})),
            &[("x-consistency", "sometimes")],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = post(&app, paths::MODE_SWITCH, json!({"bundleVersion": "v2"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
