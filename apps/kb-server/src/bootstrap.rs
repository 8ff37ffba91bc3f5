use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kb_events::{Bus, EventSink, FallbackSink, FileSink};
use kb_kernel::Kernel;
use kb_policy::Allowlist;
use kb_protocol::ModeConfig;
use tracing::{info, warn};

use crate::app_state::{AppState, Dependencies};
use crate::audit::AuditEmitter;
use crate::bundles::FsCatalog;
use crate::config::{detect_mode, ServerConfig};
use crate::engine::Engine;
use crate::router;
use crate::run_registry::RunRegistry;
use crate::tasks::TaskManager;
use crate::worldview::{ModeHandle, SwitchCoordinator};

const BUS_CAPACITY: usize = 1024;
#[cfg(feature = "nats")]
const NATS_SUBJECT_PREFIX: &str = "kb.audit";

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<()>,
    pub background_tasks: TaskManager,
}

/// Build sinks and state from `config`, then start the replay sweep.
pub(crate) async fn build(config: &ServerConfig) -> anyhow::Result<BootstrapOutput> {
    let file: Arc<dyn EventSink> = Arc::new(FileSink::new(&config.audit_dir));
    let nats = connect_nats(config).await;
    let fallback = FallbackSink::new(nats.clone(), file);
    let label = fallback.label();
    let deps = Dependencies::new(nats, config.nats_url.clone(), config.audit_dir.clone());
    let state = assemble(config, Arc::new(fallback), label, deps).await?;

    let mut background_tasks = TaskManager::new();
    background_tasks.push(state.emitter().spawn_replay());

    let (routes, endpoints) = router::build_router();
    info!(routes = endpoints.len(), "routes registered");
    Ok(BootstrapOutput {
        router: routes.with_state(state),
        background_tasks,
    })
}

#[cfg(feature = "nats")]
async fn connect_nats(config: &ServerConfig) -> Option<Arc<dyn EventSink>> {
    let url = config.nats_url.as_deref()?;
    match kb_events::NatsSink::connect(url, NATS_SUBJECT_PREFIX).await {
        Ok(sink) => {
            info!(url, "audit events publish to nats");
            Some(Arc::new(sink))
        }
        Err(err) => {
            warn!(url, "nats unavailable, audit events go to the file sink: {err}");
            None
        }
    }
}

#[cfg(not(feature = "nats"))]
async fn connect_nats(config: &ServerConfig) -> Option<Arc<dyn EventSink>> {
    if let Some(url) = config.nats_url.as_deref() {
        warn!(url, "KB_NATS_URL set but built without the `nats` feature; using the file sink");
    }
    None
}

/// Wire the kernel, emitter, engine and coordinator over `sink`, and recover
/// any worldview switch left half-done by a previous process.
pub(crate) async fn assemble(
    config: &ServerConfig,
    sink: Arc<dyn EventSink>,
    sink_label: String,
    deps: Dependencies,
) -> anyhow::Result<AppState> {
    if let Err(err) = tokio::fs::create_dir_all(&config.audit_dir).await {
        warn!(dir = %config.audit_dir.display(), "cannot create audit dir: {err}");
    }
    let kernel = Kernel::open_with_busy_timeout(&config.state_dir, Duration::from_millis(config.sqlite_busy_ms))
        .with_context(|| format!("open state dir {}", config.state_dir.display()))?;
    let allowlist = Arc::new(Allowlist::load_or_restrictive(
        &config.allowlist_path,
        &config.root_prefix(),
    ));

    let (mode, providers) = detect_mode(config.mode, |key| std::env::var(key).ok());
    info!(mode = %mode, providers = ?providers, events_sink = %sink_label, "operating mode resolved");
    let mode_handle = Arc::new(ModeHandle::new(ModeConfig {
        version: 1,
        mode,
        llm_providers_detected: providers,
        events_sink: sink_label,
        repo_root: config.repo_root.display().to_string(),
        worldview: None,
    }));

    let emitter = Arc::new(AuditEmitter::new(
        kernel.clone(),
        sink,
        Bus::new(BUS_CAPACITY),
        config.emit.clone(),
    ));
    let catalog = Arc::new(FsCatalog::new(&config.bundles_dir, &config.access_models_dir));
    let coordinator = Arc::new(SwitchCoordinator::new(
        kernel.clone(),
        Arc::clone(&emitter),
        catalog,
        Arc::clone(&mode_handle),
        config.emit.attempt_timeout,
    ));
    coordinator.recover().await.context("recover worldview switches")?;

    let engine = Arc::new(Engine::new(
        RunRegistry::new(kernel),
        allowlist,
        Arc::clone(&emitter),
        config.repo_root.clone(),
        Duration::from_millis(config.sim_latency_ms),
        Duration::from_millis(config.phase_timeout_ms),
    ));
    Ok(AppState::new(
        engine,
        emitter,
        coordinator,
        mode_handle,
        Arc::new(deps),
    ))
}

pub(crate) fn attach_http_layers(router: axum::Router<()>, concurrency_limit: usize) -> axum::Router<()> {
    use tower::limit::ConcurrencyLimitLayer;
    use tower_http::trace::TraceLayer;

    router
        .layer(axum::middleware::from_fn(crate::access_log::access_log_mw))
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
}
