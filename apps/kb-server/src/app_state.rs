use std::path::PathBuf;
use std::sync::Arc;

use kb_events::EventSink;
use serde_json::{json, Value};

use crate::audit::AuditEmitter;
use crate::engine::Engine;
use crate::worldview::{ModeHandle, SwitchCoordinator};

/// Downstream dependencies reported by `/config`.
pub(crate) struct Dependencies {
    nats: Option<Arc<dyn EventSink>>,
    nats_url: Option<String>,
    audit_dir: PathBuf,
}

impl Dependencies {
    pub(crate) fn new(nats: Option<Arc<dyn EventSink>>, nats_url: Option<String>, audit_dir: PathBuf) -> Self {
        Self {
            nats,
            nats_url,
            audit_dir,
        }
    }

    fn event_file_available(&self) -> bool {
        std::fs::metadata(&self.audit_dir)
            .map(|m| m.is_dir() && !m.permissions().readonly())
            .unwrap_or(false)
    }

    pub(crate) fn report(&self) -> Value {
        json!({
            "nats": {
                "available": self.nats.as_ref().is_some_and(|s| s.available()),
                "url": self.nats_url,
            },
            "event_file": {
                "available": self.event_file_available(),
                "dir": self.audit_dir.display().to_string(),
            },
        })
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    engine: Arc<Engine>,
    emitter: Arc<AuditEmitter>,
    coordinator: Arc<SwitchCoordinator>,
    mode: Arc<ModeHandle>,
    deps: Arc<Dependencies>,
}

impl AppState {
    pub(crate) fn new(
        engine: Arc<Engine>,
        emitter: Arc<AuditEmitter>,
        coordinator: Arc<SwitchCoordinator>,
        mode: Arc<ModeHandle>,
        deps: Arc<Dependencies>,
    ) -> Self {
        Self {
            engine,
            emitter,
            coordinator,
            mode,
            deps,
        }
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub(crate) fn emitter(&self) -> &Arc<AuditEmitter> {
        &self.emitter
    }

    pub(crate) fn coordinator(&self) -> &SwitchCoordinator {
        &self.coordinator
    }

    pub(crate) fn mode(&self) -> &ModeHandle {
        &self.mode
    }

    pub(crate) fn deps(&self) -> &Dependencies {
        &self.deps
    }
}
