//! Fixtures shared by the HTTP tests: a config rooted in a temp dir, the
//! rule and catalog files it points at, and state wired to a memory sink.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use kb_events::test_support::MemorySink;
use tempfile::TempDir;

use crate::app_state::{AppState, Dependencies};
use crate::config::ServerConfig;

pub(crate) const ALLOWLIST_YAML: &str = r#"allow:
  - "/docs/**"
  - "/.collab/**"
deny:
  - "/.git/**"
  - "**/.git/**"
"#;

/// Config under `dir` with simulated mode and fast emit/replay timings.
/// `overrides` take precedence over the defaults here.
pub(crate) fn test_config(dir: &Path, overrides: &[(&str, &str)]) -> ServerConfig {
    let mut vars: HashMap<String, String> = [
        ("REPO_ROOT", dir.join("repo").display().to_string()),
        ("KB_STATE_DIR", dir.join("state").display().to_string()),
        ("KB_MODE", "simulated".to_string()),
        ("KB_SIM_LATENCY_MS", "0".to_string()),
        ("KB_EMIT_RETRIES", "1".to_string()),
        ("KB_EMIT_BACKOFF_MS", "1".to_string()),
        ("KB_EMIT_ATTEMPT_TIMEOUT_MS", "200".to_string()),
        ("KB_REPLAY_INTERVAL_MS", "1".to_string()),
        ("KB_REPLAY_BACKOFF_MAX_MS", "2".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }
    ServerConfig::from_lookup(move |key| vars.get(key).cloned()).expect("test config")
}

pub(crate) fn write_allowlist(config: &ServerConfig) {
    let parent = config.allowlist_path.parent().expect("allowlist parent");
    std::fs::create_dir_all(parent).expect("create allowlist dir");
    std::fs::write(&config.allowlist_path, ALLOWLIST_YAML).expect("write allowlist");
}

pub(crate) fn write_catalog(config: &ServerConfig) {
    std::fs::create_dir_all(&config.bundles_dir).expect("bundles dir");
    std::fs::create_dir_all(&config.access_models_dir).expect("models dir");
    for version in ["v1", "v2"] {
        std::fs::write(
            config.bundles_dir.join(format!("{version}.toml")),
            format!("version = \"{version}\"\n[thresholds]\nrisk = 0.5\nreview = {{ min_approvals = 2 }}\n"),
        )
        .expect("write bundle");
    }
    std::fs::write(
        config.access_models_dir.join("m1.json"),
        r#"{"id":"m1","schema_version":"1.1","type_definitions":[{"type":"user"},{"type":"document"}]}"#,
    )
    .expect("write access model");
}

pub(crate) struct TestServer {
    _dir: TempDir,
    pub config: ServerConfig,
    pub sink: Arc<MemorySink>,
    pub state: AppState,
}

/// Temp repo with allowlist and catalog files, state over a memory sink.
pub(crate) async fn server(overrides: &[(&str, &str)]) -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path(), overrides);
    std::fs::create_dir_all(&config.repo_root).expect("repo root");
    write_allowlist(&config);
    write_catalog(&config);
    let sink = Arc::new(MemorySink::new());
    let deps = Dependencies::new(None, None, config.audit_dir.clone());
    let state = crate::bootstrap::assemble(&config, sink.clone(), "memory".into(), deps)
        .await
        .expect("assemble state");
    TestServer {
        _dir: dir,
        config,
        sink,
        state,
    }
}
