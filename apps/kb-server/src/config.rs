use std::path::{Path, PathBuf};
use std::time::Duration;

use kb_protocol::Mode;
use serde::Deserialize;
use tracing::info;

use crate::audit::EmitSettings;

const DEFAULT_REPO_ROOT: &str = "/workspace";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;

/// Provider credentials that switch `AUTO` into live mode, with the label
/// reported in `llm_providers_detected`.
const PROVIDER_KEYS: &[(&str, &str)] = &[
    ("OPENAI_API_KEY", "openai"),
    ("ANTHROPIC_API_KEY", "anthropic"),
    ("AZURE_OPENAI_KEY", "azure"),
];

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Keys accepted in the optional `KB_CONFIG` TOML file. Environment wins.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind: Option<String>,
    state_dir: Option<PathBuf>,
    repo_root: Option<PathBuf>,
    audit_dir: Option<PathBuf>,
    allowlist: Option<PathBuf>,
    mode: Option<String>,
    nats_url: Option<String>,
    bundles_dir: Option<PathBuf>,
    access_models_dir: Option<PathBuf>,
    phase_timeout_ms: Option<u64>,
    sim_latency_ms: Option<u64>,
    sqlite_busy_ms: Option<u64>,
    emit_retries: Option<u32>,
    emit_backoff_ms: Option<u64>,
    emit_attempt_timeout_ms: Option<u64>,
    replay_interval_ms: Option<u64>,
    replay_backoff_max_ms: Option<u64>,
    http_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModeSetting {
    Auto,
    Fixed(Mode),
}

impl ModeSetting {
    fn parse(raw: &str) -> Option<Self> {
        if raw.trim().eq_ignore_ascii_case("auto") {
            return Some(ModeSetting::Auto);
        }
        Mode::parse(raw).map(ModeSetting::Fixed)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServerConfig {
    pub bind: String,
    pub state_dir: PathBuf,
    pub repo_root: PathBuf,
    pub audit_dir: PathBuf,
    pub allowlist_path: PathBuf,
    pub mode: ModeSetting,
    pub nats_url: Option<String>,
    pub bundles_dir: PathBuf,
    pub access_models_dir: PathBuf,
    pub phase_timeout_ms: u64,
    /// Artificial work time for simulated runs.
    pub sim_latency_ms: u64,
    pub sqlite_busy_ms: u64,
    pub emit: EmitSettings,
    pub http_concurrency: usize,
}

impl ServerConfig {
    pub(crate) fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from a variable lookup (the process env in
    /// production) layered over the optional TOML file it names.
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let file = match env("KB_CONFIG") {
            Some(path) => load_file(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let repo_root = env("REPO_ROOT")
            .map(PathBuf::from)
            .or(file.repo_root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REPO_ROOT));
        let collab = repo_root.join(".collab");
        let state_dir = env("KB_STATE_DIR")
            .map(PathBuf::from)
            .or(file.state_dir)
            .unwrap_or_else(|| collab.join("state"));
        let audit_dir = env("KB_AUDIT_DIR")
            .map(PathBuf::from)
            .or(file.audit_dir)
            .unwrap_or_else(|| collab.join("audit"));
        let allowlist_path = env("KB_ALLOWLIST")
            .map(PathBuf::from)
            .or(file.allowlist)
            .unwrap_or_else(|| collab.join("paths.allowlist.yaml"));
        let bundles_dir = env("KB_BUNDLES_DIR")
            .map(PathBuf::from)
            .or(file.bundles_dir)
            .unwrap_or_else(|| collab.join("bundles"));
        let access_models_dir = env("KB_ACCESS_MODELS_DIR")
            .map(PathBuf::from)
            .or(file.access_models_dir)
            .unwrap_or_else(|| collab.join("access-models"));

        let mode_raw = env("KB_MODE").or(file.mode).unwrap_or_else(|| "AUTO".into());
        let mode = ModeSetting::parse(&mode_raw).ok_or(ConfigError::Invalid {
            key: "KB_MODE",
            value: mode_raw.clone(),
        })?;

        let bind = match env("KB_BIND").or(file.bind) {
            Some(bind) => bind,
            None => {
                let host = env("HOST").unwrap_or_else(|| DEFAULT_HOST.into());
                let port = match env("PORT") {
                    Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::Invalid {
                        key: "PORT",
                        value: raw,
                    })?,
                    None => DEFAULT_PORT,
                };
                format!("{host}:{port}")
            }
        };

        let defaults = EmitSettings::default();
        let emit = EmitSettings {
            retries: number(&env, "KB_EMIT_RETRIES", file.emit_retries)?
                .unwrap_or(defaults.retries),
            backoff: millis(&env, "KB_EMIT_BACKOFF_MS", file.emit_backoff_ms)?
                .unwrap_or(defaults.backoff),
            attempt_timeout: millis(
                &env,
                "KB_EMIT_ATTEMPT_TIMEOUT_MS",
                file.emit_attempt_timeout_ms,
            )?
            .unwrap_or(defaults.attempt_timeout),
            replay_interval: millis(&env, "KB_REPLAY_INTERVAL_MS", file.replay_interval_ms)?
                .unwrap_or(defaults.replay_interval),
            replay_backoff_max: millis(
                &env,
                "KB_REPLAY_BACKOFF_MAX_MS",
                file.replay_backoff_max_ms,
            )?
            .unwrap_or(defaults.replay_backoff_max),
        };

        Ok(Self {
            bind,
            state_dir,
            repo_root,
            audit_dir,
            allowlist_path,
            mode,
            nats_url: env("KB_NATS_URL").or(file.nats_url),
            bundles_dir,
            access_models_dir,
            phase_timeout_ms: number(&env, "KB_PHASE_TIMEOUT_MS", file.phase_timeout_ms)?
                .unwrap_or(crate::phase_deadline::FALLBACK_PHASE_TIMEOUT_MS)
                .max(1),
            sim_latency_ms: number(&env, "KB_SIM_LATENCY_MS", file.sim_latency_ms)?
                .unwrap_or(100),
            sqlite_busy_ms: number(&env, "KB_SQLITE_BUSY_MS", file.sqlite_busy_ms)?
                .unwrap_or(kb_kernel::DEFAULT_BUSY_TIMEOUT_MS),
            emit,
            http_concurrency: number(&env, "KB_HTTP_CONCURRENCY", file.http_concurrency)?
                .unwrap_or(1024)
                .max(1),
        })
    }

    /// Repo root as the prefix stripped from requested paths.
    pub(crate) fn root_prefix(&self) -> String {
        self.repo_root.to_string_lossy().trim_end_matches('/').to_string()
    }

    pub(crate) fn log_summary(&self) {
        info!(
            bind = %self.bind,
            repo_root = %self.repo_root.display(),
            state_dir = %self.state_dir.display(),
            audit_dir = %self.audit_dir.display(),
            allowlist = %self.allowlist_path.display(),
            nats = self.nats_url.is_some(),
            "configuration resolved"
        );
    }
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn number<T, F>(env: &F, key: &'static str, fallback: Option<T>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(fallback),
    }
}

fn millis<F>(env: &F, key: &'static str, fallback: Option<u64>) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(number(env, key, fallback)?.map(Duration::from_millis))
}

/// Resolve the effective mode and the providers whose keys are present.
pub(crate) fn detect_mode<F>(setting: ModeSetting, lookup: F) -> (Mode, Vec<String>)
where
    F: Fn(&str) -> Option<String>,
{
    let providers: Vec<String> = PROVIDER_KEYS
        .iter()
        .filter(|(key, _)| lookup(*key).is_some_and(|v| !v.trim().is_empty()))
        .map(|(_, label)| label.to_string())
        .collect();
    let mode = match setting {
        ModeSetting::Fixed(mode) => mode,
        ModeSetting::Auto if providers.is_empty() => Mode::Simulated,
        ModeSetting::Auto => Mode::Live,
    };
    (mode, providers)
}
