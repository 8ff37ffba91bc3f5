//! Process-wide tracing setup: console output filtered by `RUST_LOG`
//! (default `info`) and an optional rolling file for `http.access` events.

use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target of the one-line access records written by the HTTP middleware.
pub const ACCESS_TARGET: &str = "http.access";

static ACCESS_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
}

impl Rotation {
    pub fn parse(raw: &str) -> Rotation {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        }
    }
}

/// Rolling access-log settings read from `KB_ACCESS_LOG_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogSettings {
    pub dir: String,
    pub prefix: String,
    pub rotation: Rotation,
}

impl AccessLogSettings {
    /// `None` unless `KB_ACCESS_LOG_ROLL=1`.
    pub fn from_env() -> Option<Self> {
        if std::env::var("KB_ACCESS_LOG_ROLL").ok().as_deref() != Some("1") {
            return None;
        }
        let dir = std::env::var("KB_ACCESS_LOG_DIR")
            .ok()
            .or_else(|| std::env::var("KB_LOGS_DIR").ok())
            .unwrap_or_else(|| "logs".to_string());
        let prefix = std::env::var("KB_ACCESS_LOG_PREFIX").unwrap_or_else(|_| "http-access".into());
        let rotation = Rotation::parse(
            &std::env::var("KB_ACCESS_LOG_ROTATION").unwrap_or_else(|_| "daily".into()),
        );
        Some(Self {
            dir,
            prefix,
            rotation,
        })
    }

    fn writer(&self) -> tracing_appender::rolling::RollingFileAppender {
        match self.rotation {
            Rotation::Hourly => tracing_appender::rolling::hourly(&self.dir, &self.prefix),
            Rotation::Minutely => tracing_appender::rolling::minutely(&self.dir, &self.prefix),
            Rotation::Daily => tracing_appender::rolling::daily(&self.dir, &self.prefix),
        }
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(filter));

    let Some(access) = AccessLogSettings::from_env() else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&access.dir).is_err() {
        // subscriber is not installed yet; stderr is all we have
        eprintln!("failed to create access log directory {}", access.dir);
    }
    let (nb, guard) = tracing_appender::non_blocking(access.writer());
    let _ = ACCESS_GUARD.set(guard);
    let targets = Targets::new().with_target(ACCESS_TARGET, tracing::Level::INFO);
    let access_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(nb)
        .with_filter(targets);
    let _ = registry.with(access_layer).try_init();
    tracing::info!(directory = %access.dir, prefix = %access.prefix, "access log enabled");
}
