//! Downstream delivery targets for audit events.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::AuditEvent;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("sink io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A transport that acknowledges an event once it has durably accepted it.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the sink believes its transport is reachable right now.
    fn available(&self) -> bool {
        true
    }

    async fn deliver(&self, event: &AuditEvent) -> Result<(), SinkError>;
}

/// Flat append-only JSONL files, one per UTC day: `events-YYYYMMDD.jsonl`.
pub struct FileSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// File holding events whose `time` falls on the given day.
    pub fn partition_for(&self, event: &AuditEvent) -> PathBuf {
        let day = chrono::DateTime::parse_from_rfc3339(&event.time)
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now())
            .format("%Y%m%d")
            .to_string();
        self.dir.join(format!("events-{day}.jsonl"))
    }
}

#[async_trait]
impl EventSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn deliver(&self, event: &AuditEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let path = self.partition_for(event);
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }
}

/// Prefer the message bus; fall back to the local file sink when it is down.
pub struct FallbackSink {
    primary: Option<Arc<dyn EventSink>>,
    fallback: Arc<dyn EventSink>,
}

impl FallbackSink {
    pub fn new(primary: Option<Arc<dyn EventSink>>, fallback: Arc<dyn EventSink>) -> Self {
        Self { primary, fallback }
    }

    /// Label reported in `ModeConfig.events_sink`.
    pub fn label(&self) -> String {
        match &self.primary {
            Some(p) => format!("{}+{}", p.name(), self.fallback.name()),
            None => self.fallback.name().to_string(),
        }
    }
}

#[async_trait]
impl EventSink for FallbackSink {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn available(&self) -> bool {
        self.fallback.available()
    }

    async fn deliver(&self, event: &AuditEvent) -> Result<(), SinkError> {
        if let Some(primary) = &self.primary {
            match primary.deliver(event).await {
                Ok(()) => return Ok(()),
                Err(err) => warn!(
                    target: "audit",
                    sink = primary.name(),
                    event_id = %event.id,
                    "dependency unavailable, using {} sink: {err}",
                    self.fallback.name()
                ),
            }
        }
        self.fallback.deliver(event).await
    }
}

/// Core NATS publish; subject is `<prefix>.<event type>`.
#[cfg(feature = "nats")]
pub struct NatsSink {
    client: async_nats::Client,
    prefix: String,
}

#[cfg(feature = "nats")]
impl NatsSink {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, SinkError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }
}

#[cfg(feature = "nats")]
#[async_trait]
impl EventSink for NatsSink {
    fn name(&self) -> &'static str {
        "nats"
    }

    fn available(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    async fn deliver(&self, event: &AuditEvent) -> Result<(), SinkError> {
        let bytes = serde_json::to_vec(event)?;
        let subject = format!("{}.{}", self.prefix, event.kind);
        self.client
            .publish(subject, bytes.into())
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }
}
