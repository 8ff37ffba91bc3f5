use kb_protocol::{Mode, Phase};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub mod sink;
#[cfg(any(test, feature = "test_support"))]
pub mod test_support;

pub use sink::{EventSink, FallbackSink, FileSink, SinkError};
#[cfg(feature = "nats")]
pub use sink::NatsSink;

/// CloudEvents-shaped audit record (RFC3339 time). Never mutated once built.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub specversion: String,
    pub subject: String,
    pub time: String,
    pub data: AuditData,
}

impl AuditEvent {
    pub fn new(kind: impl Into<String>, subject: impl Into<String>, data: AuditData) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            source: kb_topics::EVENT_SOURCE.to_string(),
            specversion: kb_topics::CLOUD_EVENT_SPEC_VERSION.to_string(),
            subject: subject.into(),
            time: now_rfc3339(),
            data,
        }
    }
}

/// Event payloads; one fixed schema per event kind.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditData {
    PhaseStarted {
        phase: Phase,
        mode: Mode,
        run_id: String,
        task: String,
        #[serde(default)]
        notes: Option<String>,
    },
    ArtifactWritten {
        phase: Phase,
        run_id: String,
        role: String,
        path: String,
        sha256: String,
    },
    PhaseCompleted {
        phase: Phase,
        mode: Mode,
        run_id: String,
        written: Vec<String>,
        #[serde(rename = "evidenceRefs")]
        evidence_refs: Vec<String>,
    },
    PathRejected {
        phase: Phase,
        mode: Mode,
        run_id: String,
        path: String,
        reason: String,
        #[serde(default)]
        pattern: Option<String>,
    },
    WorldviewSwitched {
        switch_id: String,
        mode: Mode,
        #[serde(rename = "bundleVersion")]
        bundle_version: String,
        #[serde(rename = "fgaModelId")]
        fga_model_id: String,
        #[serde(rename = "thresholdsHash")]
        thresholds_hash: String,
        #[serde(rename = "effectiveAt")]
        effective_at: String,
    },
    WorldviewAborted {
        #[serde(rename = "bundleVersion")]
        bundle_version: String,
        #[serde(rename = "fgaModelId")]
        fga_model_id: String,
        reason: String,
    },
    WorldviewRolledBack {
        switch_id: String,
        #[serde(rename = "bundleVersion")]
        bundle_version: String,
        #[serde(rename = "fgaModelId")]
        fga_model_id: String,
        #[serde(default, rename = "restoredBundleVersion")]
        restored_bundle_version: Option<String>,
        #[serde(default, rename = "restoredFgaModelId")]
        restored_fga_model_id: Option<String>,
    },
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// In-process broadcast of journaled audit events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<AuditEvent>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: &AuditEvent) {
        // No receivers is fine; the journal is the record.
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_cloudevent_attributes() {
        let ev = AuditEvent::new(
            "kb.workflow.plan.started.v1",
            "wf-1",
            AuditData::PhaseStarted {
                phase: Phase::Plan,
                mode: Mode::Simulated,
                run_id: "run-1".into(),
                task: "smoke".into(),
                notes: Some("fake".into()),
            },
        );
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "kb.workflow.plan.started.v1");
        assert_eq!(value["source"], "kb-orchestrator");
        assert_eq!(value["specversion"], "1.0");
        assert_eq!(value["data"]["kind"], "phase_started");
        assert_eq!(value["data"]["phase"], "PLAN");
        let back: AuditEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, ev);
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        let ev = AuditEvent::new(
            kb_topics::TOPIC_WORLDVIEW_ABORTED,
            kb_topics::SUBJECT_WORLDVIEW,
            AuditData::WorldviewAborted {
                bundle_version: "v9".into(),
                fga_model_id: "m9".into(),
                reason: "missing".into(),
            },
        );
        bus.publish(&ev);
        assert_eq!(rx.recv().await.unwrap().id, ev.id);
    }
}
