//! Canonical audit event types emitted by the orchestrator.
//!
//! Event types are dotted, versioned names. Workflow events are built from a
//! phase slug and a stage so that every phase shares one vocabulary:
//! `kb.workflow.<phase>.<stage>.v1`.

/// CloudEvents `source` attribute for every event this service emits.
pub const EVENT_SOURCE: &str = "kb-orchestrator";
/// CloudEvents spec version stamped on every event.
pub const CLOUD_EVENT_SPEC_VERSION: &str = "1.0";

// Workflow stages
pub const STAGE_STARTED: &str = "started";
pub const STAGE_ARTIFACT_WRITTEN: &str = "artifact.written";
pub const STAGE_COMPLETED: &str = "completed";
pub const STAGE_REJECTED: &str = "rejected";

// Worldview / mode
pub const TOPIC_WORLDVIEW_SWITCHED: &str = "kb.worldview.switched.v1";
pub const TOPIC_WORLDVIEW_ABORTED: &str = "kb.worldview.aborted.v1";
pub const TOPIC_WORLDVIEW_ROLLED_BACK: &str = "kb.worldview.rolled_back.v1";

/// Subject used for worldview events (workflow events use the workflow id).
pub const SUBJECT_WORLDVIEW: &str = "worldview";

/// Build a workflow event type, e.g. `kb.workflow.plan.started.v1`.
pub fn workflow_type(phase_slug: &str, stage: &str) -> String {
    format!("kb.workflow.{phase_slug}.{stage}.v1")
}
