//! Wire types shared by the orchestrator crates: request/response envelopes,
//! phase results, mode configuration and worldview switch payloads.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// RFC7807-style error payload used at service edges.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: Option<String>,
    pub instance: Option<String>,
    pub trace_id: Option<String>,
    pub code: Option<String>,
}

// -------- Phases --------

/// One of the five workflow phases. Serialized upper-case (`"PLAN"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Ack,
    Plan,
    Borrow,
    Diff,
    Cr,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Ack => "ACK",
            Phase::Plan => "PLAN",
            Phase::Borrow => "BORROW",
            Phase::Diff => "DIFF",
            Phase::Cr => "CR",
        }
    }

    /// Lower-case form used in event types and artifact directories.
    pub fn slug(self) -> &'static str {
        match self {
            Phase::Ack => "ack",
            Phase::Plan => "plan",
            Phase::Borrow => "borrow",
            Phase::Diff => "diff",
            Phase::Cr => "cr",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPhase(pub String);

impl fmt::Display for UnknownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown phase '{}'", self.0)
    }
}

impl std::error::Error for UnknownPhase {}

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACK" => Ok(Phase::Ack),
            "PLAN" => Ok(Phase::Plan),
            "BORROW" => Ok(Phase::Borrow),
            "DIFF" => Ok(Phase::Diff),
            "CR" => Ok(Phase::Cr),
            _ => Err(UnknownPhase(s.to_string())),
        }
    }
}

// -------- Mode --------

/// Operating mode. `simulated` never reaches external providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Simulated,
    Live,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Simulated => "simulated",
            Mode::Live => "live",
        }
    }

    /// Accepts the canonical names plus the legacy `FAKE`/`REAL` aliases.
    pub fn parse(raw: &str) -> Option<Mode> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "simulated" | "fake" | "sim" => Some(Mode::Simulated),
            "live" | "real" => Some(Mode::Live),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------- Requests / envelopes --------

/// Body accepted by every phase endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowRequest {
    pub task: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub paths_to_write: Vec<String>,
    /// Continue an existing logical workflow.
    #[serde(default)]
    pub workflow_id: Option<String>,
    /// Retry a specific attempt; requires the same `workflow_id`.
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Success envelope for a phase run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunEnvelope {
    pub workflow_id: String,
    pub run_id: String,
    pub result: PhaseResult,
}

/// Failure envelope for a phase run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorEnvelope {
    pub error: String,
    pub detail: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Immutable outcome of one phase execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PhaseResult {
    pub phase: Phase,
    pub written_paths: Vec<String>,
    pub evidence_refs: Vec<String>,
    pub cloudevent_ids: Vec<String>,
    pub timestamp: String,
    pub ts: i64,
    pub mode: Mode,
    pub artifacts: PhaseArtifacts,
    #[serde(default, skip_serializing_if = "is_false")]
    pub audit_degraded: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Phase-specific artifact description; one fixed shape per phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseArtifacts {
    Ack {
        manifest: String,
    },
    Plan {
        documents: Vec<String>,
        manifest: String,
    },
    Borrow {
        provenance: String,
        sources: Vec<ProvenanceRecord>,
    },
    Diff {
        patches: Vec<String>,
        evidence_bundle: String,
    },
    Cr {
        change_records: Vec<String>,
        change_id: String,
    },
}

/// Where a borrowed artifact came from and what it hashed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProvenanceRecord {
    pub source: String,
    pub stored_at: String,
    pub sha256: String,
    pub retrieved_at: String,
}

// -------- Mode / worldview --------

/// Live policy-bundle and access-model pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WorldviewPointers {
    pub bundle_version: String,
    pub fga_model_id: String,
    pub thresholds_hash: String,
    pub effective_at: String,
}

/// Process-wide operating configuration. Readers hold immutable snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModeConfig {
    pub version: u64,
    pub mode: Mode,
    pub llm_providers_detected: Vec<String>,
    pub events_sink: String,
    pub repo_root: String,
    #[serde(default)]
    pub worldview: Option<WorldviewPointers>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    #[default]
    Eventual,
    Strong,
}

impl Consistency {
    pub fn parse(raw: &str) -> Option<Consistency> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strong" => Some(Consistency::Strong),
            "eventual" | "best-effort" | "best_effort" => Some(Consistency::Eventual),
            _ => None,
        }
    }
}

/// Body of `POST /mode/switch`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRequest {
    pub bundle_version: String,
    pub fga_model_id: String,
    #[serde(default)]
    pub mode: Option<Mode>,
}

/// Committed switch as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SwitchResponse {
    pub mode: Mode,
    pub bundle_version: String,
    pub fga_model_id: String,
    pub thresholds_hash: String,
    pub effective_at: String,
    pub event_id: String,
}
