//! Phase workflow engine.
//!
//! One request runs one phase under a `(workflow_id, run_id)` key. The key
//! is executed at most once: stored outcomes are replayed verbatim and
//! concurrent callers of the same key share a single flight.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kb_events::{AuditData, AuditEvent};
use kb_policy::{Allowlist, PathError};
use kb_protocol::{ErrorEnvelope, Mode, Phase, PhaseResult, RunEnvelope, WorkflowRequest};
use tracing::{debug, info, warn};

use crate::audit::AuditEmitter;
use crate::phases::{self, PhaseInput};
use crate::run_registry::{Lookup, RunKey, RunRegistry, StoredOutcome};

const ID_MAX_LEN: usize = 128;

/// Caller-supplied identifiers: `[A-Za-z0-9._:-]{1,128}`.
pub(crate) fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= ID_MAX_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-'))
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub(crate) enum EngineError {
    #[error("invalid request: {detail}")]
    Validation { detail: String, workflow_id: String },
    #[error("path not allowed: {}", .0.detail)]
    PathRejected(ErrorEnvelope),
    #[error("phase deadline exceeded for {workflow_id}/{run_id}")]
    Timeout { workflow_id: String, run_id: String },
    #[error("internal error: {detail}")]
    Internal {
        detail: String,
        workflow_id: String,
        run_id: String,
    },
}

impl EngineError {
    pub(crate) fn envelope(&self) -> ErrorEnvelope {
        match self {
            EngineError::Validation { detail, workflow_id } => ErrorEnvelope {
                error: "invalid request".into(),
                detail: detail.clone(),
                workflow_id: workflow_id.clone(),
                run_id: None,
                event_id: None,
            },
            EngineError::PathRejected(envelope) => envelope.clone(),
            EngineError::Timeout { workflow_id, run_id } => ErrorEnvelope {
                error: "timeout".into(),
                detail: "phase did not finish before the deadline; retry with the same run_id to collect the result".into(),
                workflow_id: workflow_id.clone(),
                run_id: Some(run_id.clone()),
                event_id: None,
            },
            EngineError::Internal {
                detail,
                workflow_id,
                run_id,
            } => ErrorEnvelope {
                error: "internal error".into(),
                detail: detail.clone(),
                workflow_id: workflow_id.clone(),
                run_id: Some(run_id.clone()),
                event_id: None,
            },
        }
    }
}

fn internal(key: &RunKey, detail: impl Into<String>) -> EngineError {
    EngineError::Internal {
        detail: detail.into(),
        workflow_id: key.workflow_id.clone(),
        run_id: key.run_id.clone(),
    }
}

fn replay(outcome: StoredOutcome) -> Result<RunEnvelope, EngineError> {
    match outcome {
        StoredOutcome::Completed(envelope) => Ok(envelope),
        StoredOutcome::Rejected(envelope) => Err(EngineError::PathRejected(envelope)),
    }
}

/// Event ids collected during one run, plus whether any is still pending.
#[derive(Default)]
struct EventTrail {
    ids: Vec<String>,
    degraded: bool,
}

pub(crate) struct Engine {
    registry: RunRegistry,
    allowlist: Arc<Allowlist>,
    emitter: Arc<AuditEmitter>,
    repo_root: PathBuf,
    sim_latency: Duration,
    default_deadline: Duration,
}

impl Engine {
    pub(crate) fn new(
        registry: RunRegistry,
        allowlist: Arc<Allowlist>,
        emitter: Arc<AuditEmitter>,
        repo_root: PathBuf,
        sim_latency: Duration,
        default_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            allowlist,
            emitter,
            repo_root,
            sim_latency,
            default_deadline: crate::phase_deadline::clamp_default(default_deadline),
        }
    }

    /// Deadline applied when a request does not carry its own.
    pub(crate) fn default_deadline(&self) -> Duration {
        self.default_deadline
    }

    /// Validate `request` for `phase` and run it under its key in `mode`.
    ///
    /// The run itself executes on its own task. When `deadline` passes first
    /// the caller gets [`EngineError::Timeout`] and the run keeps going,
    /// storing its outcome for a later retry of the same key.
    pub(crate) async fn submit(
        self: &Arc<Self>,
        phase: Phase,
        request: WorkflowRequest,
        mode: Mode,
        deadline: Duration,
    ) -> Result<RunEnvelope, EngineError> {
        let key = resolve_key(phase, &request)?;
        let engine = Arc::clone(self);
        let run_key = key.clone();
        let handle = tokio::spawn(async move { engine.run_keyed(phase, mode, &run_key, &request).await });
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(internal(&key, format!("phase task failed: {join}"))),
            Err(_) => {
                warn!(
                    workflow_id = %key.workflow_id,
                    run_id = %key.run_id,
                    phase = %phase,
                    deadline_ms = deadline.as_millis() as u64,
                    "phase deadline exceeded; run continues detached"
                );
                Err(EngineError::Timeout {
                    workflow_id: key.workflow_id,
                    run_id: key.run_id,
                })
            }
        }
    }

    async fn run_keyed(
        &self,
        phase: Phase,
        mode: Mode,
        key: &RunKey,
        request: &WorkflowRequest,
    ) -> Result<RunEnvelope, EngineError> {
        loop {
            if let Some(outcome) = self.stored(phase, key).await? {
                debug!(workflow_id = %key.workflow_id, run_id = %key.run_id, "replaying stored outcome");
                return replay(outcome);
            }
            let flight = self.registry.begin_flight(key);
            if !flight.is_leader() {
                flight.wait().await;
                continue;
            }
            // the previous leader may have stored between lookup and begin
            if let Some(outcome) = self.stored(phase, key).await? {
                return replay(outcome);
            }
            return self.execute(phase, mode, key, request).await;
        }
    }

    /// Stored outcome for `key`; a key that belongs to another phase is a
    /// `phase_mismatch` rather than a replay.
    async fn stored(&self, phase: Phase, key: &RunKey) -> Result<Option<StoredOutcome>, EngineError> {
        let found = self
            .registry
            .lookup(key, phase)
            .await
            .map_err(|e| internal(key, format!("read run store: {e}")))?;
        match found {
            Lookup::Open => Ok(None),
            Lookup::Stored(outcome) => Ok(Some(outcome)),
            Lookup::OtherPhase(stored) => Err(EngineError::Validation {
                detail: format!(
                    "phase_mismatch: run '{}' belongs to '{}' but endpoint is '{}'",
                    key.run_id, stored, phase
                ),
                workflow_id: key.workflow_id.clone(),
            }),
        }
    }

    async fn execute(
        &self,
        phase: Phase,
        mode: Mode,
        key: &RunKey,
        request: &WorkflowRequest,
    ) -> Result<RunEnvelope, EngineError> {
        let fresh = self
            .registry
            .claim(key, phase)
            .await
            .map_err(|e| internal(key, format!("claim run: {e}")))?;
        if !fresh {
            warn!(workflow_id = %key.workflow_id, run_id = %key.run_id, "re-executing run left pending by an earlier process");
        }
        let targets = match self.allowlist.validate(&request.paths_to_write) {
            Ok(targets) => targets,
            Err(err) => return self.reject(phase, mode, key, err).await,
        };

        let mut trail = EventTrail::default();
        self.record(
            key,
            &mut trail,
            AuditEvent::new(
                kb_topics::workflow_type(phase.slug(), kb_topics::STAGE_STARTED),
                key.workflow_id.as_str(),
                AuditData::PhaseStarted {
                    phase,
                    mode,
                    run_id: key.run_id.clone(),
                    task: request.task.clone(),
                    notes: request.notes.clone(),
                },
            ),
        )
        .await?;

        if mode == Mode::Simulated && !self.sim_latency.is_zero() {
            tokio::time::sleep(self.sim_latency).await;
        }

        let generated_at = kb_events::now_rfc3339();
        let input = PhaseInput {
            phase,
            workflow_id: &key.workflow_id,
            run_id: &key.run_id,
            task: &request.task,
            notes: request.notes.as_deref(),
            mode,
            targets: &targets,
            repo_root: &self.repo_root,
            generated_at: &generated_at,
        };
        let output = phases::execute(&input)
            .await
            .map_err(|e| internal(key, format!("write {phase} artifacts: {e}")))?;

        for artifact in &output.written {
            self.record(
                key,
                &mut trail,
                AuditEvent::new(
                    kb_topics::workflow_type(phase.slug(), kb_topics::STAGE_ARTIFACT_WRITTEN),
                    key.workflow_id.as_str(),
                    AuditData::ArtifactWritten {
                        phase,
                        run_id: key.run_id.clone(),
                        role: artifact.role.to_string(),
                        path: artifact.path.clone(),
                        sha256: artifact.sha256.clone(),
                    },
                ),
            )
            .await?;
        }

        let written_paths: Vec<String> = output.written.iter().map(|a| a.path.clone()).collect();
        let mut evidence_refs: Vec<String> = output
            .written
            .iter()
            .map(|a| format!("sha256:{}", a.sha256))
            .collect();
        evidence_refs.push(format!("sbom:{}", key.workflow_id));

        self.record(
            key,
            &mut trail,
            AuditEvent::new(
                kb_topics::workflow_type(phase.slug(), kb_topics::STAGE_COMPLETED),
                key.workflow_id.as_str(),
                AuditData::PhaseCompleted {
                    phase,
                    mode,
                    run_id: key.run_id.clone(),
                    written: written_paths.clone(),
                    evidence_refs: evidence_refs.clone(),
                },
            ),
        )
        .await?;

        let now = chrono::Utc::now();
        let envelope = RunEnvelope {
            workflow_id: key.workflow_id.clone(),
            run_id: key.run_id.clone(),
            result: PhaseResult {
                phase,
                written_paths,
                evidence_refs,
                cloudevent_ids: trail.ids,
                timestamp: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                ts: now.timestamp(),
                mode,
                artifacts: output.artifacts,
                audit_degraded: trail.degraded,
            },
        };
        self.registry
            .store(key, &StoredOutcome::Completed(envelope.clone()))
            .await
            .map_err(|e| internal(key, e.to_string()))?;
        info!(
            workflow_id = %key.workflow_id,
            run_id = %key.run_id,
            phase = %phase,
            mode = %mode,
            artifacts = envelope.result.written_paths.len(),
            audit_degraded = envelope.result.audit_degraded,
            "phase completed"
        );
        Ok(envelope)
    }

    async fn record(&self, key: &RunKey, trail: &mut EventTrail, event: AuditEvent) -> Result<(), EngineError> {
        let receipt = self
            .emitter
            .emit(&event)
            .await
            .map_err(|e| internal(key, e.to_string()))?;
        trail.degraded |= !receipt.delivered;
        trail.ids.push(receipt.id);
        Ok(())
    }

    async fn reject(
        &self,
        phase: Phase,
        mode: Mode,
        key: &RunKey,
        err: PathError,
    ) -> Result<RunEnvelope, EngineError> {
        warn!(
            workflow_id = %key.workflow_id,
            run_id = %key.run_id,
            phase = %phase,
            path = %err.path,
            kind = %err.kind,
            "path rejected"
        );
        let event = AuditEvent::new(
            kb_topics::workflow_type(phase.slug(), kb_topics::STAGE_REJECTED),
            key.workflow_id.as_str(),
            AuditData::PathRejected {
                phase,
                mode,
                run_id: key.run_id.clone(),
                path: err.path.clone(),
                reason: err.detail.clone(),
                pattern: err.pattern.clone(),
            },
        );
        let receipt = self
            .emitter
            .emit(&event)
            .await
            .map_err(|e| internal(key, e.to_string()))?;
        let envelope = ErrorEnvelope {
            error: "path not allowed".into(),
            detail: err.detail,
            workflow_id: key.workflow_id.clone(),
            run_id: None,
            event_id: Some(receipt.id),
        };
        self.registry
            .store(key, &StoredOutcome::Rejected(envelope.clone()))
            .await
            .map_err(|e| internal(key, e.to_string()))?;
        Err(EngineError::PathRejected(envelope))
    }
}

/// Check the request body against the endpoint and settle its key.
///
/// A malformed caller `workflow_id` is replaced with a generated one; a
/// `run_id` is only honored together with a well-formed `workflow_id`.
fn resolve_key(phase: Phase, request: &WorkflowRequest) -> Result<RunKey, EngineError> {
    let caller_workflow = request.workflow_id.as_deref().map(str::trim).filter(|id| valid_id(id));
    let workflow_id = caller_workflow
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let invalid = |detail: String| EngineError::Validation {
        detail,
        workflow_id: workflow_id.clone(),
    };

    if request.task.trim().is_empty() {
        return Err(invalid("task must not be empty".into()));
    }
    if let Some(declared) = request.phase.as_deref() {
        match declared.parse::<Phase>() {
            Ok(p) if p == phase => {}
            _ => {
                return Err(invalid(format!(
                    "phase_mismatch: body declares '{}' but endpoint is '{}'",
                    declared.trim(),
                    phase
                )))
            }
        }
    }
    let run_id = match request.run_id.as_deref().map(str::trim) {
        None => uuid::Uuid::new_v4().to_string(),
        Some(run_id) if !valid_id(run_id) => {
            return Err(invalid(
                "run_id must match [A-Za-z0-9._:-]{1,128}".into(),
            ))
        }
        Some(_) if caller_workflow.is_none() => {
            return Err(invalid("run_id requires a valid workflow_id".into()))
        }
        Some(run_id) => run_id.to_string(),
    };
    Ok(RunKey::new(workflow_id, run_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::EmitSettings;
    use kb_events::test_support::MemorySink;
    use kb_events::Bus;
    use kb_kernel::Kernel;
    use kb_policy::AllowlistConfig;
    use kb_protocol::PhaseArtifacts;

    struct Harness {
        _dir: tempfile::TempDir,
        repo: PathBuf,
        sink: Arc<MemorySink>,
        engine: Arc<Engine>,
    }

    fn harness(sim_latency: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let kernel = Kernel::open(&dir.path().join("state")).unwrap();
        let sink = Arc::new(MemorySink::new());
        let settings = EmitSettings {
            retries: 1,
            backoff: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(200),
            replay_interval: Duration::from_millis(1),
            replay_backoff_max: Duration::from_millis(2),
        };
        let emitter = Arc::new(AuditEmitter::new(kernel.clone(), sink.clone(), Bus::new(64), settings));
        let root = repo.to_string_lossy().into_owned();
        let allowlist = Arc::new(Allowlist::compile(&AllowlistConfig::builtin(), &root).unwrap());
        let engine = Arc::new(Engine::new(
            RunRegistry::new(kernel),
            allowlist,
            emitter,
            repo.clone(),
            sim_latency,
            DEADLINE,
        ));
        Harness {
            _dir: dir,
            repo,
            sink,
            engine,
        }
    }

    fn request(task: &str) -> WorkflowRequest {
        WorkflowRequest {
            task: task.into(),
            ..Default::default()
        }
    }

    const DEADLINE: Duration = Duration::from_secs(10);

    #[test]
    fn ids_follow_the_allowed_alphabet() {
        assert!(valid_id("wf-1.a_b:c"));
        assert!(!valid_id(""));
        assert!(!valid_id("has space"));
        assert!(!valid_id("../x"));
        assert!(valid_id(&"a".repeat(128)));
        assert!(!valid_id(&"a".repeat(129)));
    }

    #[test]
    fn key_resolution_rules() {
        let mut req = request("t");
        req.workflow_id = Some("bad id".into());
        let key = resolve_key(Phase::Plan, &req).unwrap();
        assert_ne!(key.workflow_id, "bad id");

        req.run_id = Some("r1".into());
        assert!(matches!(
            resolve_key(Phase::Plan, &req),
            Err(EngineError::Validation { .. })
        ));

        req.workflow_id = Some("wf-1".into());
        let key = resolve_key(Phase::Plan, &req).unwrap();
        assert_eq!(key, RunKey::new("wf-1", "r1"));

        req.phase = Some("diff".into());
        let err = resolve_key(Phase::Plan, &req).unwrap_err();
        let EngineError::Validation { detail, workflow_id } = err else {
            panic!("expected validation error");
        };
        assert!(detail.starts_with("phase_mismatch"));
        assert_eq!(workflow_id, "wf-1");

        assert!(resolve_key(Phase::Plan, &request("   ")).is_err());
    }

    #[tokio::test]
    async fn plan_writes_artifacts_and_events() {
        let h = harness(Duration::ZERO);
        let env = h.engine.submit(Phase::Plan, request("draft a plan"), Mode::Simulated, DEADLINE).await.unwrap();
        let result = &env.result;
        assert_eq!(result.phase, Phase::Plan);
        assert_eq!(result.written_paths.len(), 2);
        for path in &result.written_paths {
            assert!(std::path::Path::new(path).starts_with(&h.repo));
            assert!(std::path::Path::new(path).exists());
        }
        assert_eq!(
            result.evidence_refs.last().map(String::as_str),
            Some(format!("sbom:{}", env.workflow_id).as_str())
        );
        assert!(result.evidence_refs[..2].iter().all(|r| r.starts_with("sha256:")));
        // started + 2 artifacts + completed
        assert_eq!(result.cloudevent_ids.len(), 4);
        assert_eq!(h.sink.delivered_ids(), result.cloudevent_ids);
        assert!(!result.audit_degraded);
        assert!(matches!(result.artifacts, PhaseArtifacts::Plan { .. }));
    }

    #[tokio::test]
    async fn retry_replays_stored_result_without_side_effects() {
        let h = harness(Duration::ZERO);
        let mut req = request("ack it");
        req.workflow_id = Some("wf-retry".into());
        req.run_id = Some("run-1".into());
        let first = h.engine.submit(Phase::Ack, req.clone(), Mode::Simulated, DEADLINE).await.unwrap();
        let events = h.sink.delivered().len();
        let second = h.engine.submit(Phase::Ack, req, Mode::Simulated, DEADLINE).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.sink.delivered().len(), events);
    }

    #[tokio::test]
    async fn rejection_is_stored_and_replayed() {
        let h = harness(Duration::ZERO);
        let mut req = request("touch git");
        req.workflow_id = Some("wf-git".into());
        req.run_id = Some("run-1".into());
        req.paths_to_write = vec!["/.git/config".into()];
        let err = h.engine.submit(Phase::Diff, req.clone(), Mode::Simulated, DEADLINE).await.unwrap_err();
        let EngineError::PathRejected(envelope) = err.clone() else {
            panic!("expected rejection, got {err:?}");
        };
        assert_eq!(envelope.error, "path not allowed");
        assert!(envelope.detail.contains("/.git/**"));
        let event_id = envelope.event_id.clone().unwrap();
        assert_eq!(h.sink.delivered_ids(), vec![event_id]);
        assert!(!h.repo.join(".git").exists());

        let again = h.engine.submit(Phase::Diff, req, Mode::Simulated, DEADLINE).await.unwrap_err();
        assert_eq!(again, EngineError::PathRejected(envelope));
        assert_eq!(h.sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_keys_execute_once() {
        let h = harness(Duration::from_millis(50));
        let mut req = request("borrow docs");
        req.workflow_id = Some("wf-race".into());
        req.run_id = Some("run-1".into());
        let mut calls = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&h.engine);
            let req = req.clone();
            calls.push(tokio::spawn(async move {
                engine.submit(Phase::Borrow, req, Mode::Simulated, DEADLINE).await
            }));
        }
        let mut results = Vec::new();
        for call in calls {
            results.push(call.await.unwrap().unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        let started = h
            .sink
            .delivered()
            .into_iter()
            .filter(|e| e.kind == kb_topics::workflow_type("borrow", kb_topics::STAGE_STARTED))
            .count();
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn timeout_detaches_and_retry_collects() {
        let h = harness(Duration::from_millis(150));
        let mut req = request("slow change record");
        req.workflow_id = Some("wf-slow".into());
        req.run_id = Some("run-1".into());
        let err = h
            .engine
            .submit(Phase::Cr, req.clone(), Mode::Simulated, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
        assert_eq!(err.envelope().run_id.as_deref(), Some("run-1"));

        let env = h.engine.submit(Phase::Cr, req, Mode::Simulated, DEADLINE).await.unwrap();
        assert_eq!(env.run_id, "run-1");
        let completed = h
            .sink
            .delivered()
            .into_iter()
            .filter(|e| e.kind == kb_topics::workflow_type("cr", kb_topics::STAGE_COMPLETED))
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn undelivered_events_mark_result_degraded() {
        let h = harness(Duration::ZERO);
        h.sink.set_failing(true);
        let env = h.engine.submit(Phase::Ack, request("ack"), Mode::Simulated, DEADLINE).await.unwrap();
        assert!(env.result.audit_degraded);
        assert_eq!(env.result.cloudevent_ids.len(), 3);
        assert!(h.sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn key_reused_on_another_endpoint_is_a_phase_mismatch() {
        let h = harness(Duration::ZERO);
        let mut req = request("ack it");
        req.workflow_id = Some("wf".into());
        req.run_id = Some("r1".into());
        h.engine.submit(Phase::Ack, req.clone(), Mode::Simulated, DEADLINE).await.unwrap();
        let events = h.sink.delivered().len();

        let err = h.engine.submit(Phase::Plan, req, Mode::Simulated, DEADLINE).await.unwrap_err();
        let EngineError::Validation { detail, workflow_id } = err else {
            panic!("expected phase mismatch, got {err:?}");
        };
        assert!(detail.starts_with("phase_mismatch"), "{detail}");
        assert!(detail.contains("ACK") && detail.contains("PLAN"));
        assert_eq!(workflow_id, "wf");
        assert_eq!(h.sink.delivered().len(), events);
    }

    #[tokio::test]
    async fn prefix_sharing_runs_keep_their_evidence() {
        let h = harness(Duration::ZERO);
        let mut results = Vec::new();
        for run_id in ["attempt-1", "attempt-2"] {
            let mut req = request("plan the project");
            req.workflow_id = Some("wf-project".into());
            req.run_id = Some(run_id.into());
            results.push(h.engine.submit(Phase::Plan, req, Mode::Simulated, DEADLINE).await.unwrap());
        }
        assert!(results[0]
            .result
            .written_paths
            .iter()
            .all(|p| !results[1].result.written_paths.contains(p)));
        for env in &results {
            for (path, evidence) in env.result.written_paths.iter().zip(&env.result.evidence_refs) {
                let digest = crate::phases::sha256_hex(&std::fs::read(path).unwrap());
                assert_eq!(evidence, &format!("sha256:{digest}"));
            }
        }
    }

    #[tokio::test]
    async fn result_carries_the_mode_it_ran_under() {
        let h = harness(Duration::from_millis(200));
        // simulated latency only applies to simulated runs
        let env = h
            .engine
            .submit(Phase::Ack, request("ack"), Mode::Live, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(env.result.mode, Mode::Live);
    }
}
