//! Per-key single-flight over the durable run store.
//!
//! The store (kernel `runs` table) answers "has this `(workflow_id, run_id)`
//! already finished?"; the flight map makes sure only one caller executes a
//! key at a time while the others wait for its outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use kb_kernel::{Kernel, RUN_COMPLETED, RUN_FAILED};
use kb_protocol::{ErrorEnvelope, Phase, RunEnvelope};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RunKey {
    pub workflow_id: String,
    pub run_id: String,
}

impl RunKey {
    pub(crate) fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }

    fn flight_key(&self) -> String {
        format!("{}\u{1f}{}", self.workflow_id, self.run_id)
    }
}

/// Terminal outcome stored under a key and replayed verbatim on retry.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StoredOutcome {
    Completed(RunEnvelope),
    Rejected(ErrorEnvelope),
}

/// What the store holds for a key, seen from one phase endpoint.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Lookup {
    /// No terminal outcome yet.
    Open,
    Stored(StoredOutcome),
    /// The key was claimed by a run of another phase.
    OtherPhase(String),
}

#[derive(Clone, Default)]
pub(crate) struct Singleflight {
    flights: Arc<Mutex<HashMap<String, Arc<FlightState>>>>,
}

impl Singleflight {
    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<FlightState>>> {
        self.flights
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn begin(&self, key: &str) -> FlightGuard {
        let mut map = self.map();
        if let Some(state) = map.get(key) {
            // a finished flight still referenced by late waiters is replaced
            if !state.done.load(Ordering::Acquire) {
                state.add_ref();
                return FlightGuard::new(self.clone(), key.to_string(), Arc::clone(state), false);
            }
        }
        let state = Arc::new(FlightState::new());
        map.insert(key.to_string(), Arc::clone(&state));
        FlightGuard::new(self.clone(), key.to_string(), state, true)
    }

    fn release(&self, key: &str, flight: &Arc<FlightState>) {
        let mut map = self.map();
        if flight.release() == 0 {
            if let Some(existing) = map.get(key) {
                if Arc::ptr_eq(existing, flight) {
                    map.remove(key);
                }
            }
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.map().len()
    }
}

struct FlightState {
    notify: Notify,
    done: AtomicBool,
    refs: AtomicUsize,
}

impl FlightState {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            done: AtomicBool::new(false),
            refs: AtomicUsize::new(1),
        }
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so a finish in between is not missed
            notified.as_mut().enable();
            if self.done.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Owned handle on one flight. The leader finishes the flight when dropped,
/// on success, error or cancellation alike.
pub(crate) struct FlightGuard {
    singleflight: Singleflight,
    key: String,
    flight: Arc<FlightState>,
    is_leader: bool,
}

impl FlightGuard {
    fn new(singleflight: Singleflight, key: String, flight: Arc<FlightState>, is_leader: bool) -> Self {
        Self {
            singleflight,
            key,
            flight,
            is_leader,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub(crate) async fn wait(&self) {
        self.flight.wait().await;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.is_leader {
            self.flight.finish();
        }
        self.singleflight.release(&self.key, &self.flight);
    }
}

/// Run registry: durable outcomes plus in-process flights.
#[derive(Clone)]
pub(crate) struct RunRegistry {
    kernel: Kernel,
    flights: Singleflight,
}

impl RunRegistry {
    pub(crate) fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            flights: Singleflight::default(),
        }
    }

    pub(crate) fn begin_flight(&self, key: &RunKey) -> FlightGuard {
        self.flights.begin(&key.flight_key())
    }

    /// Stored terminal outcome for `key` when it was run as `phase`.
    pub(crate) async fn lookup(&self, key: &RunKey, phase: Phase) -> Result<Lookup> {
        let Some(row) = self
            .kernel
            .get_run_async(&key.workflow_id, &key.run_id)
            .await?
        else {
            return Ok(Lookup::Open);
        };
        if row.phase != phase.as_str() {
            return Ok(Lookup::OtherPhase(row.phase));
        }
        let Some(outcome) = row.outcome else {
            return Ok(Lookup::Open);
        };
        match row.state.as_str() {
            RUN_COMPLETED => Ok(Lookup::Stored(StoredOutcome::Completed(serde_json::from_str(&outcome)?))),
            RUN_FAILED => Ok(Lookup::Stored(StoredOutcome::Rejected(serde_json::from_str(&outcome)?))),
            _ => Ok(Lookup::Open),
        }
    }

    /// Mark the key as executing. Returns false when a pending row was left
    /// behind by an earlier process.
    pub(crate) async fn claim(&self, key: &RunKey, phase: Phase) -> Result<bool> {
        self.kernel
            .begin_run_async(&key.workflow_id, &key.run_id, phase.as_str())
            .await
    }

    pub(crate) async fn store(&self, key: &RunKey, outcome: &StoredOutcome) -> Result<()> {
        let (state, body) = match outcome {
            StoredOutcome::Completed(env) => (RUN_COMPLETED, serde_json::to_string(env)?),
            StoredOutcome::Rejected(env) => (RUN_FAILED, serde_json::to_string(env)?),
        };
        self.kernel
            .finish_run_async(&key.workflow_id, &key.run_id, state, &body)
            .await
            .map_err(|e| anyhow!("store outcome for {}/{}: {e}", key.workflow_id, key.run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_protocol::{Mode, PhaseArtifacts, PhaseResult};
    use std::time::Duration;

    fn envelope(key: &RunKey) -> RunEnvelope {
        RunEnvelope {
            workflow_id: key.workflow_id.clone(),
            run_id: key.run_id.clone(),
            result: PhaseResult {
                phase: Phase::Ack,
                written_paths: vec!["/repo/.collab/ack/manifest.json".into()],
                evidence_refs: vec!["sbom:wf".into()],
                cloudevent_ids: vec!["e1".into()],
                timestamp: "2024-01-01T00:00:00.000Z".into(),
                ts: 1_704_067_200,
                mode: Mode::Simulated,
                artifacts: PhaseArtifacts::Ack {
                    manifest: "/repo/.collab/ack/manifest.json".into(),
                },
                audit_degraded: false,
            },
        }
    }

    #[tokio::test]
    async fn stored_outcome_roundtrips_through_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::new(Kernel::open(dir.path()).unwrap());
        let key = RunKey::new("wf-1", "run-1");
        assert_eq!(registry.lookup(&key, Phase::Ack).await.unwrap(), Lookup::Open);
        assert!(registry.claim(&key, Phase::Ack).await.unwrap());
        assert_eq!(registry.lookup(&key, Phase::Ack).await.unwrap(), Lookup::Open);

        let outcome = StoredOutcome::Completed(envelope(&key));
        registry.store(&key, &outcome).await.unwrap();
        assert_eq!(
            registry.lookup(&key, Phase::Ack).await.unwrap(),
            Lookup::Stored(outcome.clone())
        );
        // a second store would overwrite a terminal outcome
        assert!(registry.store(&key, &outcome).await.is_err());
    }

    #[tokio::test]
    async fn key_claimed_by_another_phase_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RunRegistry::new(Kernel::open(dir.path()).unwrap());
        let key = RunKey::new("wf-1", "run-1");
        registry.claim(&key, Phase::Ack).await.unwrap();
        assert_eq!(
            registry.lookup(&key, Phase::Plan).await.unwrap(),
            Lookup::OtherPhase("ACK".into())
        );
        registry
            .store(&key, &StoredOutcome::Completed(envelope(&key)))
            .await
            .unwrap();
        assert_eq!(
            registry.lookup(&key, Phase::Plan).await.unwrap(),
            Lookup::OtherPhase("ACK".into())
        );
    }

    #[tokio::test]
    async fn followers_wait_for_leader() {
        let flights = Singleflight::default();
        let leader = flights.begin("k");
        assert!(leader.is_leader());
        let follower = flights.begin("k");
        assert!(!follower.is_leader());

        let waiter = tokio::spawn(async move {
            follower.wait().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(leader);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("follower released")
            .unwrap();
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn follower_joining_after_finish_does_not_hang() {
        let flights = Singleflight::default();
        let leader = flights.begin("k");
        let follower = flights.begin("k");
        drop(leader);
        tokio::time::timeout(Duration::from_secs(1), follower.wait())
            .await
            .expect("finished flight releases late waiters");
    }

    #[tokio::test]
    async fn finished_flight_is_not_rejoined() {
        let flights = Singleflight::default();
        let leader = flights.begin("k");
        let late = flights.begin("k");
        drop(leader);
        let next = flights.begin("k");
        assert!(next.is_leader());
        late.wait().await;
        drop(late);
        assert_eq!(flights.in_flight(), 1);
    }

    #[test]
    fn distinct_keys_fly_independently() {
        let flights = Singleflight::default();
        let a = flights.begin("a");
        let b = flights.begin("b");
        assert!(a.is_leader() && b.is_leader());
        assert_eq!(flights.in_flight(), 2);
    }
}
