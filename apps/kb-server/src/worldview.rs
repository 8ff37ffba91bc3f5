//! Mode/worldview switch coordination.
//!
//! A switch is prepared (bundle and access model loaded and validated, row
//! staged as `prepared`), then committed in one kernel transaction that
//! flips both live pointers. Only after commit is the in-memory
//! [`ModeConfig`] snapshot replaced, so readers always observe either the
//! old pair or the new pair.

use std::sync::Arc;
use std::time::Duration;

use kb_events::{AuditData, AuditEvent};
use kb_kernel::{Kernel, LiveWorldview, SwitchRow, SWITCH_ABORTED, SWITCH_PREPARED};
use kb_protocol::{Consistency, Mode, ModeConfig, SwitchRequest, SwitchResponse, WorldviewPointers};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::audit::AuditEmitter;
use crate::bundles::{CatalogError, WorldviewCatalog};
use crate::engine::valid_id;

pub(crate) const HISTORY_LIMIT: i64 = 32;

/// Holder of the current [`ModeConfig`]; readers take cheap `Arc` snapshots.
pub(crate) struct ModeHandle {
    current: RwLock<Arc<ModeConfig>>,
}

impl ModeHandle {
    pub(crate) fn new(initial: ModeConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<ModeConfig> {
        Arc::clone(&self.current.read())
    }

    /// Publish a new snapshot with a bumped version.
    fn apply(&self, mode: Mode, pointers: WorldviewPointers) -> Arc<ModeConfig> {
        let mut guard = self.current.write();
        let mut next = ModeConfig::clone(&guard);
        next.version = next.version.saturating_add(1);
        next.mode = mode;
        next.worldview = Some(pointers);
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        next
    }
}

fn pointers_from(live: &LiveWorldview) -> WorldviewPointers {
    WorldviewPointers {
        bundle_version: live.bundle_version.clone(),
        fga_model_id: live.fga_model_id.clone(),
        thresholds_hash: live.thresholds_hash.clone(),
        effective_at: live.effective_at.clone(),
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SwitchError {
    #[error("a worldview switch is already in progress")]
    Conflict,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    /// Committed locally, but the switch event was not delivered in time.
    #[error("switch committed but event {} is not yet delivered", .response.event_id)]
    DeliveryPending { response: SwitchResponse },
    #[error("{0}")]
    Internal(String),
}

impl From<CatalogError> for SwitchError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound { .. } => SwitchError::NotFound(err.to_string()),
            CatalogError::Invalid { .. } => SwitchError::Invalid(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SwitchHistory {
    pub count: i64,
    pub last: Vec<SwitchRow>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ModeStatus {
    pub config: ModeConfig,
    pub switching: bool,
    pub history: SwitchHistory,
}

pub(crate) struct SwitchCoordinator {
    kernel: Kernel,
    emitter: Arc<AuditEmitter>,
    catalog: Arc<dyn WorldviewCatalog>,
    mode: Arc<ModeHandle>,
    switch_lock: Mutex<()>,
    strong_wait: Duration,
}

impl SwitchCoordinator {
    pub(crate) fn new(
        kernel: Kernel,
        emitter: Arc<AuditEmitter>,
        catalog: Arc<dyn WorldviewCatalog>,
        mode: Arc<ModeHandle>,
        strong_wait: Duration,
    ) -> Self {
        Self {
            kernel,
            emitter,
            catalog,
            mode,
            switch_lock: Mutex::new(()),
            strong_wait,
        }
    }

    /// Startup recovery: roll back switches a crash left `prepared`, then
    /// load the last committed pointers into the live snapshot.
    pub(crate) async fn recover(&self) -> anyhow::Result<()> {
        let rolled_back = self.kernel.recover_prepared_switches_async().await?;
        let live = self.kernel.live_worldview_async().await?;
        for row in &rolled_back {
            warn!(switch_id = %row.id, bundle_version = %row.bundle_version, fga_model_id = %row.fga_model_id, "rolling back incomplete worldview switch");
            let event = AuditEvent::new(
                kb_topics::TOPIC_WORLDVIEW_ROLLED_BACK,
                kb_topics::SUBJECT_WORLDVIEW,
                AuditData::WorldviewRolledBack {
                    switch_id: row.id.clone(),
                    bundle_version: row.bundle_version.clone(),
                    fga_model_id: row.fga_model_id.clone(),
                    restored_bundle_version: live.as_ref().map(|l| l.bundle_version.clone()),
                    restored_fga_model_id: live.as_ref().map(|l| l.fga_model_id.clone()),
                },
            );
            self.emitter.emit(&event).await?;
        }
        if let Some(live) = live {
            let mode = Mode::parse(&live.mode).unwrap_or(self.mode.snapshot().mode);
            let snapshot = self.mode.apply(mode, pointers_from(&live));
            info!(
                bundle_version = %live.bundle_version,
                fga_model_id = %live.fga_model_id,
                version = snapshot.version,
                "restored live worldview"
            );
        }
        Ok(())
    }

    pub(crate) async fn switch(
        &self,
        request: SwitchRequest,
        consistency: Consistency,
    ) -> Result<SwitchResponse, SwitchError> {
        let _guard = self.switch_lock.try_lock().map_err(|_| SwitchError::Conflict)?;

        for (field, value) in [
            ("bundleVersion", &request.bundle_version),
            ("fgaModelId", &request.fga_model_id),
        ] {
            if !valid_id(value) {
                return Err(SwitchError::BadRequest(format!(
                    "{field} must match [A-Za-z0-9._:-]{{1,128}}"
                )));
            }
        }
        let target_mode = request.mode.unwrap_or(self.mode.snapshot().mode);

        let thresholds_hash = match self.prepare(&request).await {
            Ok(hash) => hash,
            Err(err) => {
                let reason = err.to_string();
                let mut row = switch_row(&request, target_mode, consistency, String::new());
                row.state = SWITCH_ABORTED.into();
                row.error = Some(reason.clone());
                if let Err(log_err) = self.kernel.record_aborted_switch_async(&row).await {
                    warn!(switch_id = %row.id, "failed to log aborted switch: {log_err}");
                }
                self.emit_aborted(&request, &reason).await;
                return Err(err);
            }
        };

        let row = switch_row(&request, target_mode, consistency, thresholds_hash);
        self.kernel
            .stage_switch_async(&row)
            .await
            .map_err(|e| SwitchError::Internal(format!("stage switch: {e}")))?;

        let effective_at = kb_events::now_rfc3339();
        let live = match self.kernel.commit_switch_async(&row.id, &effective_at).await {
            Ok(live) => live,
            Err(err) => {
                let reason = format!("commit failed: {err}");
                if let Err(abort_err) = self.kernel.abort_switch_async(&row.id, &reason).await {
                    warn!(switch_id = %row.id, "failed to mark switch aborted: {abort_err}");
                }
                self.emit_aborted(&request, &reason).await;
                return Err(SwitchError::Internal(reason));
            }
        };
        let snapshot = self.mode.apply(target_mode, pointers_from(&live));

        let event = AuditEvent::new(
            kb_topics::TOPIC_WORLDVIEW_SWITCHED,
            kb_topics::SUBJECT_WORLDVIEW,
            AuditData::WorldviewSwitched {
                switch_id: live.switch_id.clone(),
                mode: target_mode,
                bundle_version: live.bundle_version.clone(),
                fga_model_id: live.fga_model_id.clone(),
                thresholds_hash: live.thresholds_hash.clone(),
                effective_at: live.effective_at.clone(),
            },
        );
        let receipt = self
            .emitter
            .emit(&event)
            .await
            .map_err(|e| SwitchError::Internal(format!("switch committed, audit failed: {e}")))?;
        info!(
            switch_id = %live.switch_id,
            bundle_version = %live.bundle_version,
            fga_model_id = %live.fga_model_id,
            version = snapshot.version,
            event_id = %receipt.id,
            "worldview switched"
        );

        let response = SwitchResponse {
            mode: target_mode,
            bundle_version: live.bundle_version,
            fga_model_id: live.fga_model_id,
            thresholds_hash: live.thresholds_hash,
            effective_at: live.effective_at,
            event_id: receipt.id.clone(),
        };
        if consistency == Consistency::Strong && !receipt.delivered {
            let delivered = self
                .emitter
                .await_delivery(&receipt.id, self.strong_wait)
                .await
                .unwrap_or(false);
            if !delivered {
                return Err(SwitchError::DeliveryPending { response });
            }
        }
        Ok(response)
    }

    async fn prepare(&self, request: &SwitchRequest) -> Result<String, SwitchError> {
        let bundle = self.catalog.policy_bundle(&request.bundle_version).await?;
        self.catalog.access_model(&request.fga_model_id).await?;
        Ok(bundle.thresholds_hash()?)
    }

    async fn emit_aborted(&self, request: &SwitchRequest, reason: &str) {
        let event = AuditEvent::new(
            kb_topics::TOPIC_WORLDVIEW_ABORTED,
            kb_topics::SUBJECT_WORLDVIEW,
            AuditData::WorldviewAborted {
                bundle_version: request.bundle_version.clone(),
                fga_model_id: request.fga_model_id.clone(),
                reason: reason.to_string(),
            },
        );
        if let Err(err) = self.emitter.emit(&event).await {
            warn!("failed to journal worldview abort: {err}");
        }
    }

    pub(crate) async fn status(&self) -> anyhow::Result<ModeStatus> {
        let switching = self.switch_lock.try_lock().is_err();
        let count = self.kernel.count_switches_async().await?;
        let last = self.kernel.switch_history_async(HISTORY_LIMIT).await?;
        Ok(ModeStatus {
            config: ModeConfig::clone(&self.mode.snapshot()),
            switching,
            history: SwitchHistory { count, last },
        })
    }
}

/// A fresh `prepared` switch row for `request`.
fn switch_row(
    request: &SwitchRequest,
    mode: Mode,
    consistency: Consistency,
    thresholds_hash: String,
) -> SwitchRow {
    let now = kb_events::now_rfc3339();
    SwitchRow {
        id: uuid::Uuid::new_v4().to_string(),
        mode: mode.as_str().to_string(),
        bundle_version: request.bundle_version.clone(),
        fga_model_id: request.fga_model_id.clone(),
        thresholds_hash,
        consistency: match consistency {
            Consistency::Strong => "strong".into(),
            Consistency::Eventual => "eventual".into(),
        },
        state: SWITCH_PREPARED.into(),
        error: None,
        created: now.clone(),
        updated: now,
    }
}
