//! Audit event emitter.
//!
//! Every event is appended to the kernel journal before any delivery is
//! attempted, so an event that was handed to [`AuditEmitter::emit`] is never
//! lost: it is either delivered synchronously or left `pending` for the
//! replay sweep. Delivery per subject follows journal order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kb_events::{AuditEvent, Bus, EventSink};
use kb_kernel::{JournalRow, Kernel, NewJournalEntry, JOURNAL_DELIVERED};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::tasks::{spawn_supervised, TaskHandle};

const REPLAY_BATCH: i64 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EmitSettings {
    /// Retries after the first synchronous attempt.
    pub retries: u32,
    /// Base delay between synchronous attempts; doubles each retry.
    pub backoff: Duration,
    pub attempt_timeout: Duration,
    pub replay_interval: Duration,
    pub replay_backoff_max: Duration,
}

impl Default for EmitSettings {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(50),
            attempt_timeout: Duration::from_millis(2_000),
            replay_interval: Duration::from_millis(1_000),
            replay_backoff_max: Duration::from_millis(60_000),
        }
    }
}

impl EmitSettings {
    /// Upper bound on how long a synchronous delivery can hold a row.
    fn sync_window(&self) -> Duration {
        let attempts = self.retries.saturating_add(1);
        let mut total = self.attempt_timeout.saturating_mul(attempts);
        for n in 0..self.retries {
            total = total.saturating_add(self.retry_delay(n));
        }
        total
    }

    fn retry_delay(&self, n: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << n.min(16))
    }

    /// Delay before the sweep retries a row that has failed `attempts` times.
    fn replay_delay(&self, attempts: i64) -> Duration {
        let shift = attempts.clamp(0, 16) as u32;
        let base = self.replay_interval.max(Duration::from_millis(1));
        base.saturating_mul(1u32 << shift).min(self.replay_backoff_max)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EmitError {
    #[error("encode audit event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("audit journal unavailable: {0}")]
    Journal(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EmitReceipt {
    pub id: String,
    /// False when the event is journaled but still waiting for delivery.
    pub delivered: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ReplayStats {
    pub delivered: usize,
    pub failed: usize,
    pub deferred: usize,
}

pub(crate) struct AuditEmitter {
    kernel: Kernel,
    sink: Arc<dyn EventSink>,
    bus: Bus,
    settings: EmitSettings,
    sweep_lock: Mutex<()>,
    sweeps: AtomicU64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl AuditEmitter {
    pub(crate) fn new(kernel: Kernel, sink: Arc<dyn EventSink>, bus: Bus, settings: EmitSettings) -> Self {
        Self {
            kernel,
            sink,
            bus,
            settings,
            sweep_lock: Mutex::new(()),
            sweeps: AtomicU64::new(0),
        }
    }

    pub(crate) fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Journal `event`, then try to deliver it.
    ///
    /// Only a journal failure is an error; delivery trouble is reported
    /// through [`EmitReceipt::delivered`].
    pub(crate) async fn emit(&self, event: &AuditEvent) -> Result<EmitReceipt, EmitError> {
        let body = serde_json::to_string(event)?;
        let lease = now_ms().saturating_add(millis(self.settings.sync_window()));
        let entry = NewJournalEntry {
            id: event.id.clone(),
            kind: event.kind.clone(),
            subject: event.subject.clone(),
            time: event.time.clone(),
            body,
            next_attempt_ms: lease,
        };
        let appended = self
            .kernel
            .append_journal_async(&entry)
            .await
            .map_err(EmitError::Journal)?;
        if !appended {
            let delivered = self
                .kernel
                .journal_entry_async(&event.id)
                .await
                .map_err(EmitError::Journal)?
                .is_some_and(|row| row.status == JOURNAL_DELIVERED);
            return Ok(EmitReceipt {
                id: event.id.clone(),
                delivered,
            });
        }
        self.bus.publish(event);

        let blocked = self
            .kernel
            .has_pending_before_async(&event.subject, &event.id)
            .await
            .map_err(EmitError::Journal)?;
        if blocked {
            debug!(event_id = %event.id, subject = %event.subject, "earlier events pending; deferring to replay");
            self.defer(&event.id, 0, "waiting for earlier events", now_ms())
                .await;
            return Ok(EmitReceipt {
                id: event.id.clone(),
                delivered: false,
            });
        }

        let mut last_error = String::new();
        let attempts = self.settings.retries.saturating_add(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.retry_delay(attempt - 1)).await;
            }
            match self.deliver_once(event).await {
                Ok(()) => {
                    self.mark_delivered(&event.id).await;
                    return Ok(EmitReceipt {
                        id: event.id.clone(),
                        delivered: true,
                    });
                }
                Err(err) => {
                    debug!(event_id = %event.id, attempt, "audit delivery attempt failed: {err}");
                    last_error = err;
                }
            }
        }
        warn!(
            event_id = %event.id,
            kind = %event.kind,
            attempts,
            "audit delivery exhausted retries; left pending for replay: {last_error}"
        );
        let next = now_ms().saturating_add(millis(self.settings.replay_delay(0)));
        self.defer(&event.id, i64::from(attempts), &last_error, next)
            .await;
        Ok(EmitReceipt {
            id: event.id.clone(),
            delivered: false,
        })
    }

    async fn deliver_once(&self, event: &AuditEvent) -> Result<(), String> {
        match tokio::time::timeout(self.settings.attempt_timeout, self.sink.deliver(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "delivery timed out after {}ms",
                self.settings.attempt_timeout.as_millis()
            )),
        }
    }

    async fn mark_delivered(&self, id: &str) {
        if let Err(err) = self.kernel.mark_delivered_async(id).await {
            // row stays pending; the sweep delivers it again
            warn!(event_id = %id, "failed to mark audit event delivered: {err}");
        }
    }

    async fn defer(&self, id: &str, attempts: i64, error: &str, next_attempt_ms: i64) {
        if let Err(err) = self
            .kernel
            .record_delivery_failure_async(id, attempts, error, next_attempt_ms)
            .await
        {
            warn!(event_id = %id, "failed to record audit delivery failure: {err}");
        }
    }

    /// Redeliver pending events whose backoff has elapsed, oldest first.
    /// A subject is skipped for the rest of the pass after its first
    /// failure or not-yet-due row. The journal is read page by page, so
    /// rows queued behind a stuck subject are still reached.
    pub(crate) async fn replay_pending(&self) -> Result<ReplayStats> {
        let _sweep = self.sweep_lock.lock().await;
        let now = now_ms();
        let mut stats = ReplayStats::default();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut after_seq = 0;
        loop {
            let rows = self.kernel.pending_journal_async(after_seq, REPLAY_BATCH).await?;
            let Some(last) = rows.last() else {
                break;
            };
            after_seq = last.seq;
            let full_page = rows.len() as i64 == REPLAY_BATCH;
            self.replay_page(rows, now, &mut blocked, &mut stats).await;
            if !full_page {
                break;
            }
        }
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        if stats.delivered > 0 || stats.failed > 0 {
            info!(
                delivered = stats.delivered,
                failed = stats.failed,
                deferred = stats.deferred,
                "audit replay pass"
            );
        }
        Ok(stats)
    }

    async fn replay_page(
        &self,
        rows: Vec<JournalRow>,
        now: i64,
        blocked: &mut HashSet<String>,
        stats: &mut ReplayStats,
    ) {
        for row in rows {
            if blocked.contains(&row.subject) {
                stats.deferred += 1;
                continue;
            }
            if row.next_attempt_ms > now {
                blocked.insert(row.subject.clone());
                stats.deferred += 1;
                continue;
            }
            match self.replay_row(&row).await {
                Ok(()) => {
                    self.mark_delivered(&row.id).await;
                    stats.delivered += 1;
                }
                Err(err) => {
                    let attempts = row.attempts.saturating_add(1);
                    let next = now.saturating_add(millis(self.settings.replay_delay(attempts)));
                    self.defer(&row.id, 1, &err, next).await;
                    blocked.insert(row.subject.clone());
                    stats.failed += 1;
                }
            }
        }
    }

    async fn replay_row(&self, row: &JournalRow) -> Result<(), String> {
        let event: AuditEvent = serde_json::from_str(&row.body)
            .map_err(|err| format!("journal body for {} unreadable: {err}", row.id))?;
        self.deliver_once(&event).await
    }

    /// Stored event by id, read from the journal.
    pub(crate) async fn get(&self, id: &str) -> Result<Option<AuditEvent>> {
        match self.kernel.journal_entry_async(id).await? {
            Some(row) => Ok(Some(serde_json::from_str(&row.body)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn is_delivered(&self, id: &str) -> Result<bool> {
        Ok(self
            .kernel
            .journal_entry_async(id)
            .await?
            .is_some_and(|row| row.status == JOURNAL_DELIVERED))
    }

    /// Poll the journal until `id` is delivered or `within` elapses, running
    /// replay passes in between.
    pub(crate) async fn await_delivery(&self, id: &str, within: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if self.is_delivered(id).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            self.replay_pending().await?;
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub(crate) async fn pending_count(&self) -> Result<i64> {
        self.kernel.count_pending_async().await
    }

    /// Whether at least one replay pass has completed.
    pub(crate) fn swept(&self) -> bool {
        self.sweeps.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn spawn_replay(self: &Arc<Self>) -> TaskHandle {
        let emitter = Arc::clone(self);
        spawn_supervised("audit.replay", move || {
            let emitter = Arc::clone(&emitter);
            async move {
                let mut ticker = tokio::time::interval(emitter.settings.replay_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(err) = emitter.replay_pending().await {
                        warn!("audit replay pass failed: {err}");
                    }
                }
            }
        })
    }
}
