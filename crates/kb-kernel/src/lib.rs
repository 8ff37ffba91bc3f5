//! Durable state for the orchestrator: the write-ahead audit journal, the
//! run-result store keyed by `(workflow_id, run_id)`, and the worldview
//! pointer table with its switch log. Backed by a single SQLite file.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const JOURNAL_PENDING: &str = "pending";
pub const JOURNAL_DELIVERED: &str = "delivered";

pub const RUN_PENDING: &str = "pending";
pub const RUN_COMPLETED: &str = "completed";
pub const RUN_FAILED: &str = "failed";

pub const SWITCH_PREPARED: &str = "prepared";
pub const SWITCH_COMMITTED: &str = "committed";
pub const SWITCH_ABORTED: &str = "aborted";
pub const SWITCH_ROLLED_BACK: &str = "rolled_back";

/// Default SQLite busy timeout for every connection.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    busy_timeout: Duration,
}

/// One audit event as stored in the journal. `body` is the serialized event.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JournalRow {
    pub seq: i64,
    pub id: String,
    pub kind: String,
    pub subject: String,
    pub time: String,
    pub body: String,
    pub status: String,
    pub attempts: i64,
    pub next_attempt_ms: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewJournalEntry {
    pub id: String,
    pub kind: String,
    pub subject: String,
    pub time: String,
    pub body: String,
    /// Earliest time (unix ms) the replay sweep may pick the row up.
    pub next_attempt_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunRow {
    pub workflow_id: String,
    pub run_id: String,
    pub phase: String,
    pub state: String,
    pub outcome: Option<String>,
    pub created: String,
    pub updated: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SwitchRow {
    pub id: String,
    pub mode: String,
    pub bundle_version: String,
    pub fga_model_id: String,
    pub thresholds_hash: String,
    pub consistency: String,
    pub state: String,
    pub error: Option<String>,
    pub created: String,
    pub updated: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LiveWorldview {
    pub switch_id: String,
    pub mode: String,
    pub bundle_version: String,
    pub fga_model_id: String,
    pub thresholds_hash: String,
    pub effective_at: String,
}

fn now_str() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(dir, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
    }

    /// Open (creating if needed) `<dir>/kb.sqlite`; connections wait up to
    /// `busy_timeout` for a lock held by another connection.
    pub fn open_with_busy_timeout(dir: &Path, busy_timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("kb.sqlite");
        let kernel = Self {
            db_path,
            busy_timeout,
        };
        let conn = kernel.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        // FULL: the journal is the durability boundary for audit events.
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init_schema(&conn)?;
        Ok(kernel)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_journal (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              kind TEXT NOT NULL,
              subject TEXT NOT NULL,
              time TEXT NOT NULL,
              body TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'pending',
              attempts INTEGER NOT NULL DEFAULT 0,
              next_attempt_ms INTEGER NOT NULL DEFAULT 0,
              last_error TEXT,
              delivered_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_journal_status ON audit_journal(status, seq);
            CREATE INDEX IF NOT EXISTS idx_journal_subject ON audit_journal(subject, seq);

            CREATE TABLE IF NOT EXISTS runs (
              workflow_id TEXT NOT NULL,
              run_id TEXT NOT NULL,
              phase TEXT NOT NULL,
              state TEXT NOT NULL,
              outcome TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL,
              PRIMARY KEY (workflow_id, run_id)
            );
            CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);

            -- Single row: the committed policy-bundle / access-model pair.
            CREATE TABLE IF NOT EXISTS worldview_live (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              switch_id TEXT NOT NULL,
              mode TEXT NOT NULL,
              bundle_version TEXT NOT NULL,
              fga_model_id TEXT NOT NULL,
              thresholds_hash TEXT NOT NULL,
              effective_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS worldview_switches (
              id TEXT PRIMARY KEY,
              mode TEXT NOT NULL,
              bundle_version TEXT NOT NULL,
              fga_model_id TEXT NOT NULL,
              thresholds_hash TEXT NOT NULL,
              consistency TEXT NOT NULL,
              state TEXT NOT NULL,
              error TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_switches_state ON worldview_switches(state);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    // ---------------- Audit journal ----------------

    /// Append an event; returns false when the id was already journaled.
    pub fn append_journal(&self, entry: &NewJournalEntry) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO audit_journal(id,kind,subject,time,body,status,next_attempt_ms) VALUES (?,?,?,?,?,?,?)",
            params![
                entry.id,
                entry.kind,
                entry.subject,
                entry.time,
                entry.body,
                JOURNAL_PENDING,
                entry.next_attempt_ms
            ],
        )?;
        Ok(n == 1)
    }

    pub fn journal_entry(&self, id: &str) -> Result<Option<JournalRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT seq,id,kind,subject,time,body,status,attempts,next_attempt_ms,last_error FROM audit_journal WHERE id=?",
                params![id],
                journal_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Whether an older event for the same subject is still undelivered.
    pub fn has_pending_before(&self, subject: &str, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM audit_journal WHERE subject=?1 AND status='pending' AND seq < (SELECT seq FROM audit_journal WHERE id=?2))",
            params![subject, id],
            |r| r.get(0),
        )?;
        Ok(exists != 0)
    }

    pub fn mark_delivered(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE audit_journal SET status=?, delivered_at=?, last_error=NULL WHERE id=?",
            params![JOURNAL_DELIVERED, now_str(), id],
        )?;
        Ok(n == 1)
    }

    pub fn record_delivery_failure(
        &self,
        id: &str,
        attempts: i64,
        error: &str,
        next_attempt_ms: i64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE audit_journal SET attempts=attempts+?, last_error=?, next_attempt_ms=? WHERE id=? AND status='pending'",
            params![attempts, error, next_attempt_ms, id],
        )?;
        Ok(())
    }

    /// Pending events with `seq > after_seq`, oldest first. Pass the last
    /// `seq` of one page as `after_seq` to read the next.
    pub fn pending_journal(&self, after_seq: i64, limit: i64) -> Result<Vec<JournalRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq,id,kind,subject,time,body,status,attempts,next_attempt_ms,last_error FROM audit_journal WHERE status='pending' AND seq > ? ORDER BY seq ASC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![after_seq, limit], journal_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_pending(&self) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_journal WHERE status='pending'",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    // ---------------- Runs ----------------

    pub fn get_run(&self, workflow_id: &str, run_id: &str) -> Result<Option<RunRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT workflow_id,run_id,phase,state,outcome,created,updated FROM runs WHERE workflow_id=? AND run_id=?",
                params![workflow_id, run_id],
                run_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Record a run as pending; returns false when the key already exists.
    pub fn begin_run(&self, workflow_id: &str, run_id: &str, phase: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_str();
        let n = conn.execute(
            "INSERT OR IGNORE INTO runs(workflow_id,run_id,phase,state,created,updated) VALUES (?,?,?,?,?,?)",
            params![workflow_id, run_id, phase, RUN_PENDING, now, now],
        )?;
        Ok(n == 1)
    }

    /// Store the terminal outcome of a run. Only a pending run can be finished.
    pub fn finish_run(
        &self,
        workflow_id: &str,
        run_id: &str,
        state: &str,
        outcome: &str,
    ) -> Result<()> {
        if state == RUN_PENDING {
            return Err(anyhow!("finish_run requires a terminal state"));
        }
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE runs SET state=?, outcome=?, updated=? WHERE workflow_id=? AND run_id=? AND state='pending'",
            params![state, outcome, now_str(), workflow_id, run_id],
        )?;
        if n != 1 {
            return Err(anyhow!(
                "run {workflow_id}/{run_id} is not pending; refusing to overwrite outcome"
            ));
        }
        Ok(())
    }

    // ---------------- Worldview ----------------

    pub fn live_worldview(&self) -> Result<Option<LiveWorldview>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT switch_id,mode,bundle_version,fga_model_id,thresholds_hash,effective_at FROM worldview_live WHERE id=1",
                [],
                |r| {
                    Ok(LiveWorldview {
                        switch_id: r.get(0)?,
                        mode: r.get(1)?,
                        bundle_version: r.get(2)?,
                        fga_model_id: r.get(3)?,
                        thresholds_hash: r.get(4)?,
                        effective_at: r.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Stage a validated switch without touching the live pointers.
    pub fn stage_switch(&self, row: &SwitchRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO worldview_switches(id,mode,bundle_version,fga_model_id,thresholds_hash,consistency,state,error,created,updated) VALUES (?,?,?,?,?,?,?,?,?,?)",
            params![
                row.id,
                row.mode,
                row.bundle_version,
                row.fga_model_id,
                row.thresholds_hash,
                row.consistency,
                SWITCH_PREPARED,
                row.error,
                row.created,
                row.updated
            ],
        )?;
        Ok(())
    }

    /// Log a switch that failed before it could be staged.
    pub fn record_aborted_switch(&self, row: &SwitchRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO worldview_switches(id,mode,bundle_version,fga_model_id,thresholds_hash,consistency,state,error,created,updated) VALUES (?,?,?,?,?,?,?,?,?,?)",
            params![
                row.id,
                row.mode,
                row.bundle_version,
                row.fga_model_id,
                row.thresholds_hash,
                row.consistency,
                SWITCH_ABORTED,
                row.error,
                row.created,
                row.updated
            ],
        )?;
        Ok(())
    }

    /// Flip both live pointers to a prepared switch in one transaction.
    pub fn commit_switch(&self, id: &str, effective_at: &str) -> Result<LiveWorldview> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let staged = tx
            .query_row(
                "SELECT id,mode,bundle_version,fga_model_id,thresholds_hash,consistency,state,error,created,updated FROM worldview_switches WHERE id=?",
                params![id],
                switch_row,
            )
            .optional()?
            .ok_or_else(|| anyhow!("switch {id} not found"))?;
        if staged.state != SWITCH_PREPARED {
            return Err(anyhow!("switch {id} is {}, not prepared", staged.state));
        }
        tx.execute(
            "INSERT INTO worldview_live(id,switch_id,mode,bundle_version,fga_model_id,thresholds_hash,effective_at) VALUES (1,?,?,?,?,?,?)
             ON CONFLICT(id) DO UPDATE SET switch_id=excluded.switch_id, mode=excluded.mode, bundle_version=excluded.bundle_version,
               fga_model_id=excluded.fga_model_id, thresholds_hash=excluded.thresholds_hash, effective_at=excluded.effective_at",
            params![
                staged.id,
                staged.mode,
                staged.bundle_version,
                staged.fga_model_id,
                staged.thresholds_hash,
                effective_at
            ],
        )?;
        tx.execute(
            "UPDATE worldview_switches SET state=?, updated=? WHERE id=?",
            params![SWITCH_COMMITTED, now_str(), id],
        )?;
        tx.commit()?;
        Ok(LiveWorldview {
            switch_id: staged.id,
            mode: staged.mode,
            bundle_version: staged.bundle_version,
            fga_model_id: staged.fga_model_id,
            thresholds_hash: staged.thresholds_hash,
            effective_at: effective_at.to_string(),
        })
    }

    pub fn abort_switch(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE worldview_switches SET state=?, error=?, updated=? WHERE id=? AND state='prepared'",
            params![SWITCH_ABORTED, error, now_str(), id],
        )?;
        Ok(())
    }

    /// Roll back switches left `prepared` by a crash. Live pointers are
    /// untouched, so they keep the last committed pair.
    pub fn recover_prepared_switches(&self) -> Result<Vec<SwitchRow>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut out = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id,mode,bundle_version,fga_model_id,thresholds_hash,consistency,state,error,created,updated FROM worldview_switches WHERE state='prepared' ORDER BY created ASC",
            )?;
            let rows = stmt.query_map([], switch_row)?;
            for row in rows {
                out.push(row?);
            }
        }
        let now = now_str();
        for row in out.iter_mut() {
            tx.execute(
                "UPDATE worldview_switches SET state=?, error=?, updated=? WHERE id=?",
                params![SWITCH_ROLLED_BACK, "incomplete at restart", now, row.id],
            )?;
            row.state = SWITCH_ROLLED_BACK.to_string();
            row.error = Some("incomplete at restart".to_string());
            row.updated = now.clone();
        }
        tx.commit()?;
        Ok(out)
    }

    /// Most recent resolved switches, newest first.
    pub fn switch_history(&self, limit: i64) -> Result<Vec<SwitchRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,mode,bundle_version,fga_model_id,thresholds_hash,consistency,state,error,created,updated FROM worldview_switches WHERE state<>'prepared' ORDER BY updated DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit], switch_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_switches(&self) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM worldview_switches WHERE state<>'prepared'",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from async executors.

    pub async fn append_journal_async(&self, entry: &NewJournalEntry) -> Result<bool> {
        let k = self.clone();
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || k.append_journal(&entry))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn journal_entry_async(&self, id: &str) -> Result<Option<JournalRow>> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.journal_entry(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn has_pending_before_async(&self, subject: &str, id: &str) -> Result<bool> {
        let k = self.clone();
        let subject = subject.to_string();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.has_pending_before(&subject, &id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn mark_delivered_async(&self, id: &str) -> Result<bool> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.mark_delivered(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn record_delivery_failure_async(
        &self,
        id: &str,
        attempts: i64,
        error: &str,
        next_attempt_ms: i64,
    ) -> Result<()> {
        let k = self.clone();
        let id = id.to_string();
        let error = error.to_string();
        tokio::task::spawn_blocking(move || {
            k.record_delivery_failure(&id, attempts, &error, next_attempt_ms)
        })
        .await
        .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn pending_journal_async(&self, after_seq: i64, limit: i64) -> Result<Vec<JournalRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.pending_journal(after_seq, limit))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn count_pending_async(&self) -> Result<i64> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.count_pending())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_run_async(&self, workflow_id: &str, run_id: &str) -> Result<Option<RunRow>> {
        let k = self.clone();
        let wf = workflow_id.to_string();
        let run = run_id.to_string();
        tokio::task::spawn_blocking(move || k.get_run(&wf, &run))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn begin_run_async(
        &self,
        workflow_id: &str,
        run_id: &str,
        phase: &str,
    ) -> Result<bool> {
        let k = self.clone();
        let wf = workflow_id.to_string();
        let run = run_id.to_string();
        let phase = phase.to_string();
        tokio::task::spawn_blocking(move || k.begin_run(&wf, &run, &phase))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn finish_run_async(
        &self,
        workflow_id: &str,
        run_id: &str,
        state: &str,
        outcome: &str,
    ) -> Result<()> {
        let k = self.clone();
        let wf = workflow_id.to_string();
        let run = run_id.to_string();
        let state = state.to_string();
        let outcome = outcome.to_string();
        tokio::task::spawn_blocking(move || k.finish_run(&wf, &run, &state, &outcome))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn live_worldview_async(&self) -> Result<Option<LiveWorldview>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.live_worldview())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn stage_switch_async(&self, row: &SwitchRow) -> Result<()> {
        let k = self.clone();
        let row = row.clone();
        tokio::task::spawn_blocking(move || k.stage_switch(&row))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn record_aborted_switch_async(&self, row: &SwitchRow) -> Result<()> {
        let k = self.clone();
        let row = row.clone();
        tokio::task::spawn_blocking(move || k.record_aborted_switch(&row))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn commit_switch_async(&self, id: &str, effective_at: &str) -> Result<LiveWorldview> {
        let k = self.clone();
        let id = id.to_string();
        let at = effective_at.to_string();
        tokio::task::spawn_blocking(move || k.commit_switch(&id, &at))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn abort_switch_async(&self, id: &str, error: &str) -> Result<()> {
        let k = self.clone();
        let id = id.to_string();
        let error = error.to_string();
        tokio::task::spawn_blocking(move || k.abort_switch(&id, &error))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn recover_prepared_switches_async(&self) -> Result<Vec<SwitchRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.recover_prepared_switches())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn switch_history_async(&self, limit: i64) -> Result<Vec<SwitchRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.switch_history(limit))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn count_switches_async(&self) -> Result<i64> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.count_switches())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}

fn journal_row(r: &Row<'_>) -> rusqlite::Result<JournalRow> {
    Ok(JournalRow {
        seq: r.get(0)?,
        id: r.get(1)?,
        kind: r.get(2)?,
        subject: r.get(3)?,
        time: r.get(4)?,
        body: r.get(5)?,
        status: r.get(6)?,
        attempts: r.get(7)?,
        next_attempt_ms: r.get(8)?,
        last_error: r.get(9)?,
    })
}

fn run_row(r: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        workflow_id: r.get(0)?,
        run_id: r.get(1)?,
        phase: r.get(2)?,
        state: r.get(3)?,
        outcome: r.get(4)?,
        created: r.get(5)?,
        updated: r.get(6)?,
    })
}

fn switch_row(r: &Row<'_>) -> rusqlite::Result<SwitchRow> {
    Ok(SwitchRow {
        id: r.get(0)?,
        mode: r.get(1)?,
        bundle_version: r.get(2)?,
        fga_model_id: r.get(3)?,
        thresholds_hash: r.get(4)?,
        consistency: r.get(5)?,
        state: r.get(6)?,
        error: r.get(7)?,
        created: r.get(8)?,
        updated: r.get(9)?,
    })
}
