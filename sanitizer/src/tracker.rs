//! Run progress and results.
//!
//! The tracker owns the `ExecutionReport` while a run is in flight. Callers
//! can take a snapshot at any time or subscribe to the progress stream; the
//! orchestrator seals the report with `finalize`.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::PhaseFailure;
use crate::resequence::BatchProgress;

// ---------- result types ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Success,
    Failed,
    Skipped,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Success => "success",
            TableStatus::Failed => "failed",
            TableStatus::Skipped => "skipped",
        }
    }
}

/// Outcome for one table.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub table: String,
    pub status: TableStatus,
    pub rows_before: u64,
    pub rows_after: u64,
    pub rows_deleted: u64,
    pub gaps_removed: u64,
    pub rows_renumbered: u64,
    /// One line per phase that applied.
    pub changes: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<PhaseFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    #[serde(skip)]
    clock: Instant,
}

impl ProcessingResult {
    pub fn start(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            status: TableStatus::Success,
            rows_before: 0,
            rows_after: 0,
            rows_deleted: 0,
            gaps_removed: 0,
            rows_renumbered: 0,
            changes: Vec::new(),
            warnings: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            clock: Instant::now(),
        }
    }

    pub fn skipped(table: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::start(table);
        result.changes.push(reason.into());
        result.finish(TableStatus::Skipped);
        result
    }

    pub fn finish(&mut self, status: TableStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.duration_ms = self.clock.elapsed().as_millis() as u64;
    }

    pub fn fail(&mut self, failure: PhaseFailure) {
        self.error = Some(failure);
        self.finish(TableStatus::Failed);
    }
}

/// Aggregate of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tables_planned: usize,
    pub results: Vec<ProcessingResult>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Stopped early on a failure (stop-on-error or lost connectivity).
    pub aborted: bool,
    pub cancelled: bool,
    /// Estimated time left, from the mean table duration so far.
    pub eta_ms: Option<u64>,
}

impl ExecutionReport {
    fn new(target: String, tables_planned: usize) -> Self {
        Self {
            run_id: Uuid::now_v7().to_string(),
            target,
            started_at: Utc::now(),
            finished_at: None,
            tables_planned,
            results: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            aborted: false,
            cancelled: false,
            eta_ms: None,
        }
    }

    pub fn result(&self, table: &str) -> Option<&ProcessingResult> {
        self.results.iter().find(|r| r.table == table)
    }

    fn count(&self, status: TableStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(TableStatus::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(TableStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(TableStatus::Skipped)
    }

    pub fn tables_done(&self) -> usize {
        self.results.len()
    }

    fn estimate_remaining(&self) -> Option<Duration> {
        if self.results.is_empty() {
            return None;
        }
        let total: u64 = self.results.iter().map(|r| r.duration_ms).sum();
        let mean = total / self.results.len() as u64;
        let remaining = self.tables_planned.saturating_sub(self.results.len()) as u64;
        Some(Duration::from_millis(mean * remaining))
    }
}

// ---------- progress stream ----------

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    TableStarted {
        table: String,
        index: usize,
        total: usize,
    },
    Batch {
        table: String,
        step: String,
        done: usize,
        total: usize,
    },
    TableFinished {
        table: String,
        status: TableStatus,
        duration_ms: u64,
    },
    Warning {
        table: Option<String>,
        message: String,
    },
    Done {
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

// ---------- tracker ----------

struct TrackerState {
    report: ExecutionReport,
    sealed: bool,
}

pub struct RunTracker {
    state: RwLock<TrackerState>,
    tx: broadcast::Sender<ProgressEvent>,
}

impl RunTracker {
    pub fn new(target: impl Into<String>, tables_planned: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(TrackerState {
                report: ExecutionReport::new(target.into(), tables_planned),
                sealed: false,
            }),
            tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// A receiver sees events sent after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn run_id(&self) -> String {
        self.read().report.run_id.clone()
    }

    pub fn table_started(&self, table: &str, index: usize) {
        let total = self.read().report.tables_planned;
        tracing::info!(table = %table, index, total, "Table started");
        self.emit(ProgressEvent::TableStarted {
            table: table.to_string(),
            index,
            total,
        });
    }

    pub fn batch(&self, progress: &BatchProgress) {
        tracing::debug!(
            table = %progress.table,
            step = progress.step,
            done = progress.done,
            total = progress.total,
            "Batch applied"
        );
        self.emit(ProgressEvent::Batch {
            table: progress.table.clone(),
            step: progress.step.to_string(),
            done: progress.done,
            total: progress.total,
        });
    }

    /// Run-level warning; table warnings live on the table's result.
    pub fn warning(&self, table: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        {
            let mut state = self.write();
            if state.sealed {
                tracing::warn!(message = %message, "Warning after finalize ignored");
                return;
            }
            state.report.warnings.push(match table {
                Some(t) => format!("{t}: {message}"),
                None => message.clone(),
            });
        }
        self.emit(ProgressEvent::Warning {
            table: table.map(str::to_string),
            message,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        let mut state = self.write();
        if !state.sealed {
            state.report.errors.push(message.into());
        }
    }

    pub fn record(&self, result: ProcessingResult) {
        let event = ProgressEvent::TableFinished {
            table: result.table.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
        };
        {
            let mut state = self.write();
            if state.sealed {
                tracing::warn!(table = %result.table, "Result after finalize ignored");
                return;
            }
            if let Some(failure) = &result.error {
                state
                    .report
                    .errors
                    .push(format!("{}: {failure}", result.table));
            }
            state.report.results.push(result);
        }
        self.emit(event);
    }

    /// Update an already recorded result (deferred phases finish after the
    /// table was recorded). Returns false if the table is unknown or sealed.
    pub fn amend(&self, table: &str, f: impl FnOnce(&mut ProcessingResult)) -> bool {
        let mut state = self.write();
        if state.sealed {
            return false;
        }
        let report = &mut state.report;
        let Some(result) = report.results.iter_mut().find(|r| r.table == table) else {
            return false;
        };
        let had_error = result.error.is_some();
        f(result);
        if !had_error && let Some(failure) = &result.error {
            let line = format!("{table}: {failure}");
            report.errors.push(line);
        }
        true
    }

    pub fn mark_aborted(&self) {
        self.write().report.aborted = true;
    }

    pub fn mark_cancelled(&self) {
        self.write().report.cancelled = true;
    }

    /// Current report, with the remaining-time estimate filled in.
    pub fn snapshot(&self) -> ExecutionReport {
        let mut report = self.read().report.clone();
        report.eta_ms = report.estimate_remaining().map(|d| d.as_millis() as u64);
        report
    }

    pub fn eta(&self) -> Option<Duration> {
        self.read().report.estimate_remaining()
    }

    /// Seal the report. Later calls return the sealed report unchanged.
    pub fn finalize(&self) -> ExecutionReport {
        let report = {
            let mut state = self.write();
            if state.sealed {
                return state.report.clone();
            }
            state.sealed = true;
            state.report.finished_at = Some(Utc::now());
            state.report.eta_ms = Some(0);
            state.report.clone()
        };
        self.emit(ProgressEvent::Done {
            succeeded: report.succeeded(),
            failed: report.failed(),
            skipped: report.skipped(),
        });
        report
    }
}
