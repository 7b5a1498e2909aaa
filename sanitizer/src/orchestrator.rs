//! Per-table phase orchestration.
//!
//! Tables run one at a time in plan order, each inside its own transaction:
//!
//! ```text
//! fk_rewrite -> cleanup -> id_shift -> id_compact -> patch_refs
//!            -> xmlid_rebuild -> sequence_sync -> recompute
//! ```
//!
//! The first critical failure rolls the table back and marks it failed; the
//! run then moves on. Non-critical phases run under a savepoint so their
//! failure leaves the transaction usable and only adds a warning. Generator
//! resets are not transactional, so `sequence_sync` always runs after the
//! commit. With a connector and `workers > 0`, `sequence_sync` and
//! `recompute` of a committed table run on a bounded pool of extra
//! connections while later tables proceed.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cascade::CascadeManager;
use crate::db::{Connector, Database};
use crate::error::{PhaseFailure, Result, SanitizerError};
use crate::patch;
use crate::plan::{ForeignKeyRule, PhaseFlags, RecomputeSpec, TableDescriptor};
use crate::recompute;
use crate::resequence::{
    BatchProgress, DEFAULT_SAFETY_MARGIN, IdMapping, OffsetAllocator, ResequenceEngine,
    StrategyRegistry,
};
use crate::sequence::{self, SequenceOutcome};
use crate::sql::check_ident;
use crate::tracker::{ExecutionReport, ProcessingResult, RunTracker, TableStatus};
use crate::xmlid;

// ---------- phases ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    FkRewrite,
    Cleanup,
    IdShift,
    IdCompact,
    PatchRefs,
    XmlidRebuild,
    SequenceSync,
    Recompute,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::FkRewrite,
        Phase::Cleanup,
        Phase::IdShift,
        Phase::IdCompact,
        Phase::PatchRefs,
        Phase::XmlidRebuild,
        Phase::SequenceSync,
        Phase::Recompute,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::FkRewrite => "fk_rewrite",
            Phase::Cleanup => "cleanup",
            Phase::IdShift => "id_shift",
            Phase::IdCompact => "id_compact",
            Phase::PatchRefs => "patch_refs",
            Phase::XmlidRebuild => "xmlid_rebuild",
            Phase::SequenceSync => "sequence_sync",
            Phase::Recompute => "recompute",
        }
    }

    /// A critical failure aborts the table.
    pub fn is_critical(&self) -> bool {
        !matches!(self, Phase::PatchRefs | Phase::Recompute)
    }

    /// May run concurrently across tables once the table committed.
    pub fn is_parallelizable(&self) -> bool {
        matches!(self, Phase::SequenceSync | Phase::Recompute)
    }

    pub fn enabled_in(&self, flags: &PhaseFlags) -> bool {
        match self {
            Phase::FkRewrite => flags.fk_rewrite,
            Phase::Cleanup => flags.cleanup,
            Phase::IdShift => flags.id_shift,
            Phase::IdCompact => flags.id_compact,
            Phase::PatchRefs => flags.patch_refs,
            Phase::XmlidRebuild => flags.xmlid_rebuild,
            Phase::SequenceSync => flags.sequence_sync,
            Phase::Recompute => flags.recompute,
        }
    }
}

/// Failure of a phase, before it is recorded on a result.
#[derive(Debug)]
struct PhaseError {
    phase: &'static str,
    error: SanitizerError,
}

impl PhaseError {
    fn at(phase: Phase) -> impl FnOnce(SanitizerError) -> PhaseError {
        move |error| PhaseError {
            phase: phase.name(),
            error,
        }
    }

    fn step(phase: &'static str) -> impl FnOnce(SanitizerError) -> PhaseError {
        move |error| PhaseError { phase, error }
    }
}

// ---------- options ----------

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Halt after the first failed table.
    pub stop_on_error: bool,
    /// Size of the deferred pool; 0 runs every phase inside the table transaction.
    pub workers: usize,
    pub safety_margin: i64,
    /// Reported target identity; defaults to the database's own.
    pub target: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            workers: 0,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            target: None,
        }
    }
}

// ---------- orchestrator ----------

pub struct Orchestrator {
    db: Arc<dyn Database>,
    connector: Option<Arc<dyn Connector>>,
    registry: Arc<StrategyRegistry>,
    options: RunOptions,
    cancel: CancellationToken,
}

/// Work handed to the deferred pool after a table committed.
#[derive(Debug, Clone)]
struct DeferredJob {
    table: String,
    key: String,
    sequence_sync: bool,
    recompute: Vec<RecomputeSpec>,
}

struct TableRun {
    result: ProcessingResult,
    deferred: Option<DeferredJob>,
    fatal: Option<SanitizerError>,
}

impl Orchestrator {
    pub fn new(db: Arc<dyn Database>, options: RunOptions) -> Self {
        Self {
            db,
            connector: None,
            registry: Arc::new(StrategyRegistry::with_builtins()),
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling this token stops the run before the next table starts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A tracker sized for `plan`; subscribe to it before calling `run_tracked`.
    pub fn tracker_for(&self, plan: &[TableDescriptor]) -> Arc<RunTracker> {
        let target = self
            .options
            .target
            .clone()
            .unwrap_or_else(|| self.db.identity());
        Arc::new(RunTracker::new(target, plan.len()))
    }

    pub async fn run(&self, plan: &[TableDescriptor]) -> ExecutionReport {
        let tracker = self.tracker_for(plan);
        self.run_tracked(plan, tracker).await
    }

    pub async fn run_tracked(
        &self,
        plan: &[TableDescriptor],
        tracker: Arc<RunTracker>,
    ) -> ExecutionReport {
        tracing::info!(
            run_id = %tracker.run_id(),
            target = %self.db.identity(),
            tables = plan.len(),
            workers = self.options.workers,
            "Run started"
        );
        let mut offsets = OffsetAllocator::new(self.options.safety_margin);
        let halt = CancellationToken::new();
        let mut pool = DeferredPool::new(self.options.workers);

        for (index, descriptor) in plan.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!(table = %descriptor.table, "Run cancelled before table");
                tracker.mark_cancelled();
                break;
            }
            if halt.is_cancelled() {
                tracker.mark_aborted();
                break;
            }

            tracker.table_started(&descriptor.table, index);
            let run = self.process_table(descriptor, &mut offsets, &tracker).await;
            let failed = run.result.status == TableStatus::Failed;
            tracker.record(run.result);

            if let Some(err) = run.fatal {
                tracing::error!(table = %descriptor.table, error = %err, "Run aborted");
                tracker.error(format!("run aborted: {err}"));
                tracker.mark_aborted();
                break;
            }
            if let (Some(job), Some(connector)) = (run.deferred, &self.connector) {
                pool.spawn(
                    connector.clone(),
                    job,
                    tracker.clone(),
                    halt.clone(),
                    self.options.stop_on_error,
                );
            }
            if failed && self.options.stop_on_error {
                tracing::warn!(table = %descriptor.table, "Stopping after failed table");
                tracker.mark_aborted();
                break;
            }
        }

        pool.join().await;
        if halt.is_cancelled() && !tracker.snapshot().aborted {
            tracker.mark_aborted();
        }
        let report = tracker.finalize();
        tracing::info!(
            run_id = %report.run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            aborted = report.aborted,
            cancelled = report.cancelled,
            "Run finished"
        );
        report
    }

    fn deferring(&self) -> bool {
        self.connector.is_some() && self.options.workers > 0
    }

    async fn process_table(
        &self,
        d: &TableDescriptor,
        offsets: &mut OffsetAllocator,
        tracker: &RunTracker,
    ) -> TableRun {
        let db = self.db.as_ref();
        let table = d.table.as_str();
        let done = |result: ProcessingResult, fatal: Option<SanitizerError>| TableRun {
            result,
            deferred: None,
            fatal,
        };

        if !d.phases.any() {
            tracing::info!(table = %table, "All phases disabled, skipping");
            return done(ProcessingResult::skipped(table, "all phases disabled"), None);
        }
        match db.table_exists(table).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(table = %table, "Table does not exist, skipping");
                return done(ProcessingResult::skipped(table, "table does not exist"), None);
            }
            Err(e) => return self.failed_before_write(table, "validate", e),
        }

        if let Err(e) = self.validate(d).await {
            return self.failed_before_write(table, "validate", e);
        }

        let mut result = ProcessingResult::start(table);
        result.rows_before = match db.row_count(table).await {
            Ok(n) => n,
            Err(e) => return self.failed_before_write(table, "validate", e),
        };
        if let Err(e) = db.begin().await {
            return self.failed_before_write(table, "begin", e);
        }

        let inline = !self.deferring();
        let body = self
            .run_phases(d, &mut result, offsets, tracker, inline)
            .await;
        let body = match body {
            Ok(()) => db.commit().await.map_err(PhaseError::step("commit")),
            Err(e) => Err(e),
        };

        if let Err(PhaseError { phase, error }) = body {
            if let Err(rollback) = db.rollback().await {
                tracing::error!(table = %table, error = %rollback, "Rollback failed");
            }
            tracing::error!(table = %table, phase, error = %error, "Table failed, rolled back");
            result.rows_after = result.rows_before;
            result.rows_deleted = 0;
            result.gaps_removed = 0;
            result.rows_renumbered = 0;
            result.changes = vec![format!("rolled back after {phase} failure")];
            result.fail(PhaseFailure::new(phase, &error));
            let fatal = error.is_fatal_to_run().then_some(error);
            return TableRun {
                result,
                deferred: None,
                fatal,
            };
        }

        // The generator only moves once the renumbered keys are committed.
        if inline && d.phases.sequence_sync {
            match sequence::synchronize(db, table, &d.key).await {
                Ok(outcome) => result.changes.push(describe_sequence(outcome)),
                Err(e) => {
                    tracing::error!(
                        table = %table,
                        phase = Phase::SequenceSync.name(),
                        error = %e,
                        "Phase failed after commit"
                    );
                    result.fail(committed_failure(Phase::SequenceSync, &e));
                    let fatal = e.is_fatal_to_run().then_some(e);
                    return done(result, fatal);
                }
            }
        }

        match db.row_count(table).await {
            Ok(n) => result.rows_after = n,
            Err(e) => {
                if e.is_fatal_to_run() {
                    result.finish(TableStatus::Success);
                    return done(result, Some(e));
                }
                result.warnings.push(format!("row count after commit: {e}"));
            }
        }
        result.finish(TableStatus::Success);
        tracing::info!(
            table = %table,
            rows_before = result.rows_before,
            rows_after = result.rows_after,
            deleted = result.rows_deleted,
            renumbered = result.rows_renumbered,
            gaps_removed = result.gaps_removed,
            duration_ms = result.duration_ms,
            "Table committed"
        );

        let deferred = (!inline)
            .then(|| DeferredJob {
                table: d.table.clone(),
                key: d.key.clone(),
                sequence_sync: d.phases.sequence_sync,
                recompute: if d.phases.recompute {
                    d.recompute.clone()
                } else {
                    Vec::new()
                },
            })
            .filter(|job| job.sequence_sync || !job.recompute.is_empty());

        TableRun {
            result,
            deferred,
            fatal: None,
        }
    }

    fn failed_before_write(&self, table: &str, phase: &str, error: SanitizerError) -> TableRun {
        tracing::error!(table = %table, phase, error = %error, "Table failed before any write");
        let mut result = ProcessingResult::start(table);
        result.fail(PhaseFailure::new(phase, &error));
        let fatal = error.is_fatal_to_run().then_some(error);
        TableRun {
            result,
            deferred: None,
            fatal,
        }
    }

    /// Everything that can be checked without writing.
    async fn validate(&self, d: &TableDescriptor) -> Result<()> {
        let db = self.db.as_ref();
        d.check_shape()?;
        check_ident(&d.table)?;
        check_ident(&d.key)?;
        if !db.column_exists(&d.table, &d.key).await? {
            return Err(SanitizerError::schema(
                format!("{}.{}", d.table, d.key),
                "key column does not exist",
            ));
        }
        if d.phases.id_shift
            && let Some(spec) = &d.resequence
        {
            ResequenceEngine::new(db, &self.registry)
                .validate_spec(&d.table, &d.key, spec)
                .await?;
        }
        if d.phases.xmlid_rebuild
            && let Some(spec) = &d.external_id
        {
            xmlid::validate(db, &d.table, spec).await?;
        }
        Ok(())
    }

    async fn run_phases(
        &self,
        d: &TableDescriptor,
        result: &mut ProcessingResult,
        offsets: &mut OffsetAllocator,
        tracker: &RunTracker,
        inline: bool,
    ) -> std::result::Result<(), PhaseError> {
        let db = self.db.as_ref();
        let table = d.table.as_str();
        let key = d.key.as_str();
        let flags = &d.phases;
        let engine = ResequenceEngine::new(db, &self.registry);
        let observer = |p: BatchProgress| tracker.batch(&p);

        // 1. fk_rewrite
        let mut rules: Vec<ForeignKeyRule> = d.foreign_keys.clone();
        if flags.fk_rewrite {
            let outcome = CascadeManager::new(db)
                .apply(table, key, &d.foreign_keys)
                .await
                .map_err(PhaseError::at(Phase::FkRewrite))?;
            result.changes.push(format!(
                "fk_rewrite: {} rewritten, {} unchanged ({} discovered)",
                outcome.rewritten,
                outcome.unchanged,
                outcome.discovered()
            ));
            rules = outcome.rules;
        } else if flags.id_shift
            && d.resequence.as_ref().is_some_and(|s| s.allows_merge())
        {
            // Merges still need every inbound reference.
            rules = CascadeManager::new(db)
                .effective_rules(table, key, &d.foreign_keys)
                .await
                .map_err(PhaseError::at(Phase::IdShift))?
                .0;
        }

        // 2. cleanup
        if flags.cleanup && !d.cleanup.is_empty() {
            let mut deleted = 0;
            for predicate in &d.cleanup {
                deleted += db
                    .delete_where(table, predicate)
                    .await
                    .map_err(PhaseError::at(Phase::Cleanup))?;
            }
            result.rows_deleted += deleted;
            result.changes.push(format!("cleanup: {deleted} rows deleted"));
        }

        // 3. id_shift
        let mut shifted = IdMapping::new();
        if flags.id_shift
            && let Some(spec) = &d.resequence
        {
            let outcome = engine
                .resequence(table, key, spec, &rules, offsets, &observer)
                .await
                .map_err(PhaseError::at(Phase::IdShift))?;
            result.rows_renumbered += outcome.moved;
            result.rows_deleted += outcome.merged;
            result.changes.push(format!(
                "id_shift ({}): {} rows renumbered, {} merged",
                spec.label(),
                outcome.moved,
                outcome.merged
            ));
            shifted = outcome.mapping;
        }

        // 4. id_compact
        let mut compacted = IdMapping::new();
        if flags.id_compact {
            let outcome = engine
                .compact(table, key, d.compact.start, offsets, &observer)
                .await
                .map_err(PhaseError::at(Phase::IdCompact))?;
            result.gaps_removed += outcome.gaps_removed;
            result.rows_renumbered += outcome.moved;
            result.changes.push(format!(
                "id_compact: {} gaps removed, {} rows renumbered",
                outcome.gaps_removed, outcome.moved
            ));
            compacted = outcome.mapping;
        }
        let effective = shifted.compose(&compacted);

        // 5. patch_refs
        if flags.patch_refs {
            for p in &d.patches {
                let outcome = non_critical(db, "patch_refs", patch::apply_patch(db, p, &effective))
                    .await
                    .map_err(PhaseError::at(Phase::PatchRefs))?;
                match outcome {
                    Ok(n) => result
                        .changes
                        .push(format!("patch_refs: {}: {n} rows", p.describe())),
                    Err(e) => record_warning(tracker, result, Phase::PatchRefs, &p.describe(), &e),
                }
            }
        }

        // 6. xmlid_rebuild
        if flags.xmlid_rebuild
            && let Some(spec) = &d.external_id
        {
            let outcome = xmlid::rebuild(db, table, key, spec)
                .await
                .map_err(PhaseError::at(Phase::XmlidRebuild))?;
            result.changes.push(format!(
                "xmlid_rebuild: {} updated, {} inserted, {} unchanged",
                outcome.updated, outcome.inserted, outcome.unchanged
            ));
        }

        if !inline {
            return Ok(());
        }

        // 8. recompute; sequence_sync (7) follows the commit
        if flags.recompute {
            for spec in &d.recompute {
                let outcome = non_critical(db, "recompute", recompute::run(db, table, key, spec))
                    .await
                    .map_err(PhaseError::at(Phase::Recompute))?;
                match outcome {
                    Ok(n) => result.changes.push(format!(
                        "recompute: {}: {n} rows",
                        recompute::describe(spec)
                    )),
                    Err(e) => record_warning(
                        tracker,
                        result,
                        Phase::Recompute,
                        &recompute::describe(spec),
                        &e,
                    ),
                }
            }
        }
        Ok(())
    }
}

fn describe_sequence(outcome: SequenceOutcome) -> String {
    match outcome {
        SequenceOutcome::Reset { next } => format!("sequence_sync: next key {next}"),
        SequenceOutcome::NoSequence => "sequence_sync: no sequence".to_string(),
    }
}

fn record_warning(
    tracker: &RunTracker,
    result: &mut ProcessingResult,
    phase: Phase,
    what: &str,
    error: &SanitizerError,
) {
    tracing::warn!(
        table = %result.table,
        phase = phase.name(),
        what,
        error = %error,
        "Non-critical phase failed"
    );
    let message = format!("{}: {what}: {error}", phase.name());
    tracker.warning(Some(&result.table), message.clone());
    result.warnings.push(message);
}

/// Run a non-critical step under a savepoint. The outer error means the
/// transaction itself is broken; the inner one is the step's own failure,
/// already undone.
async fn non_critical<T, F>(db: &dyn Database, name: &str, body: F) -> Result<Result<T>>
where
    F: Future<Output = Result<T>>,
{
    db.savepoint(name).await?;
    match body.await {
        Ok(value) => {
            db.release_savepoint(name).await?;
            Ok(Ok(value))
        }
        Err(e) if e.is_fatal_to_run() => Err(e),
        Err(e) => {
            db.rollback_to_savepoint(name).await?;
            db.release_savepoint(name).await?;
            Ok(Err(e))
        }
    }
}

// ---------- deferred pool ----------

struct DeferredPool {
    tasks: JoinSet<()>,
    permits: Arc<Semaphore>,
}

impl DeferredPool {
    fn new(workers: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    fn spawn(
        &mut self,
        connector: Arc<dyn Connector>,
        job: DeferredJob,
        tracker: Arc<RunTracker>,
        halt: CancellationToken,
        stop_on_error: bool,
    ) {
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            run_deferred(connector, job, tracker, halt, stop_on_error).await;
        });
    }

    async fn join(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Deferred task panicked");
            }
        }
    }
}

/// Parallelizable phases of a committed table, on a fresh connection in
/// autocommit mode.
async fn run_deferred(
    connector: Arc<dyn Connector>,
    job: DeferredJob,
    tracker: Arc<RunTracker>,
    halt: CancellationToken,
    stop_on_error: bool,
) {
    let first = if job.sequence_sync {
        Phase::SequenceSync
    } else {
        Phase::Recompute
    };
    let db = match connector.connect().await {
        Ok(db) => db,
        Err(e) => {
            deferred_failure(&tracker, &job.table, first, &e, &halt, stop_on_error);
            return;
        }
    };

    if job.sequence_sync {
        match sequence::synchronize(db.as_ref(), &job.table, &job.key).await {
            Ok(outcome) => {
                tracker.amend(&job.table, |r| r.changes.push(describe_sequence(outcome)));
            }
            Err(e) => {
                deferred_failure(
                    &tracker,
                    &job.table,
                    Phase::SequenceSync,
                    &e,
                    &halt,
                    stop_on_error,
                );
                return;
            }
        }
    }

    for spec in &job.recompute {
        match recompute::run(db.as_ref(), &job.table, &job.key, spec).await {
            Ok(n) => {
                let line = format!("recompute: {}: {n} rows", recompute::describe(spec));
                tracker.amend(&job.table, |r| r.changes.push(line));
            }
            Err(e) => {
                deferred_failure(&tracker, &job.table, Phase::Recompute, &e, &halt, stop_on_error);
                if e.is_fatal_to_run() {
                    return;
                }
            }
        }
    }
}

fn deferred_failure(
    tracker: &RunTracker,
    table: &str,
    phase: Phase,
    error: &SanitizerError,
    halt: &CancellationToken,
    stop_on_error: bool,
) {
    if phase.is_critical() || error.is_fatal_to_run() {
        tracing::error!(
            table = %table,
            phase = phase.name(),
            error = %error,
            "Deferred phase failed"
        );
        let failure = committed_failure(phase, error);
        tracker.amend(table, |r| r.fail(failure));
        if error.is_fatal_to_run() || stop_on_error {
            halt.cancel();
        }
    } else {
        tracing::warn!(
            table = %table,
            phase = phase.name(),
            error = %error,
            "Deferred phase failed"
        );
        let message = format!("{}: {error}", phase.name());
        tracker.warning(Some(table), message.clone());
        tracker.amend(table, |r| r.warnings.push(message));
    }
}

fn committed_failure(phase: Phase, error: &SanitizerError) -> PhaseFailure {
    let mut failure = PhaseFailure::new(phase.name(), error);
    failure.message = format!("{} (table data was already committed)", failure.message);
    failure
}
