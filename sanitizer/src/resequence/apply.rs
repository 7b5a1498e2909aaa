use std::future::Future;

use super::mapping::MappingPlan;
use crate::db::Database;
use crate::error::{Result, SanitizerError};
use crate::plan::ForeignKeyRule;

pub const DEFAULT_SAFETY_MARGIN: i64 = 1000;

/// Rows per statement, scaled to the table size.
pub fn batch_size(rows: u64) -> usize {
    match rows {
        r if r < 10_000 => 1_000,
        r if r < 100_000 => 5_000,
        r if r < 1_000_000 => 10_000,
        _ => 50_000,
    }
}

// ---------- offsets ----------

/// Hands out temporary shift offsets for one run. Every offset is larger
/// than any offset handed out before, so no two tables share one.
#[derive(Debug)]
pub struct OffsetAllocator {
    safety_margin: i64,
    last: Option<i64>,
}

impl OffsetAllocator {
    pub fn new(safety_margin: i64) -> Self {
        Self {
            safety_margin: safety_margin.max(1),
            last: None,
        }
    }

    /// Offset such that every shifted key lands above both the table's
    /// current maximum and the largest target key.
    pub fn allocate(
        &mut self,
        table: &str,
        current_max: i64,
        max_new: i64,
        min_old: i64,
    ) -> Result<i64> {
        let overflow =
            || SanitizerError::validation(format!("{table}: temporary key offset overflows"));
        let mut offset = current_max
            .max(max_new)
            .checked_add(self.safety_margin)
            .ok_or_else(overflow)?;
        // Negative keys need extra headroom to clear the maximum once shifted.
        if min_old < 0 {
            offset = offset.checked_sub(min_old).ok_or_else(overflow)?;
        }
        if let Some(last) = self.last
            && offset <= last
        {
            offset = last.checked_add(1).ok_or_else(overflow)?;
        }
        current_max.checked_add(offset).ok_or_else(overflow)?;
        self.last = Some(offset);
        Ok(offset)
    }
}

// ---------- progress ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    pub table: String,
    pub step: &'static str,
    pub done: usize,
    pub total: usize,
}

pub type BatchObserver<'a> = &'a (dyn Fn(BatchProgress) + Send + Sync);

// ---------- trigger suppression ----------

/// Run `body` with user triggers on `table` disabled. Triggers are enabled
/// again on every exit path. When the body failed, a failing re-enable is
/// ignored: the transaction is already doomed and its rollback restores
/// the previous trigger state.
pub async fn with_triggers_suppressed<T, F>(db: &dyn Database, table: &str, body: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    db.set_user_triggers(table, false).await?;
    tracing::debug!(table = %table, "User triggers disabled");
    let result = body.await;
    let restored = db.set_user_triggers(table, true).await;
    match (result, restored) {
        (Ok(value), Ok(())) => {
            tracing::debug!(table = %table, "User triggers enabled");
            Ok(value)
        }
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(restore)) => {
            tracing::debug!(table = %table, error = %restore, "Trigger restore left to rollback");
            Err(e)
        }
    }
}

// ---------- apply ----------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub moved: u64,
    pub merged: u64,
    pub batches: usize,
    pub offset: Option<i64>,
}

/// Apply a validated plan inside the caller's transaction.
///
/// Merges first: inbound references are re-pointed to the surviving row and
/// the old row is deleted. Then moves in two steps: every moved key is
/// shifted by a fresh offset, and only once all shift batches are done is
/// each shifted key set to its final value. Batches never mix the two steps.
pub async fn apply_plan(
    db: &dyn Database,
    table: &str,
    key: &str,
    plan: &MappingPlan,
    rules: &[ForeignKeyRule],
    offsets: &mut OffsetAllocator,
    observer: BatchObserver<'_>,
) -> Result<ApplyOutcome> {
    if plan.is_empty() {
        return Ok(ApplyOutcome::default());
    }
    let rows = db.row_count(table).await?;
    let batch = batch_size(rows);

    let offset = if plan.moves.is_empty() {
        None
    } else {
        let current_max = db.max_key(table, key).await?.unwrap_or(0);
        let (max_new, min_old) = plan.bounds();
        Some(offsets.allocate(
            table,
            current_max,
            max_new.unwrap_or(0),
            min_old.unwrap_or(0),
        )?)
    };

    with_triggers_suppressed(db, table, async {
        let mut outcome = ApplyOutcome {
            offset,
            ..ApplyOutcome::default()
        };

        if !plan.merges.is_empty() {
            let merges = plan.merges.pairs();
            for chunk in merges.chunks(batch) {
                for rule in rules {
                    db.repoint(&rule.referencing_table, &rule.referencing_column, chunk, None)
                        .await?;
                }
                let olds: Vec<i64> = chunk.iter().map(|(o, _)| *o).collect();
                outcome.merged += db.delete_keys(table, key, &olds).await?;
                outcome.batches += 1;
                observer(BatchProgress {
                    table: table.to_string(),
                    step: "merge",
                    done: outcome.merged as usize,
                    total: merges.len(),
                });
            }
        }

        if let Some(offset) = offset {
            let olds = plan.moves.olds();
            let mut shifted = 0;
            for chunk in olds.chunks(batch) {
                shifted += db.shift_keys(table, key, chunk, offset).await?;
                outcome.batches += 1;
                observer(BatchProgress {
                    table: table.to_string(),
                    step: "shift",
                    done: shifted as usize,
                    total: olds.len(),
                });
            }
            let pairs = plan.moves.pairs();
            for chunk in pairs.chunks(batch) {
                outcome.moved += db.assign_keys(table, key, chunk, offset).await?;
                outcome.batches += 1;
                observer(BatchProgress {
                    table: table.to_string(),
                    step: "assign",
                    done: outcome.moved as usize,
                    total: pairs.len(),
                });
            }
        }
        Ok(outcome)
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::db::memory::MemoryDatabase;
    use crate::plan::FkAction;
    use crate::resequence::mapping::{IdMapping, validate};

    fn noop(_: BatchProgress) {}

    #[test]
    fn test_batch_size_scales() {
        assert_eq!(batch_size(0), 1_000);
        assert_eq!(batch_size(9_999), 1_000);
        assert_eq!(batch_size(10_000), 5_000);
        assert_eq!(batch_size(500_000), 10_000);
        assert_eq!(batch_size(2_000_000), 50_000);
    }

    #[test]
    fn test_offsets_strictly_increase() {
        let mut offsets = OffsetAllocator::new(1000);
        let a = offsets.allocate("a", 12, 3, 5).unwrap();
        assert_eq!(a, 1012);
        let b = offsets.allocate("b", 10, 1, 1).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_offset_clears_targets_and_negative_keys() {
        let mut offsets = OffsetAllocator::new(10);
        assert_eq!(offsets.allocate("t", 5, 100, 1).unwrap(), 110);
        let mut offsets = OffsetAllocator::new(10);
        let offset = offsets.allocate("t", 5, 3, -50).unwrap();
        assert!(-50 + offset > 5);
    }

    #[test]
    fn test_offset_overflow_is_validation_error() {
        let mut offsets = OffsetAllocator::new(1000);
        let err = offsets.allocate("t", i64::MAX - 10, 1, 1).unwrap_err();
        assert!(matches!(err, SanitizerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_shift_completes_before_assign() {
        let db = MemoryDatabase::default();
        db.create_table("t", "id", &[]);
        for k in [5, 8, 12] {
            db.insert_row("t", k, &[]).unwrap();
        }
        let raw = IdMapping::from_pairs(vec![(5, 1), (8, 2), (12, 3)]);
        let plan = validate("t", &raw, &[5, 8, 12], &[], false).unwrap();
        let mut offsets = OffsetAllocator::new(1000);
        let outcome = apply_plan(&db, "t", "id", &plan, &[], &mut offsets, &noop)
            .await
            .unwrap();
        assert_eq!(outcome.moved, 3);
        assert_eq!(outcome.offset, Some(1012));
        assert_eq!(db.keys("t"), vec![1, 2, 3]);

        let calls: Vec<String> = db
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("shift_keys") || c.starts_with("assign_keys"))
            .collect();
        assert_eq!(calls, vec!["shift_keys t", "assign_keys t"]);
    }

    #[tokio::test]
    async fn test_swap_needs_no_free_key() {
        let db = MemoryDatabase::default();
        db.create_table("t", "id", &["name"]);
        db.insert_row("t", 1, &[("name", "one".into())]).unwrap();
        db.insert_row("t", 2, &[("name", "two".into())]).unwrap();
        let raw = IdMapping::from_pairs(vec![(1, 2), (2, 1)]);
        let plan = validate("t", &raw, &[1, 2], &[1, 2], false).unwrap();
        apply_plan(&db, "t", "id", &plan, &[], &mut OffsetAllocator::new(1), &noop)
            .await
            .unwrap();
        assert_eq!(db.value("t", 1, "name"), Some("two".into()));
    }

    #[tokio::test]
    async fn test_merge_repoints_then_deletes() {
        let db = MemoryDatabase::default();
        db.create_table("t", "id", &[]);
        db.create_table("d", "id", &["t_id"]);
        db.insert_row("t", 7, &[]).unwrap();
        db.insert_row("t", 8, &[]).unwrap();
        db.insert_row("d", 1, &[("t_id", 8.into())]).unwrap();
        let rule = ForeignKeyRule {
            referencing_table: "d".into(),
            referencing_column: "t_id".into(),
            referenced_table: "t".into(),
            referenced_column: "id".into(),
            on_update: FkAction::Cascade,
            on_delete: FkAction::Restrict,
            discovered: false,
        };
        db.add_constraint("d_t_id_fkey", rule.clone()).unwrap();
        let raw = IdMapping::from_pairs(vec![(8, 7)]);
        let plan = validate("t", &raw, &[8], &[7], true).unwrap();
        let mut offsets = OffsetAllocator::new(10);
        let outcome = apply_plan(&db, "t", "id", &plan, &[rule], &mut offsets, &noop)
            .await
            .unwrap();
        assert_eq!(outcome.merged, 1);
        assert_eq!(outcome.offset, None);
        assert_eq!(db.keys("t"), vec![7]);
        assert_eq!(db.value("d", 1, "t_id"), Some(7.into()));
    }

    #[tokio::test]
    async fn test_triggers_restored_after_failure() {
        let db = MemoryDatabase::default();
        db.create_table("t", "id", &[]);
        db.add_user_trigger("t");
        db.insert_row("t", 5, &[]).unwrap();
        db.fail_on(
            "assign_keys",
            "t",
            SanitizerError::constraint("t_pkey", "boom"),
        );
        let raw = IdMapping::from_pairs(vec![(5, 1)]);
        let plan = validate("t", &raw, &[5], &[], false).unwrap();
        let mut offsets = OffsetAllocator::new(10);
        let result = apply_plan(&db, "t", "id", &plan, &[], &mut offsets, &noop).await;
        assert!(matches!(result, Err(SanitizerError::ConstraintViolation { .. })));
        assert!(db.triggers_enabled("t"));
        assert!(db.trigger_log().is_empty());
    }

    #[tokio::test]
    async fn test_progress_reported_per_batch() {
        let db = MemoryDatabase::default();
        db.create_table("t", "id", &[]);
        for k in 10..13 {
            db.insert_row("t", k, &[]).unwrap();
        }
        let raw = IdMapping::from_pairs(vec![(10, 1), (11, 2), (12, 3)]);
        let plan = validate("t", &raw, &[10, 11, 12], &[], false).unwrap();
        let seen = Mutex::new(Vec::new());
        let observer = |p: BatchProgress| seen.lock().unwrap().push(p.step);
        apply_plan(&db, "t", "id", &plan, &[], &mut OffsetAllocator::new(10), &observer)
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["shift", "assign"]);
    }
}
