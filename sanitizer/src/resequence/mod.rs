//! Key renumbering.
//!
//! A mapping is computed in full, validated against the rows that exist, and
//! only then applied with the offset-shift technique (see [`apply`]).

pub mod apply;
pub mod mapping;
pub mod strategy;

pub use apply::{
    ApplyOutcome, BatchObserver, BatchProgress, DEFAULT_SAFETY_MARGIN, OffsetAllocator,
    batch_size, with_triggers_suppressed,
};
pub use mapping::{IdMapping, MappingPlan};
pub use strategy::{CustomStrategy, KeyFromColumn, StrategyContext, StrategyRegistry};

use crate::db::Database;
use crate::error::Result;
use crate::plan::{ForeignKeyRule, ResequenceSpec};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResequenceOutcome {
    /// What happened to each key, merges included.
    pub mapping: IdMapping,
    pub moved: u64,
    pub merged: u64,
    pub batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactOutcome {
    pub mapping: IdMapping,
    pub gaps_removed: u64,
    pub moved: u64,
    pub batches: usize,
}

pub struct ResequenceEngine<'a> {
    db: &'a dyn Database,
    registry: &'a StrategyRegistry,
}

impl<'a> ResequenceEngine<'a> {
    pub fn new(db: &'a dyn Database, registry: &'a StrategyRegistry) -> Self {
        Self { db, registry }
    }

    fn context<'b>(&self, table: &'b str, key: &'b str) -> StrategyContext<'b>
    where
        'a: 'b,
    {
        StrategyContext {
            db: self.db,
            table,
            key,
        }
    }

    pub async fn validate_spec(&self, table: &str, key: &str, spec: &ResequenceSpec) -> Result<()> {
        strategy::validate_spec(&self.context(table, key), spec, self.registry).await
    }

    /// Validate `raw` against the table's current keys.
    pub async fn plan(
        &self,
        table: &str,
        key: &str,
        raw: &IdMapping,
        allow_merge: bool,
    ) -> Result<MappingPlan> {
        if raw.is_empty() {
            return Ok(MappingPlan::default());
        }
        let present = self.db.existing_keys(table, key, &raw.olds()).await?;
        let occupied = self.db.existing_keys(table, key, &raw.news()).await?;
        mapping::validate(table, raw, &present, &occupied, allow_merge)
    }

    /// The `id_shift` phase: compute, validate and apply the strategy's mapping.
    pub async fn resequence(
        &self,
        table: &str,
        key: &str,
        spec: &ResequenceSpec,
        rules: &[ForeignKeyRule],
        offsets: &mut OffsetAllocator,
        observer: BatchObserver<'_>,
    ) -> Result<ResequenceOutcome> {
        let raw = strategy::compute_mapping(&self.context(table, key), spec, self.registry).await?;
        let plan = self.plan(table, key, &raw, spec.allows_merge()).await?;
        tracing::debug!(
            table = %table,
            strategy = spec.label(),
            moves = plan.moves.len(),
            merges = plan.merges.len(),
            "Mapping validated"
        );
        let applied =
            apply::apply_plan(self.db, table, key, &plan, rules, offsets, observer).await?;
        Ok(ResequenceOutcome {
            mapping: plan.effective(),
            moved: applied.moved,
            merged: applied.merged,
            batches: applied.batches,
        })
    }

    /// The `id_compact` phase: keys `>= start` become contiguous from `start`,
    /// preserving their order.
    pub async fn compact(
        &self,
        table: &str,
        key: &str,
        start: i64,
        offsets: &mut OffsetAllocator,
        observer: BatchObserver<'_>,
    ) -> Result<CompactOutcome> {
        let keys: Vec<i64> = self
            .db
            .select_keys(table, key, None, &[])
            .await?
            .into_iter()
            .filter(|k| *k >= start)
            .collect();
        let Some(max) = keys.iter().max().copied() else {
            return Ok(CompactOutcome::default());
        };
        let span = u64::try_from(max - start + 1).unwrap_or(0);
        let gaps_removed = span.saturating_sub(keys.len() as u64);
        if gaps_removed == 0 {
            return Ok(CompactOutcome::default());
        }

        let raw = strategy::sequential(table, &keys, start)?;
        let plan = self.plan(table, key, &raw, false).await?;
        let applied = apply::apply_plan(self.db, table, key, &plan, &[], offsets, observer).await?;
        Ok(CompactOutcome {
            mapping: plan.moves,
            gaps_removed,
            moved: applied.moved,
            batches: applied.batches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDatabase;
    use crate::error::SanitizerError;

    fn noop(_: BatchProgress) {}

    fn table(keys: &[i64]) -> MemoryDatabase {
        let db = MemoryDatabase::default();
        db.create_table("t", "id", &["name"]);
        for k in keys {
            db.insert_row("t", *k, &[]).unwrap();
        }
        db
    }

    #[tokio::test]
    async fn test_sequential_resequence() {
        let db = table(&[5, 8, 12]);
        let registry = StrategyRegistry::default();
        let engine = ResequenceEngine::new(&db, &registry);
        let spec = ResequenceSpec::Sequential {
            start: 1,
            order_by: vec![],
            filter: None,
        };
        let outcome = engine
            .resequence("t", "id", &spec, &[], &mut OffsetAllocator::new(1000), &noop)
            .await
            .unwrap();
        assert_eq!(outcome.moved, 3);
        assert_eq!(outcome.mapping.get(12), Some(3));
        assert_eq!(db.keys("t"), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_custom_collision_is_rejected_before_writing() {
        let db = MemoryDatabase::default();
        db.create_table("t", "id", &["partner_id"]);
        db.insert_row("t", 1, &[("partner_id", 2.into())]).unwrap();
        db.insert_row("t", 2, &[]).unwrap();
        let registry = StrategyRegistry::default();
        let engine = ResequenceEngine::new(&db, &registry);
        let spec = ResequenceSpec::Custom {
            name: "key_from_column".into(),
            params: serde_json::json!({"column": "partner_id"}),
        };
        let err = engine
            .resequence("t", "id", &spec, &[], &mut OffsetAllocator::new(10), &noop)
            .await
            .unwrap_err();
        assert!(matches!(err, SanitizerError::Validation(_)));
        assert_eq!(db.keys("t"), vec![1, 2]);
        assert!(!db.calls().iter().any(|c| c.starts_with("set_user_triggers")));
    }

    #[tokio::test]
    async fn test_compact_closes_gaps() {
        let db = table(&[2, 4, 9]);
        let registry = StrategyRegistry::default();
        let engine = ResequenceEngine::new(&db, &registry);
        let outcome = engine
            .compact("t", "id", 1, &mut OffsetAllocator::new(1000), &noop)
            .await
            .unwrap();
        assert_eq!(outcome.gaps_removed, 6);
        assert_eq!(outcome.moved, 3);
        assert_eq!(db.keys("t"), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_compact_leaves_keys_below_start() {
        let db = table(&[-1, 0, 10, 12]);
        let registry = StrategyRegistry::default();
        let engine = ResequenceEngine::new(&db, &registry);
        let outcome = engine
            .compact("t", "id", 1, &mut OffsetAllocator::new(1000), &noop)
            .await
            .unwrap();
        assert_eq!(outcome.gaps_removed, 10);
        assert_eq!(db.keys("t"), vec![-1, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_compact_without_gaps_is_noop() {
        let db = table(&[1, 2, 3]);
        let registry = StrategyRegistry::default();
        let engine = ResequenceEngine::new(&db, &registry);
        let outcome = engine
            .compact("t", "id", 1, &mut OffsetAllocator::new(1000), &noop)
            .await
            .unwrap();
        assert_eq!(outcome, CompactOutcome::default());
        assert!(!db.calls().iter().any(|c| c.starts_with("shift_keys")));
    }
}
