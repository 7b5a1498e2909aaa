//! Foreign-key cascade rewriting.
//!
//! Before any key of a table changes, every inbound reference to that key
//! must carry the configured action (normally `ON UPDATE CASCADE`) so key
//! updates propagate by themselves. Declared rules win over discovered ones
//! for the same referencing column; discovered rules get cascade-on-update
//! and keep their current delete action.

use crate::catalog::CatalogInspector;
use crate::db::{Database, ForeignKeyConstraint};
use crate::error::{Result, SanitizerError};
use crate::plan::{FkAction, ForeignKeyRule};

#[derive(Debug, Clone, Default)]
pub struct CascadeOutcome {
    /// Declared rules followed by discovered ones.
    pub rules: Vec<ForeignKeyRule>,
    pub rewritten: usize,
    pub unchanged: usize,
}

impl CascadeOutcome {
    pub fn discovered(&self) -> usize {
        self.rules.iter().filter(|r| r.discovered).count()
    }
}

pub struct CascadeManager<'a> {
    db: &'a dyn Database,
}

impl<'a> CascadeManager<'a> {
    pub fn new(db: &'a dyn Database) -> Self {
        Self { db }
    }

    /// Declared ∪ discovered rules for `table.key`, without touching the schema.
    pub async fn effective_rules(
        &self,
        table: &str,
        key: &str,
        declared: &[ForeignKeyRule],
    ) -> Result<(Vec<ForeignKeyRule>, Vec<ForeignKeyConstraint>)> {
        let existing = self.db.constraints_referencing(table).await?;
        let discovered = CatalogInspector::new(self.db)
            .incoming_foreign_keys(table, declared)
            .await?
            .into_iter()
            .filter(|r| r.referenced_column == key)
            .map(|r| ForeignKeyRule {
                on_update: FkAction::Cascade,
                ..r
            });
        let rules = declared.iter().cloned().chain(discovered).collect();
        Ok((rules, existing))
    }

    /// Rewrite constraints so each rule's actions are in force. Idempotent:
    /// a constraint that already has the desired actions is left alone.
    pub async fn apply(
        &self,
        table: &str,
        key: &str,
        declared: &[ForeignKeyRule],
    ) -> Result<CascadeOutcome> {
        let (rules, existing) = self.effective_rules(table, key, declared).await?;
        let mut outcome = CascadeOutcome::default();

        for rule in &rules {
            if !self
                .db
                .column_exists(&rule.referencing_table, &rule.referencing_column)
                .await?
            {
                return Err(SanitizerError::schema(
                    format!("{}.{}", rule.referencing_table, rule.referencing_column),
                    "referencing column does not exist",
                ));
            }

            let current: Vec<&ForeignKeyConstraint> = existing
                .iter()
                .filter(|c| {
                    c.rule.same_reference(rule)
                        && c.rule.referenced_column == rule.referenced_column
                })
                .collect();

            if let [only] = current.as_slice()
                && only.rule.on_update == rule.on_update
                && only.rule.on_delete == rule.on_delete
            {
                outcome.unchanged += 1;
                continue;
            }

            for c in &current {
                self.db
                    .drop_constraint(&c.rule.referencing_table, &c.name)
                    .await?;
            }
            let name = current
                .first()
                .map(|c| c.name.clone())
                .unwrap_or_else(|| rule.default_constraint_name());
            self.db.add_foreign_key(&name, rule).await?;
            tracing::debug!(
                table = %table,
                constraint = %name,
                referencing = %format!("{}.{}", rule.referencing_table, rule.referencing_column),
                on_update = rule.on_update.as_sql(),
                on_delete = rule.on_delete.as_sql(),
                discovered = rule.discovered,
                "Foreign key rewritten"
            );
            outcome.rewritten += 1;
        }

        outcome.rules = rules;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDatabase;

    fn rule(table: &str, on_update: FkAction, on_delete: FkAction) -> ForeignKeyRule {
        ForeignKeyRule {
            referencing_table: table.into(),
            referencing_column: "t_id".into(),
            referenced_table: "t".into(),
            referenced_column: "id".into(),
            on_update,
            on_delete,
            discovered: false,
        }
    }

    fn setup() -> MemoryDatabase {
        let db = MemoryDatabase::default();
        db.create_table("t", "id", &[]);
        db.create_table("d", "id", &["t_id"]);
        db.create_table("e", "id", &["t_id"]);
        db.add_constraint("d_t_id_fkey", rule("d", FkAction::NoAction, FkAction::NoAction))
            .unwrap();
        db.add_constraint(
            "e_parent_ref",
            rule("e", FkAction::NoAction, FkAction::SetNull),
        )
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_discovered_rules_become_cascade() {
        let db = setup();
        let outcome = CascadeManager::new(&db).apply("t", "id", &[]).await.unwrap();
        assert_eq!(outcome.rewritten, 2);
        assert_eq!(outcome.discovered(), 2);
        let constraints = db.constraints();
        assert!(constraints.iter().all(|c| c.rule.on_update == FkAction::Cascade));
        // Existing name and delete action are kept.
        let e = constraints.iter().find(|c| c.name == "e_parent_ref").unwrap();
        assert_eq!(e.rule.on_delete, FkAction::SetNull);
    }

    #[tokio::test]
    async fn test_declared_rule_wins() {
        let db = setup();
        let declared = vec![rule("d", FkAction::SetNull, FkAction::SetNull)];
        CascadeManager::new(&db)
            .apply("t", "id", &declared)
            .await
            .unwrap();
        let d = db
            .constraints()
            .into_iter()
            .find(|c| c.rule.referencing_table == "d")
            .unwrap();
        assert_eq!(d.rule.on_update, FkAction::SetNull);
        assert_eq!(d.name, "d_t_id_fkey");
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let db = setup();
        let manager = CascadeManager::new(&db);
        manager.apply("t", "id", &[]).await.unwrap();
        let first = db.constraints();
        let second_run = manager.apply("t", "id", &[]).await.unwrap();
        assert_eq!(second_run.rewritten, 0);
        assert_eq!(second_run.unchanged, 2);
        assert_eq!(db.constraints(), first);
    }

    #[tokio::test]
    async fn test_declared_rule_without_constraint_is_added() {
        let db = setup();
        db.create_table("f", "id", &["t_id"]);
        let declared = vec![rule("f", FkAction::Cascade, FkAction::Cascade)];
        CascadeManager::new(&db)
            .apply("t", "id", &declared)
            .await
            .unwrap();
        assert!(db.constraints().iter().any(|c| c.name == "f_t_id_fkey"));
    }

    #[tokio::test]
    async fn test_missing_referencing_column_is_schema_error() {
        let db = setup();
        let mut bad = rule("d", FkAction::Cascade, FkAction::Restrict);
        bad.referencing_column = "ghost".into();
        let err = CascadeManager::new(&db)
            .apply("t", "id", &[bad])
            .await
            .unwrap_err();
        assert!(matches!(err, SanitizerError::Schema { .. }));
    }
}
