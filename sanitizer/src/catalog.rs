//! Read-only catalog queries.

use serde::Serialize;

use crate::db::{Database, ForeignKeyConstraint};
use crate::error::Result;
use crate::plan::ForeignKeyRule;

/// Summary of one table, as printed by `sanitizer inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub table: String,
    pub exists: bool,
    pub rows: u64,
    pub max_key: Option<i64>,
    pub incoming: Vec<IncomingReference>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncomingReference {
    pub constraint: String,
    pub table: String,
    pub column: String,
    pub on_update: String,
    pub on_delete: String,
}

/// Answers questions about the schema. Never mutates anything.
pub struct CatalogInspector<'a> {
    db: &'a dyn Database,
}

impl<'a> CatalogInspector<'a> {
    pub fn new(db: &'a dyn Database) -> Self {
        Self { db }
    }

    /// A missing table is `false`, not an error.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        self.db.table_exists(table).await
    }

    pub async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        self.db.column_exists(table, column).await
    }

    /// `None` for an empty table.
    pub async fn max_key(&self, table: &str, key: &str) -> Result<Option<i64>> {
        self.db.max_key(table, key).await
    }

    pub async fn row_count(&self, table: &str) -> Result<u64> {
        self.db.row_count(table).await
    }

    /// Every constraint, in any table, that references `table`.
    pub async fn constraints_referencing(&self, table: &str) -> Result<Vec<ForeignKeyConstraint>> {
        self.db.constraints_referencing(table).await
    }

    /// Inverse foreign keys: catalog references to `table` that no declared
    /// rule already describes. Each referencing column is reported once.
    pub async fn incoming_foreign_keys(
        &self,
        table: &str,
        declared: &[ForeignKeyRule],
    ) -> Result<Vec<ForeignKeyRule>> {
        let mut found: Vec<ForeignKeyRule> = Vec::new();
        for constraint in self.db.constraints_referencing(table).await? {
            let rule = constraint.rule;
            if declared.iter().any(|d| d.same_reference(&rule))
                || found.iter().any(|f| f.same_reference(&rule))
            {
                continue;
            }
            found.push(ForeignKeyRule {
                discovered: true,
                ..rule
            });
        }
        Ok(found)
    }

    pub async fn describe(&self, table: &str, key: &str) -> Result<TableInfo> {
        if !self.table_exists(table).await? {
            return Ok(TableInfo {
                table: table.to_string(),
                exists: false,
                rows: 0,
                max_key: None,
                incoming: Vec::new(),
            });
        }
        let incoming = self
            .constraints_referencing(table)
            .await?
            .into_iter()
            .map(|c| IncomingReference {
                constraint: c.name,
                table: c.rule.referencing_table,
                column: c.rule.referencing_column,
                on_update: c.rule.on_update.as_sql().to_string(),
                on_delete: c.rule.on_delete.as_sql().to_string(),
            })
            .collect();
        Ok(TableInfo {
            table: table.to_string(),
            exists: true,
            rows: self.row_count(table).await?,
            max_key: self.max_key(table, key).await?,
            incoming,
        })
    }
}
