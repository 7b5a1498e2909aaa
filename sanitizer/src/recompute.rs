//! `recompute`: refresh state derived from keys after renumbering.

use crate::db::Database;
use crate::error::Result;
use crate::plan::RecomputeSpec;

pub fn describe(spec: &RecomputeSpec) -> String {
    match spec {
        RecomputeSpec::ParentPath { path_column, .. } => format!("parent path {path_column}"),
        RecomputeSpec::Statement { sql } => {
            let short: String = sql.chars().take(60).collect();
            format!("statement '{short}'")
        }
    }
}

/// Run one recompute step; returns the number of rows changed.
pub async fn run(db: &dyn Database, table: &str, key: &str, spec: &RecomputeSpec) -> Result<u64> {
    match spec {
        RecomputeSpec::ParentPath {
            parent_column,
            path_column,
        } => {
            db.rebuild_parent_path(table, key, parent_column, path_column)
                .await
        }
        RecomputeSpec::Statement { sql } => db.execute(sql).await,
    }
}
