//! `patch_refs`: rewrite references no foreign key enforces.

use crate::db::Database;
use crate::error::Result;
use crate::plan::ReferencePatch;
use crate::resequence::IdMapping;

/// Apply one patch with the table's effective mapping. One statement.
pub async fn apply_patch(
    db: &dyn Database,
    patch: &ReferencePatch,
    mapping: &IdMapping,
) -> Result<u64> {
    if mapping.is_empty() {
        return Ok(0);
    }
    match patch {
        ReferencePatch::Column {
            table,
            column,
            model_column,
            model_value,
        } => {
            let discriminator = match (model_column, model_value) {
                (Some(c), Some(v)) => Some((c.as_str(), v.as_str())),
                _ => None,
            };
            db.repoint(table, column, mapping.pairs(), discriminator).await
        }
        ReferencePatch::Text {
            table,
            column,
            prefix,
        } => db.repoint_text(table, column, prefix, mapping.pairs()).await,
    }
}
