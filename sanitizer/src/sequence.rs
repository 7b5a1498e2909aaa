//! Key generator synchronisation.

use crate::db::Database;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// The next generated key is now this value.
    Reset { next: i64 },
    /// The key column has no generator.
    NoSequence,
}

/// Point the table's key generator at `max(key) + 1` (1 for an empty table).
/// Idempotent; safe to run when nothing changed.
pub async fn synchronize(db: &dyn Database, table: &str, key: &str) -> Result<SequenceOutcome> {
    let outcome = match db.sync_sequence(table, key).await? {
        Some(next) => SequenceOutcome::Reset { next },
        None => SequenceOutcome::NoSequence,
    };
    tracing::debug!(table = %table, outcome = ?outcome, "Sequence synchronized");
    Ok(outcome)
}
