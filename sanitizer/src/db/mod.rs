use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::plan::{ForeignKeyRule, OrderKey};

pub mod memory;
pub mod postgres;

// ---------- DTOs ----------

/// An existing foreign-key constraint as found in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyConstraint {
    pub name: String,
    pub rule: ForeignKeyRule,
}

/// One row of the external-identifier registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdRecord {
    /// Registry row key; `None` for a record not stored yet.
    pub id: Option<i64>,
    pub res_id: i64,
    pub module: String,
    pub name: String,
}

/// A key row with a few fields rendered as text (NULL -> None).
pub type FieldRow = (i64, Vec<Option<String>>);

// ---------- trait ----------

/// The engine's only seam to the DBMS.
///
/// Every call either completes or fails; nothing here retries. Table and
/// column names are bare identifiers, resolved inside the backend's schema.
/// Key pairs are always `(old, new)`.
#[async_trait]
pub trait Database: Send + Sync {
    /// Identity of the target database, for reports and logs.
    fn identity(&self) -> String;

    // --- catalog (read-only) ---

    async fn table_exists(&self, table: &str) -> Result<bool>;

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool>;

    async fn max_key(&self, table: &str, key: &str) -> Result<Option<i64>>;

    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Single-column foreign keys, in any table, whose referenced table is `table`.
    async fn constraints_referencing(&self, table: &str) -> Result<Vec<ForeignKeyConstraint>>;

    // --- transactions ---

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn savepoint(&self, name: &str) -> Result<()>;

    async fn release_savepoint(&self, name: &str) -> Result<()>;

    /// Undo work since the savepoint and leave the transaction usable again.
    async fn rollback_to_savepoint(&self, name: &str) -> Result<()>;

    // --- schema ---

    async fn drop_constraint(&self, table: &str, name: &str) -> Result<()>;

    async fn add_foreign_key(&self, name: &str, rule: &ForeignKeyRule) -> Result<()>;

    /// Enable or disable user (non-constraint) triggers on `table`.
    async fn set_user_triggers(&self, table: &str, enabled: bool) -> Result<()>;

    // --- rows ---

    async fn delete_where(&self, table: &str, predicate: &str) -> Result<u64>;

    /// Keys of rows matching `filter`, in `order_by` order, ties by key ascending.
    async fn select_keys(
        &self,
        table: &str,
        key: &str,
        filter: Option<&str>,
        order_by: &[OrderKey],
    ) -> Result<Vec<i64>>;

    /// `(key, column)` for rows where `column` is not null and `filter` matches.
    async fn select_key_pairs(
        &self,
        table: &str,
        key: &str,
        column: &str,
        filter: Option<&str>,
    ) -> Result<Vec<(i64, i64)>>;

    /// The subset of `candidates` present in the table.
    async fn existing_keys(&self, table: &str, key: &str, candidates: &[i64]) -> Result<Vec<i64>>;

    /// `key = key + offset` for every key in `keys`.
    async fn shift_keys(&self, table: &str, key: &str, keys: &[i64], offset: i64) -> Result<u64>;

    /// `key = new` where `key = old + offset`.
    async fn assign_keys(
        &self,
        table: &str,
        key: &str,
        pairs: &[(i64, i64)],
        offset: i64,
    ) -> Result<u64>;

    async fn delete_keys(&self, table: &str, key: &str, keys: &[i64]) -> Result<u64>;

    /// `column = new` where `column = old`, optionally restricted to rows
    /// whose discriminator column equals a value. One statement.
    async fn repoint(
        &self,
        table: &str,
        column: &str,
        pairs: &[(i64, i64)],
        discriminator: Option<(&str, &str)>,
    ) -> Result<u64>;

    /// `column = prefix || new` where `column = prefix || old`. One statement.
    async fn repoint_text(
        &self,
        table: &str,
        column: &str,
        prefix: &str,
        pairs: &[(i64, i64)],
    ) -> Result<u64>;

    async fn select_fields(
        &self,
        table: &str,
        key: &str,
        fields: &[String],
        filter: Option<&str>,
    ) -> Result<Vec<FieldRow>>;

    // --- external identifiers ---

    async fn external_ids(&self, registry: &str, model: &str) -> Result<Vec<ExternalIdRecord>>;

    /// Set module/name of stored records, matched by registry row key.
    /// Renames may permute names already in use.
    async fn update_external_ids(
        &self,
        registry: &str,
        model: &str,
        records: &[ExternalIdRecord],
    ) -> Result<u64>;

    async fn insert_external_ids(
        &self,
        registry: &str,
        model: &str,
        records: &[ExternalIdRecord],
    ) -> Result<u64>;

    // --- generators and derived state ---

    /// Reset the key generator to `max + 1`. `None` when the key has no generator.
    async fn sync_sequence(&self, table: &str, key: &str) -> Result<Option<i64>>;

    async fn rebuild_parent_path(
        &self,
        table: &str,
        key: &str,
        parent_column: &str,
        path_column: &str,
    ) -> Result<u64>;

    async fn execute(&self, sql: &str) -> Result<u64>;
}

/// Opens additional connections for the deferred worker pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Database>>;
}
