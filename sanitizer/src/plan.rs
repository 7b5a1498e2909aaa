//! Static table configuration consumed by the engine.
//!
//! Descriptors are produced by an external loader (the CLI reads them from a
//! JSON plan file) and are never mutated during a run.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SanitizerError};

// ---------- foreign keys ----------

/// Referential action of a foreign-key constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FkAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl FkAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            FkAction::NoAction => "NO ACTION",
            FkAction::Restrict => "RESTRICT",
            FkAction::Cascade => "CASCADE",
            FkAction::SetNull => "SET NULL",
            FkAction::SetDefault => "SET DEFAULT",
        }
    }

    /// Decode `pg_constraint.confupdtype` / `confdeltype`.
    pub fn from_pg_code(code: &str) -> Option<Self> {
        match code {
            "a" => Some(FkAction::NoAction),
            "r" => Some(FkAction::Restrict),
            "c" => Some(FkAction::Cascade),
            "n" => Some(FkAction::SetNull),
            "d" => Some(FkAction::SetDefault),
            _ => None,
        }
    }
}

fn default_cascade() -> FkAction {
    FkAction::Cascade
}

fn default_restrict() -> FkAction {
    FkAction::Restrict
}

/// One single-column foreign-key relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRule {
    pub referencing_table: String,
    pub referencing_column: String,
    pub referenced_table: String,
    pub referenced_column: String,
    #[serde(default = "default_cascade")]
    pub on_update: FkAction,
    #[serde(default = "default_restrict")]
    pub on_delete: FkAction,
    /// True when found in the catalog rather than declared in the plan.
    #[serde(default, skip_deserializing)]
    pub discovered: bool,
}

impl ForeignKeyRule {
    /// Same referencing (table, column) pair; actions are not compared.
    pub fn same_reference(&self, other: &ForeignKeyRule) -> bool {
        self.referencing_table == other.referencing_table
            && self.referencing_column == other.referencing_column
            && self.referenced_table == other.referenced_table
    }

    /// Postgres' default constraint name for this reference.
    pub fn default_constraint_name(&self) -> String {
        format!("{}_{}_fkey", self.referencing_table, self.referencing_column)
    }
}

// ---------- resequencing ----------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderKey {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

impl OrderKey {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// How the `id_shift` phase computes its mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ResequenceSpec {
    /// Explicit old -> new pairs. Targets that already exist are merges.
    Consolidation { pairs: Vec<(i64, i64)> },
    /// Matching rows get `start, start + 1, ...` in the given order.
    Sequential {
        start: i64,
        #[serde(default)]
        order_by: Vec<OrderKey>,
        #[serde(default)]
        filter: Option<String>,
    },
    /// A named strategy from the registry.
    Custom {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl ResequenceSpec {
    pub fn label(&self) -> &str {
        match self {
            ResequenceSpec::Consolidation { .. } => "consolidation",
            ResequenceSpec::Sequential { .. } => "sequential",
            ResequenceSpec::Custom { name, .. } => name,
        }
    }

    pub fn allows_merge(&self) -> bool {
        matches!(self, ResequenceSpec::Consolidation { .. })
    }
}

/// Gap elimination for keys at or above `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactSpec {
    #[serde(default = "default_compact_start")]
    pub start: i64,
}

fn default_compact_start() -> i64 {
    1
}

impl Default for CompactSpec {
    fn default() -> Self {
        Self { start: 1 }
    }
}

// ---------- external identifiers ----------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdSpec {
    /// Table holding `(module, name, model, res_id)` records.
    #[serde(default = "default_registry")]
    pub registry: String,
    pub module: String,
    pub model: String,
    /// e.g. `partner_{id}` or `country_{code}`.
    pub pattern: String,
    /// Eligibility predicate; all rows when absent.
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_registry() -> String {
    "ir_model_data".to_string()
}

// ---------- reference patches / recompute ----------

/// A reference to this table's keys that no foreign key enforces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReferencePatch {
    Column {
        table: String,
        column: String,
        #[serde(default)]
        model_column: Option<String>,
        #[serde(default)]
        model_value: Option<String>,
    },
    Text {
        table: String,
        column: String,
        prefix: String,
    },
}

impl ReferencePatch {
    pub fn describe(&self) -> String {
        match self {
            ReferencePatch::Column {
                table,
                column,
                model_value: Some(v),
                ..
            } => format!("{table}.{column} ({v})"),
            ReferencePatch::Column { table, column, .. } => format!("{table}.{column}"),
            ReferencePatch::Text {
                table,
                column,
                prefix,
            } => format!("{table}.{column} ('{prefix}')"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecomputeSpec {
    ParentPath {
        parent_column: String,
        path_column: String,
    },
    Statement { sql: String },
}

// ---------- phases ----------

/// Per-phase enable flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseFlags {
    pub fk_rewrite: bool,
    pub cleanup: bool,
    pub id_shift: bool,
    pub id_compact: bool,
    pub patch_refs: bool,
    pub xmlid_rebuild: bool,
    pub sequence_sync: bool,
    pub recompute: bool,
}

/// Phase switches as written in a plan; unset ones take the descriptor's default.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PhaseSwitches {
    fk_rewrite: Option<bool>,
    cleanup: Option<bool>,
    id_shift: Option<bool>,
    id_compact: Option<bool>,
    patch_refs: Option<bool>,
    xmlid_rebuild: Option<bool>,
    sequence_sync: Option<bool>,
    recompute: Option<bool>,
}

impl PhaseFlags {
    pub fn none() -> Self {
        Self {
            fk_rewrite: false,
            cleanup: false,
            id_shift: false,
            id_compact: false,
            patch_refs: false,
            xmlid_rebuild: false,
            sequence_sync: false,
            recompute: false,
        }
    }

    pub fn any(&self) -> bool {
        self.fk_rewrite
            || self.cleanup
            || self.id_shift
            || self.id_compact
            || self.patch_refs
            || self.xmlid_rebuild
            || self.sequence_sync
            || self.recompute
    }
}

// ---------- descriptor ----------

fn default_key() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PlannedTable")]
pub struct TableDescriptor {
    pub table: String,
    pub key: String,
    pub foreign_keys: Vec<ForeignKeyRule>,
    pub cleanup: Vec<String>,
    pub resequence: Option<ResequenceSpec>,
    pub compact: CompactSpec,
    pub patches: Vec<ReferencePatch>,
    pub external_id: Option<ExternalIdSpec>,
    pub recompute: Vec<RecomputeSpec>,
    pub phases: PhaseFlags,
}

/// A descriptor as written in a plan file.
#[derive(Deserialize)]
struct PlannedTable {
    table: String,
    #[serde(default = "default_key")]
    key: String,
    #[serde(default)]
    foreign_keys: Vec<ForeignKeyRule>,
    #[serde(default)]
    cleanup: Vec<String>,
    #[serde(default)]
    resequence: Option<ResequenceSpec>,
    #[serde(default)]
    compact: CompactSpec,
    #[serde(default)]
    patches: Vec<ReferencePatch>,
    #[serde(default)]
    external_id: Option<ExternalIdSpec>,
    #[serde(default)]
    recompute: Vec<RecomputeSpec>,
    #[serde(default)]
    phases: PhaseSwitches,
}

impl From<PlannedTable> for TableDescriptor {
    fn from(p: PlannedTable) -> Self {
        let d = TableDescriptor {
            table: p.table,
            key: p.key,
            foreign_keys: p.foreign_keys,
            cleanup: p.cleanup,
            resequence: p.resequence,
            compact: p.compact,
            patches: p.patches,
            external_id: p.external_id,
            recompute: p.recompute,
            phases: PhaseFlags::none(),
        };
        // Phases that need a spec default to on only when it is given.
        let s = p.phases;
        let phases = PhaseFlags {
            fk_rewrite: s.fk_rewrite.unwrap_or(true),
            cleanup: s.cleanup.unwrap_or(!d.cleanup.is_empty()),
            id_shift: s.id_shift.unwrap_or(d.resequence.is_some()),
            id_compact: s.id_compact.unwrap_or(true),
            patch_refs: s.patch_refs.unwrap_or(!d.patches.is_empty()),
            xmlid_rebuild: s.xmlid_rebuild.unwrap_or(d.external_id.is_some()),
            sequence_sync: s.sequence_sync.unwrap_or(true),
            recompute: s.recompute.unwrap_or(!d.recompute.is_empty()),
        };
        TableDescriptor { phases, ..d }
    }
}

impl TableDescriptor {
    /// A descriptor with every phase disabled; enable what you need.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: default_key(),
            foreign_keys: Vec::new(),
            cleanup: Vec::new(),
            resequence: None,
            compact: CompactSpec::default(),
            patches: Vec::new(),
            external_id: None,
            recompute: Vec::new(),
            phases: PhaseFlags::none(),
        }
    }

    /// Structural checks that need no database access.
    pub fn check_shape(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(SanitizerError::validation("table name is empty"));
        }
        if self.key.trim().is_empty() {
            return Err(SanitizerError::validation(format!(
                "{}: key column is empty",
                self.table
            )));
        }
        for rule in &self.foreign_keys {
            if rule.referenced_table != self.table {
                return Err(SanitizerError::validation(format!(
                    "{}: declared rule {}.{} references {}, not this table",
                    self.table,
                    rule.referencing_table,
                    rule.referencing_column,
                    rule.referenced_table
                )));
            }
        }
        if self.phases.id_shift && self.resequence.is_none() {
            return Err(SanitizerError::validation(format!(
                "{}: id_shift enabled without a resequence strategy",
                self.table
            )));
        }
        if self.phases.xmlid_rebuild && self.external_id.is_none() {
            return Err(SanitizerError::validation(format!(
                "{}: xmlid_rebuild enabled without an external id spec",
                self.table
            )));
        }
        Ok(())
    }
}

/// Parse a JSON plan (an array of descriptors).
pub fn parse_plan(json: &str) -> Result<Vec<TableDescriptor>> {
    let plan: Vec<TableDescriptor> = serde_json::from_str(json)
        .map_err(|e| SanitizerError::validation(format!("invalid plan: {e}")))?;
    for descriptor in &plan {
        descriptor.check_shape()?;
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_table_parses_with_spec_free_phases() {
        let plan = parse_plan(r#"[{"table": "t"}]"#).unwrap();
        let phases = plan[0].phases;
        assert!(phases.fk_rewrite && phases.id_compact && phases.sequence_sync);
        assert!(!phases.cleanup && !phases.id_shift && !phases.patch_refs);
        assert!(!phases.xmlid_rebuild && !phases.recompute);
    }

    #[test]
    fn test_explicit_switch_overrides_default() {
        let plan = parse_plan(
            r#"[{"table": "t", "cleanup": ["active = false"],
                 "phases": {"cleanup": false, "sequence_sync": false}}]"#,
        )
        .unwrap();
        assert!(!plan[0].phases.cleanup);
        assert!(!plan[0].phases.sequence_sync);
        assert!(plan[0].phases.id_compact);
        assert!(parse_plan(r#"[{"table": "t", "phases": {"id_shift": true}}]"#).is_err());
        assert!(parse_plan(r#"[{"table": "t", "phases": {"reindex": true}}]"#).is_err());
    }

    #[test]
    fn test_parse_plan_enables_phases_with_specs() {
        let plan = parse_plan(
            r#"[{"table": "res_partner",
                 "resequence": {"strategy": "sequential", "start": 1},
                 "external_id": {"module": "base", "model": "res.partner",
                                 "pattern": "partner_{id}"}}]"#,
        )
        .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].key, "id");
        assert!(plan[0].phases.id_compact);
        assert!(plan[0].phases.id_shift);
        assert!(plan[0].phases.xmlid_rebuild);
        assert!(!plan[0].phases.recompute);
        assert_eq!(plan[0].compact.start, 1);
        assert_eq!(
            plan[0].external_id.as_ref().unwrap().registry,
            "ir_model_data"
        );
    }

    #[test]
    fn test_declared_rule_defaults_to_cascade_update() {
        let plan = parse_plan(
            r#"[{"table": "t",
                 "foreign_keys": [{"referencing_table": "d", "referencing_column": "t_id",
                                   "referenced_table": "t", "referenced_column": "id",
                                   "on_delete": "set_null"}]}]"#,
        )
        .unwrap();
        let rule = &plan[0].foreign_keys[0];
        assert_eq!(rule.on_update, FkAction::Cascade);
        assert_eq!(rule.on_delete, FkAction::SetNull);
        assert!(!rule.discovered);
    }

    #[test]
    fn test_rule_for_other_table_is_rejected() {
        let result = parse_plan(
            r#"[{"table": "t",
                 "foreign_keys": [{"referencing_table": "d", "referencing_column": "x_id",
                                   "referenced_table": "x", "referenced_column": "id"}]}]"#,
        );
        assert!(matches!(result, Err(SanitizerError::Validation(_))));
    }

    #[test]
    fn test_id_shift_requires_strategy() {
        let mut d = TableDescriptor::new("t");
        d.phases.id_shift = true;
        assert!(d.check_shape().is_err());
        d.resequence = Some(ResequenceSpec::Consolidation { pairs: vec![(8, 7)] });
        assert!(d.check_shape().is_ok());
    }

    #[test]
    fn test_custom_strategy_round_trips_params() {
        let spec: ResequenceSpec = serde_json::from_str(
            r#"{"strategy": "custom", "name": "key_from_column",
                "params": {"column": "partner_id"}}"#,
        )
        .unwrap();
        assert_eq!(spec.label(), "key_from_column");
        assert!(!spec.allows_merge());
    }

    #[test]
    fn test_pg_action_codes() {
        assert_eq!(FkAction::from_pg_code("c"), Some(FkAction::Cascade));
        assert_eq!(FkAction::from_pg_code("a"), Some(FkAction::NoAction));
        assert_eq!(FkAction::from_pg_code("?"), None);
        assert_eq!(FkAction::SetNull.as_sql(), "SET NULL");
    }

    #[test]
    fn test_all_disabled_is_detected() {
        assert!(!PhaseFlags::none().any());
        assert!(!TableDescriptor::new("t").phases.any());
        let mut flags = PhaseFlags::none();
        flags.recompute = true;
        assert!(flags.any());
    }
}
