//! In-memory backend.
//!
//! Models what the engine relies on from a real DBMS: primary-key uniqueness
//! checked row by row, foreign-key actions on update/delete, statement
//! atomicity, a single transaction with rollback, aborted-transaction state,
//! user triggers and non-transactional sequences. SQL fragments (filters,
//! cleanup predicates, raw statements) are resolved through closures
//! registered under their exact text. Faults can be injected per operation.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Connector, Database, ExternalIdRecord, FieldRow, ForeignKeyConstraint};
use crate::error::{Result, SanitizerError};
use crate::plan::{FkAction, ForeignKeyRule, OrderKey};

const MAX_CASCADE_DEPTH: usize = 16;

// ---------- values ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(v) => Some(v.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }

    /// Postgres ordering: NULLs sort last ascending.
    fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Greater,
            (_, Value::Null) => Ordering::Less,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (a, b) => a.as_text().cmp(&b.as_text()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        v.map(Value::Int).unwrap_or(Value::Null)
    }
}

pub type Row = BTreeMap<String, Value>;

pub type Predicate = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

/// Row mutation standing in for a raw SQL statement; returns true if the row changed.
pub type RowStatement = Arc<dyn Fn(&mut Row) -> bool + Send + Sync>;

/// One firing of a user trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFire {
    pub table: String,
    pub key: Option<i64>,
}

// ---------- storage ----------

#[derive(Debug, Clone)]
struct MemTable {
    key: String,
    columns: Vec<String>,
    rows: Vec<Row>,
    has_trigger: bool,
    triggers_enabled: bool,
    has_sequence: bool,
}

impl MemTable {
    fn key_of(&self, row: &Row) -> Option<i64> {
        row.get(&self.key).and_then(Value::as_int)
    }

    fn position(&self, key: i64) -> Option<usize> {
        self.rows.iter().position(|r| self.key_of(r) == Some(key))
    }

    fn fires(&self) -> bool {
        self.has_trigger && self.triggers_enabled
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: BTreeMap<String, MemTable>,
    constraints: Vec<ForeignKeyConstraint>,
}

impl State {
    fn table(&self, name: &str) -> Result<&MemTable> {
        self.tables
            .get(name)
            .ok_or_else(|| SanitizerError::schema(name, "relation does not exist"))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| SanitizerError::schema(name, "relation does not exist"))
    }

    fn require_column(&self, table: &str, column: &str) -> Result<()> {
        if self.table(table)?.columns.iter().any(|c| c == column) {
            Ok(())
        } else {
            Err(SanitizerError::schema(
                format!("{table}.{column}"),
                "column does not exist",
            ))
        }
    }

    fn inbound(&self, table: &str, column: &str) -> Vec<ForeignKeyConstraint> {
        self.constraints
            .iter()
            .filter(|c| c.rule.referenced_table == table && c.rule.referenced_column == column)
            .cloned()
            .collect()
    }

    /// Row-by-row key update with an immediate uniqueness check.
    fn set_key(
        &mut self,
        table: &str,
        old: i64,
        new: i64,
        log: &mut Vec<TriggerFire>,
    ) -> Result<()> {
        let t = self.table_mut(table)?;
        if t.position(new).is_some() {
            return Err(SanitizerError::constraint(
                format!("{table}_pkey"),
                format!("duplicate key value ({})=({new})", t.key),
            ));
        }
        let idx = t.position(old).ok_or_else(|| {
            SanitizerError::Query(format!("{table}: no row with key {old}"))
        })?;
        let key = t.key.clone();
        t.rows[idx].insert(key.clone(), Value::Int(new));
        if t.fires() {
            log.push(TriggerFire {
                table: table.to_string(),
                key: Some(new),
            });
        }
        self.propagate_update(table, &key, &Value::Int(old), &Value::Int(new), log, 0)
    }

    fn propagate_update(
        &mut self,
        table: &str,
        column: &str,
        old: &Value,
        new: &Value,
        log: &mut Vec<TriggerFire>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_CASCADE_DEPTH {
            return Err(SanitizerError::Query("cascade depth exceeded".into()));
        }
        for c in self.inbound(table, column) {
            let referencing = c.rule.referencing_table.clone();
            let col = c.rule.referencing_column.clone();
            let rt = self.table_mut(&referencing)?;
            let hits: Vec<usize> = rt
                .rows
                .iter()
                .enumerate()
                .filter(|(_, r)| r.get(&col) == Some(old))
                .map(|(i, _)| i)
                .collect();
            if hits.is_empty() {
                continue;
            }
            let replacement = match c.rule.on_update {
                FkAction::Cascade => new.clone(),
                FkAction::SetNull => Value::Null,
                _ => {
                    return Err(SanitizerError::constraint(
                        &c.name,
                        format!(
                            "update on {table} violates foreign key on {referencing}.{col}"
                        ),
                    ));
                }
            };
            for i in hits {
                rt.rows[i].insert(col.clone(), replacement.clone());
                if rt.fires() {
                    let key = rt.key_of(&rt.rows[i]);
                    log.push(TriggerFire {
                        table: referencing.clone(),
                        key,
                    });
                }
            }
            self.propagate_update(&referencing, &col, old, &replacement, log, depth + 1)?;
        }
        Ok(())
    }

    /// Delete rows whose `column` is one of `values`, applying delete actions.
    fn delete_matching(
        &mut self,
        table: &str,
        column: &str,
        values: &[Value],
        log: &mut Vec<TriggerFire>,
        depth: usize,
    ) -> Result<u64> {
        if depth > MAX_CASCADE_DEPTH {
            return Err(SanitizerError::Query("cascade depth exceeded".into()));
        }
        let t = self.table_mut(table)?;
        let (removed, kept): (Vec<Row>, Vec<Row>) = t
            .rows
            .drain(..)
            .partition(|r| r.get(column).is_some_and(|v| values.contains(v)));
        t.rows = kept;
        if t.fires() {
            for r in &removed {
                log.push(TriggerFire {
                    table: table.to_string(),
                    key: t.key_of(r),
                });
            }
        }

        let referenced_columns: Vec<String> = self
            .constraints
            .iter()
            .filter(|c| c.rule.referenced_table == table)
            .map(|c| c.rule.referenced_column.clone())
            .collect();
        for ref_col in referenced_columns {
            let gone: Vec<Value> = removed
                .iter()
                .filter_map(|r| r.get(&ref_col).cloned())
                .filter(|v| *v != Value::Null)
                .collect();
            if gone.is_empty() {
                continue;
            }
            for c in self.inbound(table, &ref_col) {
                let referencing = c.rule.referencing_table.clone();
                let col = c.rule.referencing_column.clone();
                let referenced = self
                    .table(&referencing)?
                    .rows
                    .iter()
                    .any(|r| r.get(&col).is_some_and(|v| gone.contains(v)));
                if !referenced {
                    continue;
                }
                match c.rule.on_delete {
                    FkAction::Cascade => {
                        self.delete_matching(&referencing, &col, &gone, log, depth + 1)?;
                    }
                    FkAction::SetNull => {
                        let rt = self.table_mut(&referencing)?;
                        for r in rt.rows.iter_mut() {
                            if r.get(&col).is_some_and(|v| gone.contains(v)) {
                                r.insert(col.clone(), Value::Null);
                            }
                        }
                    }
                    _ => {
                        return Err(SanitizerError::constraint(
                            &c.name,
                            format!(
                                "delete on {table} violates foreign key on {referencing}.{col}"
                            ),
                        ));
                    }
                }
            }
        }
        Ok(removed.len() as u64)
    }

    /// Referencing-side check for a value written into `table.column`.
    fn check_reference(&self, table: &str, column: &str, value: &Value) -> Result<()> {
        if *value == Value::Null {
            return Ok(());
        }
        for c in self
            .constraints
            .iter()
            .filter(|c| c.rule.referencing_table == table && c.rule.referencing_column == column)
        {
            let target = self.table(&c.rule.referenced_table)?;
            if !target
                .rows
                .iter()
                .any(|r| r.get(&c.rule.referenced_column) == Some(value))
            {
                return Err(SanitizerError::constraint(
                    &c.name,
                    format!(
                        "{table}.{column}={value:?} is not present in {}",
                        c.rule.referenced_table
                    ),
                ));
            }
        }
        Ok(())
    }
}

// ---------- shared handle ----------

struct Fault {
    op: String,
    table: String,
    error: SanitizerError,
}

#[derive(Default)]
struct Shared {
    state: State,
    snapshot: Option<State>,
    savepoints: Vec<(String, State)>,
    aborted: bool,
    connected: bool,
    sequences: BTreeMap<String, i64>,
    trigger_log: Vec<TriggerFire>,
    predicates: HashMap<String, Predicate>,
    statements: HashMap<String, (String, RowStatement)>,
    faults: Vec<Fault>,
    calls: Vec<String>,
}

/// Cheap to clone; clones share the same storage and the single
/// transaction slot. Handles returned by `Connector::connect` are detached:
/// they autocommit, ignore the other session's aborted state, and their
/// writes survive that session's rollback.
#[derive(Clone)]
pub struct MemoryDatabase {
    name: String,
    shared: Arc<Mutex<Shared>>,
    detached: bool,
}

impl fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.name)
            .finish()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Shared {
            connected: true,
            ..Shared::default()
        };
        Self {
            name: name.into(),
            shared: Arc::new(Mutex::new(shared)),
            detached: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- setup ---

    /// Create a table whose key column has a sequence.
    pub fn create_table(&self, name: &str, key: &str, columns: &[&str]) {
        let mut cols: Vec<String> = vec![key.to_string()];
        cols.extend(columns.iter().filter(|c| **c != key).map(|c| c.to_string()));
        let mut shared = self.lock();
        shared.state.tables.insert(
            name.to_string(),
            MemTable {
                key: key.to_string(),
                columns: cols,
                rows: Vec::new(),
                has_trigger: false,
                triggers_enabled: true,
                has_sequence: true,
            },
        );
        shared.sequences.insert(name.to_string(), 1);
    }

    /// Drop the key generator of a table (e.g. a manually keyed table).
    pub fn without_sequence(&self, table: &str) {
        let mut shared = self.lock();
        if let Some(t) = shared.state.tables.get_mut(table) {
            t.has_sequence = false;
        }
        shared.sequences.remove(table);
    }

    pub fn add_user_trigger(&self, table: &str) {
        if let Some(t) = self.lock().state.tables.get_mut(table) {
            t.has_trigger = true;
        }
    }

    /// Insert a row; unknown columns and duplicate keys are rejected.
    pub fn insert(&self, table: &str, values: &[(&str, Value)]) -> Result<()> {
        let mut shared = self.lock();
        let t = shared.state.table(table)?;
        let mut row = Row::new();
        for col in &t.columns {
            row.insert(col.clone(), Value::Null);
        }
        for (col, value) in values {
            if !t.columns.iter().any(|c| c == col) {
                return Err(SanitizerError::schema(
                    format!("{table}.{col}"),
                    "column does not exist",
                ));
            }
            row.insert(col.to_string(), value.clone());
        }
        if let Some(k) = t.key_of(&row).filter(|k| t.position(*k).is_some()) {
            return Err(SanitizerError::constraint(
                format!("{table}_pkey"),
                format!("duplicate key value {k}"),
            ));
        }
        for (col, value) in &row {
            shared.state.check_reference(table, col, value)?;
        }
        shared.state.table_mut(table)?.rows.push(row);
        Ok(())
    }

    /// Convenience for `insert` with a key and integer/text columns.
    pub fn insert_row(&self, table: &str, key: i64, values: &[(&str, Value)]) -> Result<()> {
        let key_column = self.lock().state.table(table)?.key.clone();
        let mut all = vec![(key_column.as_str(), Value::Int(key))];
        all.extend(values.iter().cloned());
        self.insert(table, &all)
    }

    /// Add a foreign-key constraint directly (as if present before the run).
    pub fn add_constraint(&self, name: &str, rule: ForeignKeyRule) -> Result<()> {
        let mut shared = self.lock();
        shared.state.require_column(&rule.referencing_table, &rule.referencing_column)?;
        shared.state.require_column(&rule.referenced_table, &rule.referenced_column)?;
        shared.state.constraints.push(ForeignKeyConstraint {
            name: name.to_string(),
            rule,
        });
        Ok(())
    }

    pub fn register_predicate(
        &self,
        sql: &str,
        predicate: impl Fn(&Row) -> bool + Send + Sync + 'static,
    ) {
        self.lock()
            .predicates
            .insert(sql.to_string(), Arc::new(predicate));
    }

    pub fn register_statement(
        &self,
        sql: &str,
        table: &str,
        statement: impl Fn(&mut Row) -> bool + Send + Sync + 'static,
    ) {
        self.lock()
            .statements
            .insert(sql.to_string(), (table.to_string(), Arc::new(statement)));
    }

    /// Make operation `op` (a `Database` method name) fail on `table`.
    pub fn fail_on(&self, op: &str, table: &str, error: SanitizerError) {
        self.lock().faults.push(Fault {
            op: op.to_string(),
            table: table.to_string(),
            error,
        });
    }

    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    // --- inspection ---

    /// Keys of a table, ascending.
    pub fn keys(&self, table: &str) -> Vec<i64> {
        let shared = self.lock();
        let Ok(t) = shared.state.table(table) else {
            return vec![];
        };
        let mut keys: Vec<i64> = t.rows.iter().filter_map(|r| t.key_of(r)).collect();
        keys.sort_unstable();
        keys
    }

    /// `(key, value)` of one column, ordered by key.
    pub fn column(&self, table: &str, column: &str) -> Vec<(i64, Value)> {
        let shared = self.lock();
        let Ok(t) = shared.state.table(table) else {
            return vec![];
        };
        let mut out: Vec<(i64, Value)> = t
            .rows
            .iter()
            .filter_map(|r| {
                let k = t.key_of(r)?;
                Some((k, r.get(column).cloned().unwrap_or(Value::Null)))
            })
            .collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }

    pub fn value(&self, table: &str, key: i64, column: &str) -> Option<Value> {
        self.column(table, column)
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn constraints(&self) -> Vec<ForeignKeyConstraint> {
        self.lock().state.constraints.clone()
    }

    pub fn triggers_enabled(&self, table: &str) -> bool {
        self.lock()
            .state
            .tables
            .get(table)
            .is_some_and(|t| t.triggers_enabled)
    }

    pub fn trigger_log(&self) -> Vec<TriggerFire> {
        self.lock().trigger_log.clone()
    }

    /// Simulate `nextval()`.
    pub fn next_value(&self, table: &str) -> Option<i64> {
        let mut shared = self.lock();
        let next = shared.sequences.get_mut(table)?;
        let value = *next;
        *next += 1;
        Some(value)
    }

    pub fn peek_sequence(&self, table: &str) -> Option<i64> {
        self.lock().sequences.get(table).copied()
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().snapshot.is_some()
    }

    /// Operation log: `"<op> <table>"` per call.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    // --- plumbing ---

    fn enter(&self, op: &str, table: &str) -> Result<MutexGuard<'_, Shared>> {
        let mut shared = self.lock();
        if !shared.connected {
            return Err(SanitizerError::Connectivity("connection refused".into()));
        }
        shared.calls.push(format!("{op} {table}"));
        let fault = shared
            .faults
            .iter()
            .find(|f| f.op == op && (f.table == table || f.table == "*"))
            .map(|f| f.error.clone());
        if let Some(err) = fault {
            self.doom(&mut shared);
            return Err(err);
        }
        if shared.aborted && !self.detached {
            return Err(SanitizerError::Query(
                "current transaction is aborted, commands ignored until end of transaction block"
                    .into(),
            ));
        }
        Ok(shared)
    }

    /// A failed statement aborts the open transaction.
    fn doom(&self, shared: &mut Shared) {
        if shared.snapshot.is_some() && !self.detached {
            shared.aborted = true;
        }
    }

    fn read<T>(&self, op: &str, table: &str, f: impl FnOnce(&Shared) -> Result<T>) -> Result<T> {
        let mut shared = self.enter(op, table)?;
        let result = f(&shared);
        if result.is_err() {
            self.doom(&mut shared);
        }
        result
    }

    /// Run a statement atomically: changes land only if it succeeds.
    fn write<T>(
        &self,
        op: &str,
        table: &str,
        f: impl Fn(&mut State, &Shared, &mut Vec<TriggerFire>) -> Result<T>,
    ) -> Result<T> {
        let mut shared = self.enter(op, table)?;
        let mut working = shared.state.clone();
        let mut fired = Vec::new();
        match f(&mut working, &shared, &mut fired) {
            Ok(value) => {
                // Replay onto the other session's rollback point.
                let mut replayed = None;
                if self.detached
                    && let Some(snapshot) = &shared.snapshot
                {
                    let mut base = snapshot.clone();
                    if f(&mut base, &shared, &mut Vec::new()).is_ok() {
                        replayed = Some(base);
                    }
                }
                if replayed.is_some() {
                    shared.snapshot = replayed;
                }
                shared.state = working;
                shared.trigger_log.extend(fired);
                Ok(value)
            }
            Err(e) => {
                self.doom(&mut shared);
                Err(e)
            }
        }
    }

    fn predicate(shared: &Shared, filter: Option<&str>) -> Result<Option<Predicate>> {
        match filter {
            None => Ok(None),
            Some(f) if f.trim().is_empty() => Ok(None),
            Some(f) => shared
                .predicates
                .get(f)
                .cloned()
                .map(Some)
                .ok_or_else(|| SanitizerError::Query(format!("syntax error in predicate {f:?}"))),
        }
    }
}

fn row_matches(pred: &Option<Predicate>, row: &Row) -> bool {
    pred.as_ref().is_none_or(|p| p(row))
}

#[async_trait]
impl Database for MemoryDatabase {
    fn identity(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.read("table_exists", table, |s| {
            Ok(s.state.tables.contains_key(table))
        })
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        self.read("column_exists", table, |s| {
            Ok(s.state
                .tables
                .get(table)
                .is_some_and(|t| t.columns.iter().any(|c| c == column)))
        })
    }

    async fn max_key(&self, table: &str, key: &str) -> Result<Option<i64>> {
        self.read("max_key", table, |s| {
            s.state.require_column(table, key)?;
            let t = s.state.table(table)?;
            Ok(t.rows.iter().filter_map(|r| r.get(key)?.as_int()).max())
        })
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        self.read("row_count", table, |s| {
            Ok(s.state.table(table)?.rows.len() as u64)
        })
    }

    async fn constraints_referencing(&self, table: &str) -> Result<Vec<ForeignKeyConstraint>> {
        self.read("constraints_referencing", table, |s| {
            let mut found: Vec<ForeignKeyConstraint> = s
                .state
                .constraints
                .iter()
                .filter(|c| c.rule.referenced_table == table)
                .cloned()
                .map(|mut c| {
                    c.rule.discovered = true;
                    c
                })
                .collect();
            found.sort_by(|a, b| {
                (&a.rule.referencing_table, &a.rule.referencing_column, &a.name).cmp(&(
                    &b.rule.referencing_table,
                    &b.rule.referencing_column,
                    &b.name,
                ))
            });
            Ok(found)
        })
    }

    async fn begin(&self) -> Result<()> {
        let mut shared = self.enter("begin", "")?;
        if shared.snapshot.is_some() {
            return Err(SanitizerError::Query("transaction already in progress".into()));
        }
        shared.snapshot = Some(shared.state.clone());
        shared.savepoints.clear();
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut shared = self.lock();
        if !shared.connected {
            return Err(SanitizerError::Connectivity("connection refused".into()));
        }
        shared.calls.push("commit ".to_string());
        if shared.aborted {
            // COMMIT of an aborted transaction rolls back.
            if let Some(snapshot) = shared.snapshot.take() {
                shared.state = snapshot;
            }
            shared.aborted = false;
            shared.savepoints.clear();
            return Err(SanitizerError::Query("transaction was aborted".into()));
        }
        shared.snapshot = None;
        shared.savepoints.clear();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut shared = self.lock();
        if !shared.connected {
            return Err(SanitizerError::Connectivity("connection refused".into()));
        }
        shared.calls.push("rollback ".to_string());
        if let Some(snapshot) = shared.snapshot.take() {
            shared.state = snapshot;
        }
        shared.savepoints.clear();
        shared.aborted = false;
        Ok(())
    }

    async fn savepoint(&self, name: &str) -> Result<()> {
        let mut shared = self.enter("savepoint", name)?;
        if shared.snapshot.is_none() {
            return Err(SanitizerError::Query(
                "SAVEPOINT can only be used in transaction blocks".into(),
            ));
        }
        let state = shared.state.clone();
        shared.savepoints.push((name.to_string(), state));
        Ok(())
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        let mut shared = self.enter("release_savepoint", name)?;
        let Some(idx) = shared.savepoints.iter().rposition(|(n, _)| n == name) else {
            self.doom(&mut shared);
            return Err(SanitizerError::Query(format!("savepoint \"{name}\" does not exist")));
        };
        shared.savepoints.truncate(idx);
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        // Allowed in an aborted transaction: that is what it is for.
        let mut shared = self.lock();
        if !shared.connected {
            return Err(SanitizerError::Connectivity("connection refused".into()));
        }
        shared.calls.push(format!("rollback_to_savepoint {name}"));
        let Some(idx) = shared.savepoints.iter().rposition(|(n, _)| n == name) else {
            return Err(SanitizerError::Query(format!("savepoint \"{name}\" does not exist")));
        };
        let state = shared.savepoints[idx].1.clone();
        shared.savepoints.truncate(idx + 1);
        shared.state = state;
        shared.aborted = false;
        Ok(())
    }

    async fn drop_constraint(&self, table: &str, name: &str) -> Result<()> {
        self.write("drop_constraint", table, |state, _, _| {
            state.table(table)?;
            state
                .constraints
                .retain(|c| !(c.name == name && c.rule.referencing_table == table));
            Ok(())
        })
    }

    async fn add_foreign_key(&self, name: &str, rule: &ForeignKeyRule) -> Result<()> {
        let table = rule.referencing_table.clone();
        self.write("add_foreign_key", &table, |state, _, _| {
            state.require_column(&rule.referencing_table, &rule.referencing_column)?;
            state.require_column(&rule.referenced_table, &rule.referenced_column)?;
            if state
                .constraints
                .iter()
                .any(|c| c.name == name && c.rule.referencing_table == rule.referencing_table)
            {
                return Err(SanitizerError::schema(name, "constraint already exists"));
            }
            state.constraints.push(ForeignKeyConstraint {
                name: name.to_string(),
                rule: ForeignKeyRule {
                    discovered: false,
                    ..rule.clone()
                },
            });
            // Existing rows must satisfy the new constraint.
            let values: Vec<Value> = state
                .table(&rule.referencing_table)?
                .rows
                .iter()
                .filter_map(|r| r.get(&rule.referencing_column).cloned())
                .collect();
            for v in values {
                state.check_reference(&rule.referencing_table, &rule.referencing_column, &v)?;
            }
            Ok(())
        })
    }

    async fn set_user_triggers(&self, table: &str, enabled: bool) -> Result<()> {
        self.write("set_user_triggers", table, |state, _, _| {
            state.table_mut(table)?.triggers_enabled = enabled;
            Ok(())
        })
    }

    async fn delete_where(&self, table: &str, predicate: &str) -> Result<u64> {
        self.write("delete_where", table, |state, shared, log| {
            let pred = Self::predicate(shared, Some(predicate))?;
            let t = state.table(table)?;
            let key = t.key.clone();
            let doomed: Vec<Value> = t
                .rows
                .iter()
                .filter(|r| row_matches(&pred, r))
                .filter_map(|r| r.get(&key).cloned())
                .collect();
            if doomed.is_empty() {
                return Ok(0);
            }
            state.delete_matching(table, &key, &doomed, log, 0)
        })
    }

    async fn select_keys(
        &self,
        table: &str,
        key: &str,
        filter: Option<&str>,
        order_by: &[OrderKey],
    ) -> Result<Vec<i64>> {
        self.read("select_keys", table, |s| {
            s.state.require_column(table, key)?;
            for o in order_by {
                s.state.require_column(table, &o.column)?;
            }
            let pred = Self::predicate(s, filter)?;
            let t = s.state.table(table)?;
            let mut rows: Vec<&Row> = t.rows.iter().filter(|r| row_matches(&pred, r)).collect();
            rows.sort_by(|a, b| {
                for o in order_by {
                    let va = a.get(&o.column).unwrap_or(&Value::Null);
                    let vb = b.get(&o.column).unwrap_or(&Value::Null);
                    let mut ord = va.sort_cmp(vb);
                    if o.descending {
                        ord = ord.reverse();
                    }
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                t.key_of(a).cmp(&t.key_of(b))
            });
            Ok(rows.into_iter().filter_map(|r| t.key_of(r)).collect())
        })
    }

    async fn select_key_pairs(
        &self,
        table: &str,
        key: &str,
        column: &str,
        filter: Option<&str>,
    ) -> Result<Vec<(i64, i64)>> {
        self.read("select_key_pairs", table, |s| {
            s.state.require_column(table, key)?;
            s.state.require_column(table, column)?;
            let pred = Self::predicate(s, filter)?;
            let t = s.state.table(table)?;
            let mut pairs: Vec<(i64, i64)> = t
                .rows
                .iter()
                .filter(|r| row_matches(&pred, r))
                .filter_map(|r| Some((t.key_of(r)?, r.get(column)?.as_int()?)))
                .collect();
            pairs.sort_unstable();
            Ok(pairs)
        })
    }

    async fn existing_keys(&self, table: &str, key: &str, candidates: &[i64]) -> Result<Vec<i64>> {
        self.read("existing_keys", table, |s| {
            s.state.require_column(table, key)?;
            let t = s.state.table(table)?;
            let mut found: Vec<i64> = t
                .rows
                .iter()
                .filter_map(|r| t.key_of(r))
                .filter(|k| candidates.contains(k))
                .collect();
            found.sort_unstable();
            Ok(found)
        })
    }

    async fn shift_keys(&self, table: &str, key: &str, keys: &[i64], offset: i64) -> Result<u64> {
        self.write("shift_keys", table, |state, _, log| {
            state.require_column(table, key)?;
            let present: Vec<i64> = {
                let t = state.table(table)?;
                t.rows
                    .iter()
                    .filter_map(|r| t.key_of(r))
                    .filter(|k| keys.contains(k))
                    .collect()
            };
            for old in &present {
                let new = old.checked_add(offset).ok_or_else(|| {
                    SanitizerError::Query("bigint out of range".into())
                })?;
                state.set_key(table, *old, new, log)?;
            }
            Ok(present.len() as u64)
        })
    }

    async fn assign_keys(
        &self,
        table: &str,
        key: &str,
        pairs: &[(i64, i64)],
        offset: i64,
    ) -> Result<u64> {
        self.write("assign_keys", table, |state, _, log| {
            state.require_column(table, key)?;
            let mut changed = 0;
            for (old, new) in pairs {
                let shifted = old + offset;
                if state.table(table)?.position(shifted).is_some() {
                    state.set_key(table, shifted, *new, log)?;
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    async fn delete_keys(&self, table: &str, key: &str, keys: &[i64]) -> Result<u64> {
        self.write("delete_keys", table, |state, _, log| {
            let values: Vec<Value> = keys.iter().map(|k| Value::Int(*k)).collect();
            state.delete_matching(table, key, &values, log, 0)
        })
    }

    async fn repoint(
        &self,
        table: &str,
        column: &str,
        pairs: &[(i64, i64)],
        discriminator: Option<(&str, &str)>,
    ) -> Result<u64> {
        self.write("repoint", table, |state, _, log| {
            state.require_column(table, column)?;
            if let Some((disc, _)) = discriminator {
                state.require_column(table, disc)?;
            }
            let map: HashMap<i64, i64> = pairs.iter().copied().collect();
            let mut written = Vec::new();
            let t = state.table_mut(table)?;
            let fires = t.fires();
            for i in 0..t.rows.len() {
                let row = &t.rows[i];
                if let Some((disc, value)) = discriminator {
                    if row.get(disc).and_then(Value::as_text).as_deref() != Some(value) {
                        continue;
                    }
                }
                let Some(new) = row.get(column).and_then(Value::as_int).and_then(|v| map.get(&v))
                else {
                    continue;
                };
                let new = Value::Int(*new);
                t.rows[i].insert(column.to_string(), new.clone());
                if fires {
                    log.push(TriggerFire {
                        table: table.to_string(),
                        key: t.key_of(&t.rows[i]),
                    });
                }
                written.push(new);
            }
            for v in &written {
                state.check_reference(table, column, v)?;
            }
            Ok(written.len() as u64)
        })
    }

    async fn repoint_text(
        &self,
        table: &str,
        column: &str,
        prefix: &str,
        pairs: &[(i64, i64)],
    ) -> Result<u64> {
        self.write("repoint_text", table, |state, _, _| {
            state.require_column(table, column)?;
            let map: HashMap<String, String> = pairs
                .iter()
                .map(|(o, n)| (format!("{prefix}{o}"), format!("{prefix}{n}")))
                .collect();
            let t = state.table_mut(table)?;
            let mut changed = 0;
            for row in t.rows.iter_mut() {
                let Some(Value::Text(current)) = row.get(column) else {
                    continue;
                };
                if let Some(new) = map.get(current) {
                    row.insert(column.to_string(), Value::Text(new.clone()));
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    async fn select_fields(
        &self,
        table: &str,
        key: &str,
        fields: &[String],
        filter: Option<&str>,
    ) -> Result<Vec<FieldRow>> {
        self.read("select_fields", table, |s| {
            s.state.require_column(table, key)?;
            for f in fields {
                s.state.require_column(table, f)?;
            }
            let pred = Self::predicate(s, filter)?;
            let t = s.state.table(table)?;
            let mut out: Vec<FieldRow> = t
                .rows
                .iter()
                .filter(|r| row_matches(&pred, r))
                .filter_map(|r| {
                    let k = t.key_of(r)?;
                    let values = fields
                        .iter()
                        .map(|f| r.get(f).and_then(Value::as_text))
                        .collect();
                    Some((k, values))
                })
                .collect();
            out.sort_by_key(|(k, _)| *k);
            Ok(out)
        })
    }

    async fn external_ids(&self, registry: &str, model: &str) -> Result<Vec<ExternalIdRecord>> {
        self.read("external_ids", registry, |s| {
            let t = s.state.table(registry)?;
            let mut out: Vec<ExternalIdRecord> = t
                .rows
                .iter()
                .filter(|r| r.get("model").and_then(Value::as_text).as_deref() == Some(model))
                .filter_map(|r| {
                    Some(ExternalIdRecord {
                        id: t.key_of(r),
                        res_id: r.get("res_id")?.as_int()?,
                        module: r.get("module")?.as_text()?,
                        name: r.get("name")?.as_text()?,
                    })
                })
                .collect();
            out.sort_by_key(|r| (r.res_id, r.id));
            Ok(out)
        })
    }

    async fn update_external_ids(
        &self,
        registry: &str,
        model: &str,
        records: &[ExternalIdRecord],
    ) -> Result<u64> {
        self.write("update_external_ids", registry, |state, _, _| {
            let t = state.table_mut(registry)?;
            let key = t.key.clone();
            let mut changed = 0;
            for row in t.rows.iter_mut() {
                if row.get("model").and_then(Value::as_text).as_deref() != Some(model) {
                    continue;
                }
                let Some(id) = row.get(&key).and_then(Value::as_int) else {
                    continue;
                };
                if let Some(rec) = records.iter().find(|r| r.id == Some(id)) {
                    row.insert("module".into(), Value::Text(rec.module.clone()));
                    row.insert("name".into(), Value::Text(rec.name.clone()));
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    async fn insert_external_ids(
        &self,
        registry: &str,
        model: &str,
        records: &[ExternalIdRecord],
    ) -> Result<u64> {
        self.write("insert_external_ids", registry, |state, _, _| {
            let t = state.table_mut(registry)?;
            let mut next = t.rows.iter().filter_map(|r| t.key_of(r)).max().unwrap_or(0) + 1;
            let key = t.key.clone();
            for rec in records {
                let mut row = Row::new();
                for col in &t.columns {
                    row.insert(col.clone(), Value::Null);
                }
                row.insert(key.clone(), Value::Int(next));
                row.insert("module".into(), Value::Text(rec.module.clone()));
                row.insert("name".into(), Value::Text(rec.name.clone()));
                row.insert("model".into(), Value::Text(model.to_string()));
                row.insert("res_id".into(), Value::Int(rec.res_id));
                t.rows.push(row);
                next += 1;
            }
            Ok(records.len() as u64)
        })
    }

    async fn sync_sequence(&self, table: &str, key: &str) -> Result<Option<i64>> {
        let mut shared = self.enter("sync_sequence", table)?;
        let t = shared.state.table(table)?;
        if !t.has_sequence {
            return Ok(None);
        }
        let max = t.rows.iter().filter_map(|r| r.get(key)?.as_int()).max();
        let next = max.unwrap_or(0) + 1;
        // Sequences live outside the transaction, like setval().
        shared.sequences.insert(table.to_string(), next);
        Ok(Some(next))
    }

    async fn rebuild_parent_path(
        &self,
        table: &str,
        key: &str,
        parent_column: &str,
        path_column: &str,
    ) -> Result<u64> {
        self.write("rebuild_parent_path", table, |state, _, _| {
            state.require_column(table, key)?;
            state.require_column(table, parent_column)?;
            state.require_column(table, path_column)?;
            let t = state.table_mut(table)?;
            let parents: HashMap<i64, Option<i64>> = t
                .rows
                .iter()
                .filter_map(|r| {
                    Some((
                        r.get(key)?.as_int()?,
                        r.get(parent_column).and_then(Value::as_int),
                    ))
                })
                .collect();
            let mut changed = 0;
            for row in t.rows.iter_mut() {
                let Some(mut node) = row.get(key).and_then(Value::as_int) else {
                    continue;
                };
                let mut chain = vec![node];
                let mut rooted = false;
                while chain.len() <= parents.len() {
                    match parents.get(&node) {
                        Some(Some(parent)) => {
                            node = *parent;
                            chain.push(node);
                        }
                        Some(None) => {
                            rooted = true;
                            break;
                        }
                        None => break,
                    }
                }
                if !rooted {
                    continue;
                }
                let path: String = chain.iter().rev().map(|k| format!("{k}/")).collect();
                let new = Value::Text(path);
                if row.get(path_column) != Some(&new) {
                    row.insert(path_column.to_string(), new);
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let target = self
            .lock()
            .statements
            .get(sql)
            .map(|(t, _)| t.clone())
            .unwrap_or_default();
        self.write("execute", &target, |state, shared, _| {
            let Some((table, statement)) = shared.statements.get(sql) else {
                return Err(SanitizerError::Query(format!("syntax error in {sql:?}")));
            };
            let t = state.table_mut(table)?;
            let mut changed = 0;
            for row in t.rows.iter_mut() {
                if statement(row) {
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }
}

#[async_trait]
impl Connector for MemoryDatabase {
    async fn connect(&self) -> Result<Arc<dyn Database>> {
        if !self.lock().connected {
            return Err(SanitizerError::Connectivity("connection refused".into()));
        }
        Ok(Arc::new(Self {
            detached: true,
            ..self.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent_child() -> MemoryDatabase {
        let db = MemoryDatabase::default();
        db.create_table("t", "id", &["name"]);
        db.create_table("d", "id", &["t_id"]);
        for k in [1, 2, 3] {
            db.insert_row("t", k, &[]).unwrap();
        }
        db
    }

    fn rule(on_update: FkAction, on_delete: FkAction) -> ForeignKeyRule {
        ForeignKeyRule {
            referencing_table: "d".into(),
            referencing_column: "t_id".into(),
            referenced_table: "t".into(),
            referenced_column: "id".into(),
            on_update,
            on_delete,
            discovered: false,
        }
    }

    #[tokio::test]
    async fn test_key_collision_is_rejected_row_by_row() {
        let db = parent_child();
        let err = db.shift_keys("t", "id", &[1, 2], 1).await.unwrap_err();
        assert!(matches!(err, SanitizerError::ConstraintViolation { .. }));
        // Statement atomicity: nothing moved.
        assert_eq!(db.keys("t"), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cascade_update_follows_key() {
        let db = parent_child();
        db.add_constraint("d_t_id_fkey", rule(FkAction::Cascade, FkAction::Restrict))
            .unwrap();
        db.insert_row("d", 10, &[("t_id", 2.into())]).unwrap();
        db.shift_keys("t", "id", &[2], 100).await.unwrap();
        assert_eq!(db.value("d", 10, "t_id"), Some(Value::Int(102)));
    }

    #[tokio::test]
    async fn test_no_action_blocks_key_update() {
        let db = parent_child();
        db.add_constraint("d_t_id_fkey", rule(FkAction::NoAction, FkAction::NoAction))
            .unwrap();
        db.insert_row("d", 10, &[("t_id", 2.into())]).unwrap();
        let err = db.shift_keys("t", "id", &[2], 100).await.unwrap_err();
        assert!(matches!(err, SanitizerError::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn test_delete_set_null() {
        let db = parent_child();
        db.add_constraint("d_t_id_fkey", rule(FkAction::Cascade, FkAction::SetNull))
            .unwrap();
        db.insert_row("d", 10, &[("t_id", 2.into())]).unwrap();
        assert_eq!(db.delete_keys("t", "id", &[2]).await.unwrap(), 1);
        assert_eq!(db.value("d", 10, "t_id"), Some(Value::Null));
    }

    #[tokio::test]
    async fn test_rollback_restores_rows_but_not_sequences() {
        let db = parent_child();
        assert_eq!(db.sync_sequence("t", "id").await.unwrap(), Some(4));
        db.begin().await.unwrap();
        db.delete_keys("t", "id", &[1, 2, 3]).await.unwrap();
        db.sync_sequence("t", "id").await.unwrap();
        db.rollback().await.unwrap();
        assert_eq!(db.keys("t"), vec![1, 2, 3]);
        assert_eq!(db.peek_sequence("t"), Some(1));
    }

    #[tokio::test]
    async fn test_failed_statement_aborts_transaction() {
        let db = parent_child();
        db.begin().await.unwrap();
        assert!(db.shift_keys("t", "id", &[1], 1).await.is_err());
        let err = db.row_count("t").await.unwrap_err();
        assert!(matches!(err, SanitizerError::Query(_)));
        db.rollback().await.unwrap();
        assert_eq!(db.row_count("t").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_savepoint_recovers_aborted_transaction() {
        let db = parent_child();
        db.begin().await.unwrap();
        db.delete_keys("t", "id", &[3]).await.unwrap();
        db.savepoint("patch").await.unwrap();
        assert!(db.shift_keys("t", "id", &[1], 1).await.is_err());
        db.rollback_to_savepoint("patch").await.unwrap();
        db.release_savepoint("patch").await.unwrap();
        db.commit().await.unwrap();
        assert_eq!(db.keys("t"), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_detached_write_survives_other_rollback() {
        let db = parent_child();
        db.create_table("c", "id", &["parent_id", "parent_path"]);
        db.insert_row("c", 1, &[]).unwrap();
        let worker = db.connect().await.unwrap();
        db.begin().await.unwrap();
        db.delete_keys("t", "id", &[3]).await.unwrap();
        worker
            .rebuild_parent_path("c", "id", "parent_id", "parent_path")
            .await
            .unwrap();
        db.rollback().await.unwrap();
        assert_eq!(db.keys("t"), vec![1, 2, 3]);
        assert_eq!(db.value("c", 1, "parent_path"), Some(Value::from("1/")));
    }

    #[tokio::test]
    async fn test_injected_fault_and_disconnect() {
        let db = parent_child();
        db.fail_on("max_key", "t", SanitizerError::Timeout("slow".into()));
        assert!(matches!(
            db.max_key("t", "id").await,
            Err(SanitizerError::Timeout(_))
        ));
        db.disconnect();
        assert!(matches!(
            db.table_exists("t").await,
            Err(SanitizerError::Connectivity(_))
        ));
    }

    #[tokio::test]
    async fn test_unregistered_predicate_is_query_error() {
        let db = parent_child();
        let err = db.delete_where("t", "name = 'x'").await.unwrap_err();
        assert!(matches!(err, SanitizerError::Query(_)));
    }

    #[tokio::test]
    async fn test_parent_path_rebuild() {
        let db = MemoryDatabase::default();
        db.create_table("c", "id", &["parent_id", "parent_path"]);
        db.insert_row("c", 1, &[]).unwrap();
        db.insert_row("c", 5, &[("parent_id", 1.into())]).unwrap();
        db.insert_row("c", 9, &[("parent_id", 5.into())]).unwrap();
        let changed = db
            .rebuild_parent_path("c", "id", "parent_id", "parent_path")
            .await
            .unwrap();
        assert_eq!(changed, 3);
        assert_eq!(db.value("c", 9, "parent_path"), Some(Value::from("1/5/9/")));
    }
}
