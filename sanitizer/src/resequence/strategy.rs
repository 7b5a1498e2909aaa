use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::mapping::IdMapping;
use crate::db::Database;
use crate::error::{Result, SanitizerError};
use crate::plan::ResequenceSpec;

/// What a strategy gets to look at.
pub struct StrategyContext<'a> {
    pub db: &'a dyn Database,
    pub table: &'a str,
    pub key: &'a str,
}

/// A named, pluggable mapping producer. Its mapping goes through the same
/// validation and offset-shift apply as the built-in strategies.
#[async_trait]
pub trait CustomStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Checks that need the catalog but write nothing. Runs before `BEGIN`.
    async fn validate(
        &self,
        _ctx: &StrategyContext<'_>,
        _params: &serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }

    async fn mapping(
        &self,
        ctx: &StrategyContext<'_>,
        params: &serde_json::Value,
    ) -> Result<IdMapping>;
}

// ---------- registry ----------

#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn CustomStrategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(KeyFromColumn));
        registry
    }

    /// Later registrations replace earlier ones with the same name.
    pub fn register(&mut self, strategy: Arc<dyn CustomStrategy>) {
        self.strategies
            .insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn CustomStrategy>> {
        self.strategies.get(name).cloned().ok_or_else(|| {
            SanitizerError::validation(format!("unknown custom strategy '{name}'"))
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}

// ---------- built-in strategies ----------

/// Pre-write checks for a strategy: referenced columns exist and custom
/// strategies are registered.
pub async fn validate_spec(
    ctx: &StrategyContext<'_>,
    spec: &ResequenceSpec,
    registry: &StrategyRegistry,
) -> Result<()> {
    match spec {
        ResequenceSpec::Consolidation { .. } => Ok(()),
        ResequenceSpec::Sequential { order_by, .. } => {
            for order in order_by {
                if !ctx.db.column_exists(ctx.table, &order.column).await? {
                    return Err(SanitizerError::validation(format!(
                        "{}: ordering column '{}' does not exist",
                        ctx.table, order.column
                    )));
                }
            }
            Ok(())
        }
        ResequenceSpec::Custom { name, params } => {
            registry.get(name)?.validate(ctx, params).await
        }
    }
}

/// Build the raw mapping for `spec`. Nothing is written.
pub async fn compute_mapping(
    ctx: &StrategyContext<'_>,
    spec: &ResequenceSpec,
    registry: &StrategyRegistry,
) -> Result<IdMapping> {
    match spec {
        ResequenceSpec::Consolidation { pairs } => Ok(IdMapping::from_pairs(pairs.clone())),
        ResequenceSpec::Sequential {
            start,
            order_by,
            filter,
        } => {
            let keys = ctx
                .db
                .select_keys(ctx.table, ctx.key, filter.as_deref(), order_by)
                .await?;
            sequential(ctx.table, &keys, *start)
        }
        ResequenceSpec::Custom { name, params } => {
            registry.get(name)?.mapping(ctx, params).await
        }
    }
}

/// `keys[i] -> start + i`.
pub fn sequential(table: &str, keys: &[i64], start: i64) -> Result<IdMapping> {
    let mut pairs = Vec::with_capacity(keys.len());
    for (i, old) in keys.iter().enumerate() {
        let new = i64::try_from(i)
            .ok()
            .and_then(|i| start.checked_add(i))
            .ok_or_else(|| {
                SanitizerError::validation(format!(
                    "{table}: sequential keys overflow from {start}"
                ))
            })?;
        pairs.push((*old, new));
    }
    Ok(IdMapping::from_pairs(pairs))
}

#[derive(Debug, Deserialize)]
struct KeyFromColumnParams {
    column: String,
    #[serde(default)]
    filter: Option<String>,
}

/// `key_from_column`: each row's key becomes the integer value of another
/// column on the same row (rows where it is NULL keep their key).
pub struct KeyFromColumn;

impl KeyFromColumn {
    fn params(value: &serde_json::Value) -> Result<KeyFromColumnParams> {
        serde_json::from_value(value.clone()).map_err(|e| {
            SanitizerError::validation(format!("key_from_column: invalid params: {e}"))
        })
    }
}

#[async_trait]
impl CustomStrategy for KeyFromColumn {
    fn name(&self) -> &str {
        "key_from_column"
    }

    async fn validate(&self, ctx: &StrategyContext<'_>, params: &serde_json::Value) -> Result<()> {
        let params = Self::params(params)?;
        if !ctx.db.column_exists(ctx.table, &params.column).await? {
            return Err(SanitizerError::validation(format!(
                "{}: key_from_column source '{}' does not exist",
                ctx.table, params.column
            )));
        }
        Ok(())
    }

    async fn mapping(
        &self,
        ctx: &StrategyContext<'_>,
        params: &serde_json::Value,
    ) -> Result<IdMapping> {
        let params = Self::params(params)?;
        let pairs = ctx
            .db
            .select_key_pairs(ctx.table, ctx.key, &params.column, params.filter.as_deref())
            .await?;
        Ok(IdMapping::from_pairs(pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryDatabase, Value};
    use crate::plan::OrderKey;

    fn setup() -> MemoryDatabase {
        let db = MemoryDatabase::default();
        db.create_table("t", "id", &["name", "partner_id"]);
        db.insert_row("t", 5, &[("name", "c".into()), ("partner_id", 50.into())])
            .unwrap();
        db.insert_row("t", 8, &[("name", "a".into())]).unwrap();
        db.insert_row("t", 12, &[("name", "b".into()), ("partner_id", 120.into())])
            .unwrap();
        db
    }

    fn ctx(db: &MemoryDatabase) -> StrategyContext<'_> {
        StrategyContext {
            db,
            table: "t",
            key: "id",
        }
    }

    #[tokio::test]
    async fn test_sequential_by_key() {
        let db = setup();
        let spec = ResequenceSpec::Sequential {
            start: 1,
            order_by: vec![],
            filter: None,
        };
        let mapping = compute_mapping(&ctx(&db), &spec, &StrategyRegistry::default())
            .await
            .unwrap();
        assert_eq!(mapping.pairs(), &[(5, 1), (8, 2), (12, 3)]);
    }

    #[tokio::test]
    async fn test_sequential_respects_order() {
        let db = setup();
        let spec = ResequenceSpec::Sequential {
            start: 100,
            order_by: vec![OrderKey::asc("name")],
            filter: None,
        };
        let mapping = compute_mapping(&ctx(&db), &spec, &StrategyRegistry::default())
            .await
            .unwrap();
        assert_eq!(mapping.pairs(), &[(8, 100), (12, 101), (5, 102)]);
    }

    #[tokio::test]
    async fn test_missing_order_column_is_validation_error() {
        let db = setup();
        let spec = ResequenceSpec::Sequential {
            start: 1,
            order_by: vec![OrderKey::desc("ghost")],
            filter: None,
        };
        let err = validate_spec(&ctx(&db), &spec, &StrategyRegistry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SanitizerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_custom_is_validation_error() {
        let db = setup();
        let spec = ResequenceSpec::Custom {
            name: "nope".into(),
            params: serde_json::Value::Null,
        };
        let err = validate_spec(&ctx(&db), &spec, &StrategyRegistry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SanitizerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_key_from_column_skips_nulls() {
        let db = setup();
        let spec = ResequenceSpec::Custom {
            name: "key_from_column".into(),
            params: serde_json::json!({"column": "partner_id"}),
        };
        let registry = StrategyRegistry::default();
        validate_spec(&ctx(&db), &spec, &registry).await.unwrap();
        let mapping = compute_mapping(&ctx(&db), &spec, &registry).await.unwrap();
        assert_eq!(mapping.pairs(), &[(5, 50), (12, 120)]);
        assert_eq!(db.value("t", 8, "partner_id"), Some(Value::Null));
    }

    #[test]
    fn test_sequential_overflow() {
        assert!(sequential("t", &[1, 2], i64::MAX).is_err());
        assert_eq!(sequential("t", &[], 1).unwrap(), IdMapping::new());
    }
}
