//! External-identifier rebuilding.
//!
//! Every eligible row gets a stable name rendered from a pattern such as
//! `partner_{id}` or `country_{code}`. Registry records are updated in place
//! when they exist and inserted otherwise; target rows are never touched.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::db::{Database, ExternalIdRecord};
use crate::error::{Result, SanitizerError};
use crate::plan::ExternalIdSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Key,
    Field(usize),
}

/// A parsed naming pattern. `{id}` is the row key, any other `{column}` a
/// field of the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    segments: Vec<Segment>,
    fields: Vec<String>,
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
        let placeholder = PLACEHOLDER.get_or_init(|| {
            Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex")
        });

        let mut segments = Vec::new();
        let mut fields: Vec<String> = Vec::new();
        let mut last = 0;
        for caps in placeholder.captures_iter(pattern) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(pattern[last..whole.start()].to_string()));
            }
            if name.as_str() == "id" {
                segments.push(Segment::Key);
            } else {
                let idx = match fields.iter().position(|f| f == name.as_str()) {
                    Some(idx) => idx,
                    None => {
                        fields.push(name.as_str().to_string());
                        fields.len() - 1
                    }
                };
                segments.push(Segment::Field(idx));
            }
            last = whole.end();
        }
        if last < pattern.len() {
            segments.push(Segment::Literal(pattern[last..].to_string()));
        }
        if pattern.contains('{') && segments.iter().all(|s| matches!(s, Segment::Literal(_))) {
            return Err(SanitizerError::validation(format!(
                "external id pattern '{pattern}' has a malformed placeholder"
            )));
        }
        if segments.is_empty() {
            return Err(SanitizerError::validation("external id pattern is empty"));
        }
        Ok(Self { segments, fields })
    }

    /// Columns the pattern reads, in placeholder order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Render and normalise. NULL fields render as empty text.
    pub fn render(&self, key: i64, values: &[Option<String>]) -> String {
        let mut raw = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => raw.push_str(s),
                Segment::Key => raw.push_str(&key.to_string()),
                Segment::Field(idx) => {
                    if let Some(Some(v)) = values.get(*idx) {
                        raw.push_str(v);
                    }
                }
            }
        }
        normalize_name(&raw)
    }
}

/// Lowercase; runs of characters outside `[a-z0-9_.]` become one `_`.
pub fn normalize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.' {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "record".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XmlIdOutcome {
    pub updated: u64,
    pub inserted: u64,
    pub unchanged: u64,
}

/// Pre-write checks: pattern parses, registry and pattern fields exist.
pub async fn validate(db: &dyn Database, table: &str, spec: &ExternalIdSpec) -> Result<()> {
    let pattern = NamePattern::parse(&spec.pattern)?;
    if !db.table_exists(&spec.registry).await? {
        return Err(SanitizerError::schema(
            &spec.registry,
            "external id registry does not exist",
        ));
    }
    for field in pattern.fields() {
        if !db.column_exists(table, field).await? {
            return Err(SanitizerError::validation(format!(
                "{table}: external id field '{field}' does not exist"
            )));
        }
    }
    Ok(())
}

/// The `xmlid_rebuild` phase for one table. Keys must already be final.
pub async fn rebuild(
    db: &dyn Database,
    table: &str,
    key: &str,
    spec: &ExternalIdSpec,
) -> Result<XmlIdOutcome> {
    let pattern = NamePattern::parse(&spec.pattern)?;
    let rows = db
        .select_fields(table, key, pattern.fields(), spec.filter.as_deref())
        .await?;
    let existing = db.external_ids(&spec.registry, &spec.model).await?;

    let eligible: HashSet<i64> = rows.iter().map(|(k, _)| *k).collect();
    // One record per row is rebuilt, preferably one already in the target
    // module. Any further external ids of the row are left as they are.
    let mut chosen: HashMap<i64, &ExternalIdRecord> = HashMap::new();
    for record in existing.iter().filter(|r| eligible.contains(&r.res_id)) {
        chosen
            .entry(record.res_id)
            .and_modify(|current| {
                if current.module != spec.module && record.module == spec.module {
                    *current = record;
                }
            })
            .or_insert(record);
    }
    // Names held by records this run does not rebuild stay reserved.
    let mut taken: HashSet<String> = existing
        .iter()
        .filter(|r| r.module == spec.module)
        .filter(|r| chosen.get(&r.res_id).is_none_or(|c| c.id != r.id))
        .map(|r| r.name.clone())
        .collect();

    let mut updates = Vec::new();
    let mut inserts = Vec::new();
    let mut outcome = XmlIdOutcome::default();
    for (res_id, values) in &rows {
        let mut name = pattern.render(*res_id, values);
        if taken.contains(&name) {
            name = format!("{name}_{res_id}");
        }
        taken.insert(name.clone());
        let current = chosen.get(res_id);
        let record = ExternalIdRecord {
            id: current.and_then(|c| c.id),
            res_id: *res_id,
            module: spec.module.clone(),
            name,
        };
        match current {
            Some(c) if c.module == record.module && c.name == record.name => {
                outcome.unchanged += 1;
            }
            Some(_) => updates.push(record),
            None => inserts.push(record),
        }
    }

    if !updates.is_empty() {
        outcome.updated = db
            .update_external_ids(&spec.registry, &spec.model, &updates)
            .await?;
    }
    if !inserts.is_empty() {
        outcome.inserted = db
            .insert_external_ids(&spec.registry, &spec.model, &inserts)
            .await?;
    }
    tracing::debug!(
        table = %table,
        model = %spec.model,
        updated = outcome.updated,
        inserted = outcome.inserted,
        unchanged = outcome.unchanged,
        "External ids rebuilt"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryDatabase, Value};

    fn spec(pattern: &str) -> ExternalIdSpec {
        ExternalIdSpec {
            registry: "ir_model_data".into(),
            module: "base".into(),
            model: "res.country".into(),
            pattern: pattern.into(),
            filter: None,
        }
    }

    fn setup() -> MemoryDatabase {
        let db = MemoryDatabase::default();
        db.create_table("ir_model_data", "id", &["module", "name", "model", "res_id"]);
        db.create_table("res_country", "id", &["code"]);
        db.insert_row("res_country", 1, &[("code", "BE".into())]).unwrap();
        db.insert_row("res_country", 2, &[("code", "FR".into())]).unwrap();
        db.insert_row("res_country", 3, &[("code", "be".into())]).unwrap();
        db
    }

    #[test]
    fn test_pattern_parsing() {
        let p = NamePattern::parse("country_{code}_{id}").unwrap();
        assert_eq!(p.fields(), &["code".to_string()]);
        assert_eq!(p.render(7, &[Some("BE".into())]), "country_be_7");
    }

    #[test]
    fn test_malformed_placeholder() {
        assert!(NamePattern::parse("country_{code").is_err());
        assert!(NamePattern::parse("").is_err());
        assert!(NamePattern::parse("literal").is_ok());
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Res Partner--42"), "res_partner_42");
        assert_eq!(normalize_name("a.b_c"), "a.b_c");
        assert_eq!(normalize_name("***"), "record");
    }

    #[tokio::test]
    async fn test_inserts_then_updates() {
        let db = setup();
        db.insert(
            "ir_model_data",
            &[
                ("id", 1.into()),
                ("module", "base".into()),
                ("name", "stale".into()),
                ("model", "res.country".into()),
                ("res_id", 2.into()),
            ],
        )
        .unwrap();
        let outcome = rebuild(&db, "res_country", "id", &spec("country_{code}"))
            .await
            .unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.inserted, 2);
        let names: Vec<Value> = db
            .column("ir_model_data", "name")
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(
            names,
            vec![
                Value::from("country_fr"),
                Value::from("country_be"),
                Value::from("country_be_3"),
            ]
        );
    }

    fn register(db: &MemoryDatabase, id: i64, module: &str, name: &str, res_id: i64) {
        db.insert(
            "ir_model_data",
            &[
                ("id", id.into()),
                ("module", module.into()),
                ("name", name.into()),
                ("model", "res.country".into()),
                ("res_id", res_id.into()),
            ],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_extra_external_ids_of_a_row_are_kept() {
        let db = setup();
        register(&db, 1, "__export__", "res_country_1", 1);
        register(&db, 2, "base", "main_country", 1);
        register(&db, 3, "base", "legacy_country", 1);

        let outcome = rebuild(&db, "res_country", "id", &spec("country_{code}"))
            .await
            .unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.inserted, 2);

        let registry: Vec<(Value, Value)> = db
            .column("ir_model_data", "module")
            .into_iter()
            .zip(db.column("ir_model_data", "name"))
            .map(|((_, m), (_, n))| (m, n))
            .take(3)
            .collect();
        assert_eq!(
            registry,
            vec![
                (Value::from("__export__"), Value::from("res_country_1")),
                (Value::from("base"), Value::from("country_be")),
                (Value::from("base"), Value::from("legacy_country")),
            ]
        );
    }

    #[tokio::test]
    async fn test_rebuild_is_stable() {
        let db = setup();
        let s = spec("country_{code}");
        rebuild(&db, "res_country", "id", &s).await.unwrap();
        let again = rebuild(&db, "res_country", "id", &s).await.unwrap();
        assert_eq!(again.unchanged, 3);
        assert_eq!(again.updated + again.inserted, 0);
    }

    #[tokio::test]
    async fn test_missing_field_is_validation_error() {
        let db = setup();
        let err = validate(&db, "res_country", &spec("country_{iso}"))
            .await
            .unwrap_err();
        assert!(matches!(err, SanitizerError::Validation(_)));
    }
}
