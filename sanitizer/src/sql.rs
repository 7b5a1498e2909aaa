use crate::error::{Result, SanitizerError};

/// Quote an identifier for PostgreSQL. Always quoted, so reserved words
/// such as `order` or `user` are safe as table names.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `schema.table`, both parts quoted.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Reject names that could never be valid identifiers (empty or containing NUL).
pub fn check_ident(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(SanitizerError::validation(format!(
            "invalid identifier: {name:?}"
        )));
    }
    Ok(())
}

/// ` AND (<predicate>)` or nothing.
pub fn and_filter(filter: Option<&str>) -> String {
    match filter {
        Some(f) if !f.trim().is_empty() => format!(" AND ({f})"),
        _ => String::new(),
    }
}
