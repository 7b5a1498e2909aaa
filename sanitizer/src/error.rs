use std::fmt;

use serde::Serialize;

/// Error taxonomy for a sanitizer run.
///
/// Only `Connectivity` is fatal to the whole run; every other variant is
/// attached to the table (and phase) that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanitizerError {
    /// The database cannot be reached or the connection was lost.
    Connectivity(String),
    /// A table, column or constraint is missing or incompatible.
    Schema { object: String, reason: String },
    /// A uniqueness or foreign-key violation surfaced during a write.
    ConstraintViolation { constraint: String, reason: String },
    /// Invalid descriptor or strategy, detected before any write.
    Validation(String),
    /// Statement timeout or cancelled query.
    Timeout(String),
    /// Any other database failure.
    Query(String),
}

pub type Result<T> = std::result::Result<T, SanitizerError>;

impl SanitizerError {
    pub fn schema(object: impl Into<String>, reason: impl Into<String>) -> Self {
        SanitizerError::Schema {
            object: object.into(),
            reason: reason.into(),
        }
    }

    pub fn constraint(constraint: impl Into<String>, reason: impl Into<String>) -> Self {
        SanitizerError::ConstraintViolation {
            constraint: constraint.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        SanitizerError::Validation(msg.into())
    }

    /// Short machine-readable tag, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SanitizerError::Connectivity(_) => "connectivity",
            SanitizerError::Schema { .. } => "schema",
            SanitizerError::ConstraintViolation { .. } => "constraint_violation",
            SanitizerError::Validation(_) => "validation",
            SanitizerError::Timeout(_) => "timeout",
            SanitizerError::Query(_) => "query",
        }
    }

    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, SanitizerError::Connectivity(_))
    }
}

impl fmt::Display for SanitizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanitizerError::Connectivity(msg) => write!(f, "Connectivity error: {msg}"),
            SanitizerError::Schema { object, reason } => {
                write!(f, "Schema error on {object}: {reason}")
            }
            SanitizerError::ConstraintViolation { constraint, reason } => {
                write!(f, "Constraint violation ({constraint}): {reason}")
            }
            SanitizerError::Validation(msg) => write!(f, "Validation error: {msg}"),
            SanitizerError::Timeout(msg) => write!(f, "Timeout: {msg}"),
            SanitizerError::Query(msg) => write!(f, "Query error: {msg}"),
        }
    }
}

impl std::error::Error for SanitizerError {}

impl From<tokio_postgres::Error> for SanitizerError {
    fn from(e: tokio_postgres::Error) -> Self {
        let Some(db) = e.as_db_error() else {
            let io = std::error::Error::source(&e).is_some_and(|s| s.is::<std::io::Error>());
            return classify_uncoded(e.is_closed(), io, e.to_string());
        };
        let code = db.code().code();
        let message = db.message().to_string();
        let object = db
            .constraint()
            .or(db.column())
            .or(db.table())
            .unwrap_or("unknown")
            .to_string();
        classify_sqlstate(code, object, message)
    }
}

/// Map a client-side failure (no SQLSTATE) onto the taxonomy. Only a closed
/// connection or a socket error means the server is out of reach.
pub fn classify_uncoded(closed: bool, io: bool, message: String) -> SanitizerError {
    if closed || io {
        SanitizerError::Connectivity(message)
    } else {
        SanitizerError::Query(message)
    }
}

/// Map a SQLSTATE code onto the taxonomy.
pub fn classify_sqlstate(code: &str, object: String, message: String) -> SanitizerError {
    match code {
        "23505" | "23503" | "23502" | "23514" => SanitizerError::ConstraintViolation {
            constraint: object,
            reason: message,
        },
        "42P01" | "42703" | "42704" | "42804" | "42830" | "42P16" | "42710" => {
            SanitizerError::Schema {
                object,
                reason: message,
            }
        }
        "57014" => SanitizerError::Timeout(message),
        c if c.starts_with("08") || c.starts_with("57P") => SanitizerError::Connectivity(message),
        _ => SanitizerError::Query(message),
    }
}

/// A failure attached to the phase that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseFailure {
    pub phase: String,
    pub kind: String,
    pub message: String,
}

impl PhaseFailure {
    pub fn new(phase: &str, error: &SanitizerError) -> Self {
        Self {
            phase: phase.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.phase, self.message)
    }
}
