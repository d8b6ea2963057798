//! Error types for the ORM session.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=db, 3=not_found, 4=validation, 5=relationship, etc.)
//! - Retryability flags
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use thiserror::Error;

/// Result type alias for ORM operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
///
/// Each code maps to a SCREAMING_SNAKE string and a category-based
/// exit code. Callers match on the string; shell scripts on the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    DatabaseError,
    SchemaError,
    ConstraintViolation,

    // Not Found (exit 3)
    NotFound,
    UnknownTable,
    UnknownColumn,

    // Validation (exit 4)
    AlreadyAttached,
    NotTracked,
    DetachedEntity,
    InvalidArgument,

    // Relationship (exit 5)
    UnattachedReference,
    CyclicRelationship,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::DatabaseError => "DATABASE_ERROR",
            Self::SchemaError => "SCHEMA_ERROR",
            Self::ConstraintViolation => "CONSTRAINT_VIOLATION",
            Self::NotFound => "NOT_FOUND",
            Self::UnknownTable => "UNKNOWN_TABLE",
            Self::UnknownColumn => "UNKNOWN_COLUMN",
            Self::AlreadyAttached => "ALREADY_ATTACHED",
            Self::NotTracked => "NOT_TRACKED",
            Self::DetachedEntity => "DETACHED_ENTITY",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::UnattachedReference => "UNATTACHED_REFERENCE",
            Self::CyclicRelationship => "CYCLIC_RELATIONSHIP",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::DatabaseError | Self::SchemaError | Self::ConstraintViolation => 2,
            Self::NotFound | Self::UnknownTable | Self::UnknownColumn => 3,
            Self::AlreadyAttached
            | Self::NotTracked
            | Self::DetachedEntity
            | Self::InvalidArgument => 4,
            Self::UnattachedReference | Self::CyclicRelationship => 5,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether the same call may succeed after the caller corrects its input
    /// or the backend state.
    ///
    /// Session invariant violations are programmer errors and never retryable.
    /// Backend-reported failures leave the session's tracked sets unchanged,
    /// so a corrected flush can be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConstraintViolation | Self::NotFound | Self::DatabaseError
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in session, mapping and storage operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Entity already attached: {entity}")]
    AlreadyAttached { entity: String },

    #[error("Entity is not tracked by this session: {entity}")]
    NotTracked { entity: String },

    #[error("Entity was detached and cannot be attached again: {entity}")]
    DetachedEntity { entity: String },

    #[error("{entity} references {related} through '{relationship}', but it is not attached")]
    UnattachedReference {
        entity: String,
        relationship: String,
        related: String,
    },

    #[error("Cyclic relationship between pending entities: {}", cycle.join(" -> "))]
    CyclicRelationship { cycle: Vec<String> },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Row not found: {table} id={id}")]
    NotFound { table: String, id: i64 },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Unknown table: {table}")]
    UnknownTable { table: String, similar: Vec<String> },

    #[error("Unknown column: {table}.{column}")]
    UnknownColumn {
        table: String,
        column: String,
        similar: Vec<String>,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::AlreadyAttached { .. } => ErrorCode::AlreadyAttached,
            Self::NotTracked { .. } => ErrorCode::NotTracked,
            Self::DetachedEntity { .. } => ErrorCode::DetachedEntity,
            Self::UnattachedReference { .. } => ErrorCode::UnattachedReference,
            Self::CyclicRelationship { .. } => ErrorCode::CyclicRelationship,
            Self::ConstraintViolation(_) => ErrorCode::ConstraintViolation,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Schema(_) => ErrorCode::SchemaError,
            Self::UnknownTable { .. } => ErrorCode::UnknownTable,
            Self::UnknownColumn { .. } => ErrorCode::UnknownColumn,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::AlreadyAttached { .. } => Some(
                "An entity belongs to at most one session. Detach it from its current session first."
                    .to_string(),
            ),

            Self::NotTracked { .. } => {
                Some("Attach the entity to this session before mutating it through the session.".to_string())
            }

            Self::DetachedEntity { .. } => Some(
                "Detached entities are terminal. Load a fresh instance with `Session::get`.".to_string(),
            ),

            Self::UnattachedReference { relationship, related, .. } if related.starts_with("a dropped ") => {
                Some(format!(
                    "Keep a handle to the parent while the child is staged, or clear '{relationship}' first."
                ))
            }

            Self::UnattachedReference { relationship, .. } => Some(format!(
                "Attach the related entity explicitly, or enable cascade on '{relationship}'."
            )),

            Self::CyclicRelationship { .. } => Some(
                "Two pending entities require each other's identity. Flush one side first, \
                 then set the second reference."
                    .to_string(),
            ),

            Self::UnknownTable { similar, .. } | Self::UnknownColumn { similar, .. }
                if !similar.is_empty() =>
            {
                Some(format!("Did you mean: {}?", similar.join(", ")))
            }

            Self::Schema(_) => Some(
                "An existing table does not match its mapping. Use a fresh database or \
                 align the mapping with the stored table."
                    .to_string(),
            ),

            Self::Config(_) => Some(
                "Use `sqlite:///:memory:` for an in-memory database or `sqlite:///<path>` for a file."
                    .to_string(),
            ),

            Self::UnknownTable { .. }
            | Self::UnknownColumn { .. }
            | Self::ConstraintViolation(_)
            | Self::NotFound { .. }
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::InvalidArgument(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    ///
    /// Includes error code, message, retryability, exit code, and
    /// optional recovery hint.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_errors_are_not_retryable() {
        let err = Error::CyclicRelationship {
            cycle: vec!["employees#1".to_string(), "departments#2".to_string()],
        };
        assert!(!err.error_code().is_retryable());
        assert_eq!(err.exit_code(), 5);
        assert_eq!(
            err.to_string(),
            "Cyclic relationship between pending entities: employees#1 -> departments#2"
        );
    }

    #[test]
    fn test_structured_json_includes_hint() {
        let err = Error::UnknownColumn {
            table: "users".to_string(),
            column: "nam".to_string(),
            similar: vec!["name".to_string()],
        };
        let json = err.to_structured_json();
        assert_eq!(json["error"]["code"], "UNKNOWN_COLUMN");
        assert_eq!(json["error"]["exit_code"], 3);
        assert_eq!(json["error"]["hint"], "Did you mean: name?");
    }

    #[test]
    fn test_backend_errors_are_retryable() {
        let err = Error::ConstraintViolation("UNIQUE constraint failed: users.name".to_string());
        assert!(err.error_code().is_retryable());
        assert_eq!(err.exit_code(), 2);
        assert!(err.hint().is_none());
    }
}
