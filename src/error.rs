//! Error types for asset-custody

use thiserror::Error;

use crate::auth::Role;

/// Prefix carried by every append-only trigger abort message.
pub(crate) const APPEND_ONLY_PREFIX: &str = "append_only:";

#[derive(Error, Debug)]
pub enum CustodyError {
    /// Insufficient rank or target outside the actor's jurisdiction.
    ///
    /// The message names what was required, never what the actor holds.
    #[error("Forbidden: requires {required} for {target}")]
    Forbidden { required: Role, target: String },

    #[error("Invalid request: {field}: {reason}")]
    InvalidRequest { field: &'static str, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Append-only table {table} rejects updates and deletes")]
    AppendOnlyViolation { table: String },

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Audit sink error: {0}")]
    AuditSink(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Forbidden,
    Invalid,
    NotFound,
    Unauthenticated,
    Fatal,
}

impl CustodyError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        CustodyError::InvalidRequest {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CustodyError::NotFound(what.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CustodyError::Forbidden { .. } => ErrorKind::Forbidden,
            CustodyError::InvalidRequest { .. } | CustodyError::Json(_) => ErrorKind::Invalid,
            CustodyError::NotFound(_) => ErrorKind::NotFound,
            CustodyError::Auth(_) => ErrorKind::Unauthenticated,
            _ => ErrorKind::Fatal,
        }
    }
}

impl From<rusqlite::Error> for CustodyError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(_, Some(ref message)) = e {
            if let Some(table) = message.strip_prefix(APPEND_ONLY_PREFIX) {
                return CustodyError::AppendOnlyViolation {
                    table: table.to_string(),
                };
            }
        }
        CustodyError::Database(e)
    }
}
