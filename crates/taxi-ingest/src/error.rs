//! Error taxonomy for the bulk-load pipeline
//!
//! Per-file failures are [`ImportError`]s: they are recovered at the file
//! boundary (rollback, no ledger entry) and reported in the run summary.
//! [`PipelineError`] is reserved for failures that stop a whole run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::download::DownloadError;
use crate::schema::SchemaError;

/// Ledger insert rejected because the file name is already present
const UNIQUE_VIOLATION: &str = "23505";
/// REPEATABLE READ transaction lost a race against a concurrent commit
const SERIALIZATION_FAILURE: &str = "40001";
const INSUFFICIENT_PRIVILEGE: &str = "42501";

/// Stable, serialisable name of a per-file failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SourceReadError,
    SchemaMismatchError,
    DestinationWriteError,
    LedgerConflictError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::SourceReadError => "SourceReadError",
            ErrorKind::SchemaMismatchError => "SchemaMismatchError",
            ErrorKind::DestinationWriteError => "DestinationWriteError",
            ErrorKind::LedgerConflictError => "LedgerConflictError",
        };
        f.write_str(name)
    }
}

/// Failure while importing one source file. The destination is always left
/// in its pre-import state when one of these is returned.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Cannot read source file '{file}': {message}")]
    SourceRead { file: String, message: String },

    #[error("Destination rejected the data: {0}")]
    SchemaMismatch(String),

    #[error("Destination write failed: {0}")]
    DestinationWrite(String),

    #[error("File '{0}' was recorded in the import ledger by a concurrent run")]
    LedgerConflict(String),
}

impl ImportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImportError::SourceRead { .. } => ErrorKind::SourceReadError,
            ImportError::SchemaMismatch(_) => ErrorKind::SchemaMismatchError,
            ImportError::DestinationWrite(_) => ErrorKind::DestinationWriteError,
            ImportError::LedgerConflict(_) => ErrorKind::LedgerConflictError,
        }
    }

    pub fn source_read(file: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ImportError::SourceRead {
            file: file.into(),
            message: err.to_string(),
        }
    }

    /// Classify a failed ledger insert: a duplicate key or a serialization
    /// failure means another run got there first.
    pub(crate) fn from_ledger_insert(file: &str, err: sqlx::Error) -> Self {
        match sqlstate(&err).as_deref() {
            Some(UNIQUE_VIOLATION) | Some(SERIALIZATION_FAILURE) => {
                ImportError::LedgerConflict(file.to_string())
            },
            _ => err.into(),
        }
    }
}

/// SQLSTATE of a database error, if the server sent one
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// Data exceptions (22), integrity violations (23) and syntax/undefined
/// object errors (42) mean the rows do not fit the table.
fn is_schema_mismatch(code: &str) -> bool {
    code != INSUFFICIENT_PRIVILEGE
        && (code.starts_with("22") || code.starts_with("23") || code.starts_with("42"))
}

impl From<sqlx::Error> for ImportError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) if is_schema_mismatch(&code) => {
                    ImportError::SchemaMismatch(db.message().to_string())
                },
                _ => ImportError::DestinationWrite(err.to_string()),
            },
            sqlx::Error::ColumnNotFound(column) => {
                ImportError::SchemaMismatch(format!("column not found: {}", column))
            },
            _ => ImportError::DestinationWrite(err.to_string()),
        }
    }
}

/// Failure that stops a whole pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No source files found in {}", .0.display())]
    NoSourceFiles(PathBuf),

    #[error("None of the {0} source files could be read to derive the table")]
    NoReadableSource(usize),

    #[error("Schema reconciliation failed: {0}")]
    Reconciliation(#[from] SchemaError),

    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ImportError::source_read("a.parquet", "bad magic").kind(),
            ErrorKind::SourceReadError
        );
        assert_eq!(
            ImportError::SchemaMismatch("x".into()).kind(),
            ErrorKind::SchemaMismatchError
        );
        assert_eq!(
            ImportError::DestinationWrite("x".into()).kind(),
            ErrorKind::DestinationWriteError
        );
        assert_eq!(
            ImportError::LedgerConflict("a.parquet".into()).kind(),
            ErrorKind::LedgerConflictError
        );
    }

    #[test]
    fn test_kind_serializes_by_name() {
        let json = serde_json::to_string(&ErrorKind::SchemaMismatchError).unwrap();
        assert_eq!(json, "\"SchemaMismatchError\"");
        assert_eq!(ErrorKind::LedgerConflictError.to_string(), "LedgerConflictError");
    }

    #[test]
    fn test_sqlstate_classification() {
        assert!(is_schema_mismatch("22003")); // numeric_value_out_of_range
        assert!(is_schema_mismatch("23502")); // not_null_violation
        assert!(is_schema_mismatch("42804")); // datatype_mismatch
        assert!(!is_schema_mismatch("42501"));
        assert!(!is_schema_mismatch("08006")); // connection_failure
        assert!(!is_schema_mismatch("57014")); // query_canceled
    }

    #[test]
    fn test_non_database_errors_are_write_failures() {
        let err: ImportError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind(), ErrorKind::DestinationWriteError);

        let err = ImportError::from_ledger_insert("a.parquet", sqlx::Error::PoolClosed);
        assert_eq!(err.kind(), ErrorKind::DestinationWriteError);
    }
}
