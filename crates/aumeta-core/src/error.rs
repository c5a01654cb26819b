//! Error types for aumeta.

use thiserror::Error;

use crate::models::ExtractedRecord;

/// Result type alias using aumeta's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// SQLite primary result code for a busy database file.
const SQLITE_BUSY: i32 = 5;

/// SQLite primary result code for a locked table.
const SQLITE_LOCKED: i32 = 6;

/// Core error type for aumeta operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Extracted metadata could not be recorded as given.
    #[error("Metadata error: {message}")]
    Metadata {
        message: String,
        record: Option<Box<ExtractedRecord>>,
    },

    /// A schema upgrade step failed and cannot be retried.
    #[error("Schema upgrade to version {version} failed: {message}")]
    Schema { version: u32, message: String },

    /// An operation was attempted in a lifecycle phase that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The operation was aborted by a cancellation request.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a metadata error that carries the offending record.
    pub fn metadata(message: impl Into<String>, record: &ExtractedRecord) -> Self {
        Error::Metadata {
            message: message.into(),
            record: Some(Box::new(record.clone())),
        }
    }

    /// Whether retrying the same operation later may succeed.
    ///
    /// Only connectivity problems qualify: pool exhaustion, I/O failures and
    /// SQLite BUSY/LOCKED results. Constraint violations, schema conflicts and
    /// data problems are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => is_transient_sqlx(e),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

/// Classify a raw `sqlx::Error` as transient (retryable) or not.
pub fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false),
        _ => false,
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Failure raised by a metadata extractor while processing one article.
///
/// The variant decides what happens to the task that invoked the extractor.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Content for this article could not be read from the repository right
    /// now. The article is counted as an error and extraction continues.
    #[error("Repository state error: {0}")]
    RepositoryState(String),

    /// I/O failure; the task is rescheduled.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The plugin rejected the content; the task fails.
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// The extracted record could not be buffered; the task fails.
    #[error("Emit error: {0}")]
    Emit(String),

    /// Anything else; the task fails.
    #[error("Unexpected extraction error: {0}")]
    Unexpected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_state() {
        let err = Error::InvalidState("sequence already opened".to_string());
        assert_eq!(err.to_string(), "Invalid state: sequence already opened");
    }

    #[test]
    fn test_error_display_schema() {
        let err = Error::Schema {
            version: 12,
            message: "no such table".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Schema upgrade to version 12 failed: no such table"
        );
    }

    #[test]
    fn test_metadata_error_keeps_record() {
        let record = ExtractedRecord::default();
        match Error::metadata("missing access url", &record) {
            Error::Metadata { message, record } => {
                assert_eq!(message, "missing access url");
                assert!(record.is_some());
            }
            _ => panic!("Expected Metadata error"),
        }
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = Error::Database(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn test_row_not_found_is_not_transient() {
        let err = Error::Database(sqlx::Error::RowNotFound);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_io_is_transient() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(Error::from(io_err).is_transient());
    }

    #[test]
    fn test_validation_errors_are_not_transient() {
        assert!(!Error::InvalidState("x".into()).is_transient());
        assert!(!Error::Schema {
            version: 1,
            message: "conflict".into()
        }
        .is_transient());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_extract_error_display() {
        let err = ExtractError::Plugin("bad xml".to_string());
        assert_eq!(err.to_string(), "Plugin error: bad xml");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
        assert_send::<ExtractError>();
    }
}
