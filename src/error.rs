use std::time::Duration;

use thiserror::Error;

/// Main error type for kgraph
#[derive(Error, Debug)]
pub enum KgraphError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed input records
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid user input (non-positive distance, missing argument, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Node not found in the store
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Store errors that are not plain SQLite errors (task join failures, injected faults)
    #[error("Store error: {0}")]
    Store(String),

    /// Traversal ran past its caller-supplied deadline
    #[error("Traversal deadline of {timeout:?} exceeded after expanding {expanded} nodes")]
    DeadlineExceeded { timeout: Duration, expanded: usize },

    /// A rename saga step failed; the saga can be resumed from `rename_id`
    #[error("Rename {rename_id} failed after step {step}: {message}")]
    Rename {
        rename_id: String,
        step: String,
        message: String,
    },

    /// Batch submitted to a write pool that has already shut down
    #[error("Write pool is closed")]
    PoolClosed,
}

/// Convenient Result type using KgraphError
pub type Result<T> = std::result::Result<T, KgraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KgraphError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: KgraphError = rusqlite_err.into();
        assert!(matches!(err, KgraphError::Database(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KgraphError = io_err.into();
        assert!(matches!(err, KgraphError::Io(_)));
    }

    #[test]
    fn test_deadline_display_mentions_expanded() {
        let err = KgraphError::DeadlineExceeded {
            timeout: Duration::from_millis(5),
            expanded: 42,
        };
        assert!(err.to_string().contains("42"));
    }
}
