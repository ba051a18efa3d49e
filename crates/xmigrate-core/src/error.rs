//! Error types for the migration engine.
//!
//! Every failure the engine can surface is a variant of [`MigrateError`]. The
//! orchestrator never inspects error messages; it asks an error for its
//! [`Disposition`] and drives the unit state machine from that.

use crate::model::EntityKind;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the migration engine.
#[derive(Debug, Error)]
pub enum MigrateError {
    // Source server errors
    #[error("Source unavailable: {message}")]
    SourceUnavailable {
        message: String,
        status: Option<u16>,
    },

    #[error("Source entity not found: {source_id}")]
    SourceNotFound { source_id: String },

    // Destination server errors
    #[error("Destination unavailable: {message}")]
    DestinationUnavailable {
        message: String,
        status: Option<u16>,
    },

    #[error("{server} rejected request with status {status}: {message}")]
    Rejected {
        server: String,
        message: String,
        status: u16,
    },

    #[error("Authorization failed for {server}: {message}")]
    Authorization { server: String, message: String },

    // Identity and data divergence
    #[error("Mapping conflict for {kind} {source_id}: already mapped to {existing}, refusing {attempted}")]
    MappingConflict {
        kind: EntityKind,
        source_id: String,
        existing: String,
        attempted: String,
    },

    #[error("Conflict for {kind} '{label}': destination differs in fields {fields:?}")]
    Conflict {
        kind: EntityKind,
        label: String,
        fields: Vec<String>,
    },

    #[error("Transfer integrity check failed for {destination_id}: expected {expected}, got {actual}")]
    TransferIntegrity {
        destination_id: String,
        expected: String,
        actual: String,
    },

    #[error("Datatypes not enabled on destination: {missing:?}")]
    UnsupportedDatatype { missing: Vec<String> },

    // Transport
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Migration cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

/// How the orchestrator should treat a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient; the same call may succeed if repeated after a backoff.
    Retryable,
    /// The unit cannot succeed; mark it Failed and move on.
    Permanent,
    /// The whole run must stop.
    Fatal,
}

/// Outcome of one engine call, as consumed by the orchestrator state machine.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    Retryable(MigrateError),
    Fatal(MigrateError),
}

impl<T> Attempt<T> {
    /// Sort a `Result` into the three-way outcome.
    ///
    /// Permanent errors land in `Fatal` here: for a single unit there is no
    /// difference between "give up on this unit" and "give up"; the run-level
    /// decision is taken by the orchestrator from [`MigrateError::disposition`].
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Attempt::Done(value),
            Err(e) if e.is_retryable() => Attempt::Retryable(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

// Conversion implementations for common error types

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        MigrateError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for MigrateError {
    fn from(err: rusqlite::Error) -> Self {
        MigrateError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for MigrateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MigrateError::Timeout(std::time::Duration::from_secs(0))
        } else {
            MigrateError::Network {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}

impl MigrateError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        MigrateError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Classify this error for the unit state machine.
    pub fn disposition(&self) -> Disposition {
        match self {
            MigrateError::SourceUnavailable { .. }
            | MigrateError::DestinationUnavailable { .. }
            | MigrateError::TransferIntegrity { .. }
            | MigrateError::Network { .. }
            | MigrateError::Timeout(_) => Disposition::Retryable,

            MigrateError::Authorization { .. }
            | MigrateError::UnsupportedDatatype { .. }
            | MigrateError::Database { .. }
            | MigrateError::Config { .. }
            | MigrateError::Cancelled => Disposition::Fatal,

            _ => Disposition::Permanent,
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retryable
    }

    /// Check if this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        self.disposition() == Disposition::Fatal
    }

    /// Short, stable name of the error class, used in reports and the ledger.
    pub fn class(&self) -> &'static str {
        match self {
            MigrateError::SourceUnavailable { .. } => "source_unavailable",
            MigrateError::SourceNotFound { .. } => "source_not_found",
            MigrateError::DestinationUnavailable { .. } => "destination_unavailable",
            MigrateError::Rejected { .. } => "rejected",
            MigrateError::Authorization { .. } => "authorization",
            MigrateError::MappingConflict { .. } => "mapping_conflict",
            MigrateError::Conflict { .. } => "conflict",
            MigrateError::TransferIntegrity { .. } => "transfer_integrity",
            MigrateError::UnsupportedDatatype { .. } => "unsupported_datatype",
            MigrateError::Network { .. } => "network",
            MigrateError::Timeout(_) => "timeout",
            MigrateError::Database { .. } => "database",
            MigrateError::Io { .. } => "io",
            MigrateError::Json { .. } => "json",
            MigrateError::Config { .. } => "config",
            MigrateError::Cancelled => "cancelled",
            MigrateError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrateError::SourceNotFound {
            source_id: "XNAT_S00001".into(),
        };
        assert_eq!(err.to_string(), "Source entity not found: XNAT_S00001");
    }

    #[test]
    fn test_dispositions() {
        assert_eq!(
            MigrateError::Timeout(std::time::Duration::from_secs(5)).disposition(),
            Disposition::Retryable
        );
        assert_eq!(
            MigrateError::Authorization {
                server: "dst".into(),
                message: "401".into()
            }
            .disposition(),
            Disposition::Fatal
        );
        assert_eq!(
            MigrateError::Conflict {
                kind: EntityKind::Subject,
                label: "S1".into(),
                fields: vec!["group".into()],
            }
            .disposition(),
            Disposition::Permanent
        );
    }

    #[test]
    fn test_integrity_errors_are_retryable() {
        let err = MigrateError::TransferIntegrity {
            destination_id: "f1".into(),
            expected: "10 bytes".into(),
            actual: "9 bytes".into(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_attempt_from_result() {
        let ok: Attempt<u32> = Attempt::from_result(Ok(7));
        assert!(matches!(ok, Attempt::Done(7)));

        let transient: Attempt<u32> = Attempt::from_result(Err(MigrateError::SourceUnavailable {
            message: "503".into(),
            status: Some(503),
        }));
        assert!(matches!(transient, Attempt::Retryable(_)));

        let gone: Attempt<u32> = Attempt::from_result(Err(MigrateError::SourceNotFound {
            source_id: "x".into(),
        }));
        assert!(matches!(gone, Attempt::Fatal(_)));
    }
}
