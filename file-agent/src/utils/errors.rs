//! Custom error types for the file agent.

use crate::backup::ChangeSummary;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Upload incomplete: {received} of {expected} chunks received")]
    Incomplete { received: usize, expected: usize },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        expected: String,
        actual: String,
        retries_exhausted: bool,
    },

    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("File type is not editable: {0}")]
    NotEditable(String),

    #[error("Download failed: {message}")]
    Download { message: String, retryable: bool },

    #[error("Process control error: {0}")]
    Process(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{source} (files were partially changed)")]
    PartiallyApplied {
        changes: ChangeSummary,
        #[source]
        source: Box<AgentError>,
    },

    #[error("Background task failed: {0}")]
    Task(String),
}

impl AgentError {
    /// Stable machine-readable code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "CONFIG_ERROR",
            AgentError::Io(_) => "IO_ERROR",
            AgentError::InvalidPath(_) => "INVALID_PATH",
            AgentError::InvalidArgument(_) => "INVALID_ARGUMENT",
            AgentError::NotFound(_) => "NOT_FOUND",
            AgentError::AlreadyExists(_) => "ALREADY_EXISTS",
            AgentError::Incomplete { .. } => "INCOMPLETE",
            AgentError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            AgentError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            AgentError::Extraction(_) => "EXTRACTION_ERROR",
            AgentError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            AgentError::NotEditable(_) => "NOT_EDITABLE",
            AgentError::Download { .. } => "DOWNLOAD_ERROR",
            AgentError::Process(_) => "PROCESS_ERROR",
            AgentError::Serialization(_) => "SERIALIZATION_ERROR",
            AgentError::PartiallyApplied { source, .. } => source.code(),
            AgentError::Task(_) => "TASK_ERROR",
        }
    }

    /// Whether the caller should simply try the same request again later.
    pub fn retryable(&self) -> bool {
        match self {
            AgentError::Incomplete { .. } => true,
            AgentError::ChecksumMismatch {
                retries_exhausted, ..
            } => !retries_exhausted,
            AgentError::Download { retryable, .. } => *retryable,
            AgentError::PartiallyApplied { source, .. } => source.retryable(),
            _ => false,
        }
    }

    /// Change summary of a mutation that failed halfway, if any.
    pub fn partial_changes(&self) -> Option<&ChangeSummary> {
        match self {
            AgentError::PartiallyApplied { changes, .. } => Some(changes),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for AgentError {
    fn from(e: tokio::task::JoinError) -> Self {
        AgentError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_is_retryable() {
        let err = AgentError::Incomplete {
            received: 1,
            expected: 3,
        };
        assert!(err.retryable());
        assert_eq!(err.code(), "INCOMPLETE");
        assert_eq!(err.to_string(), "Upload incomplete: 1 of 3 chunks received");
    }

    #[test]
    fn test_checksum_mismatch_retry_budget() {
        let err = AgentError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into(),
            retries_exhausted: false,
        };
        assert!(err.retryable());

        let err = AgentError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into(),
            retries_exhausted: true,
        };
        assert!(!err.retryable());
    }

    #[test]
    fn test_partially_applied_keeps_inner_code() {
        let err = AgentError::PartiallyApplied {
            changes: ChangeSummary::default(),
            source: Box::new(AgentError::Extraction("truncated".into())),
        };
        assert_eq!(err.code(), "EXTRACTION_ERROR");
        assert!(err.partial_changes().is_some());
        assert!(!err.retryable());
    }
}
