//! Error types for nwp-fetch crates.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias using NwpError.
pub type NwpResult<T> = Result<T, NwpError>;

/// Primary error type for forecast retrieval operations.
#[derive(Debug, Clone, Error)]
pub enum NwpError {
    // === Schedule / configuration errors ===
    #[error("Invalid horizon {requested}h: must be in 1..={model_max}h")]
    InvalidHorizon { requested: u32, model_max: u32 },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Invalid cycle: {0}")]
    InvalidCycle(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid time specification: {0}")]
    InvalidTime(String),

    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    // === Availability errors ===
    #[error(
        "Cycle not ready: {} file(s) missing {:?}, validation file missing: {}",
        missing_offsets.len(),
        missing_offsets,
        validation_file_missing
    )]
    CycleNotReady {
        missing_offsets: Vec<u32>,
        validation_file_missing: bool,
    },

    // === Transfer errors ===
    #[error("Transfer failed for {failed} of {total} file(s): {first_error}")]
    TransferFailed {
        failed: usize,
        total: usize,
        first_error: String,
    },

    #[error("Post-transfer verification failed: {0} not found at destination")]
    PostTransferVerificationFailed(String),

    // === Time axis errors ===
    #[error("Duplicate valid time {realized_time} from inputs #{first} and #{second}")]
    DuplicateTimeConflict {
        realized_time: DateTime<Utc>,
        first: usize,
        second: usize,
    },

    // === Storage errors ===
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,
}

impl NwpError {
    /// Whether a single transfer attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NwpError::Timeout(_) | NwpError::StorageError(_))
    }

    /// Whether the whole operation should be deferred and retried later
    /// rather than treated as a hard failure.
    pub fn is_deferrable(&self) -> bool {
        matches!(self, NwpError::CycleNotReady { .. })
    }
}

impl From<std::io::Error> for NwpError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => NwpError::NotFound(err.to_string()),
            _ => NwpError::StorageError(err.to_string()),
        }
    }
}

impl From<object_store::Error> for NwpError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => NwpError::NotFound(path),
            e => NwpError::StorageError(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for NwpError {
    fn from(err: serde_json::Error) -> Self {
        NwpError::InvalidConfig(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(NwpError::Timeout(30).is_retryable());
        assert!(NwpError::StorageError("connection reset".into()).is_retryable());
        assert!(!NwpError::NotFound("gs://b/k".into()).is_retryable());
        assert!(!NwpError::Cancelled.is_retryable());
        assert!(!NwpError::PostTransferVerificationFailed("x".into()).is_retryable());
    }

    #[test]
    fn test_cycle_not_ready_is_deferrable() {
        let err = NwpError::CycleNotReady {
            missing_offsets: vec![6],
            validation_file_missing: true,
        };
        assert!(err.is_deferrable());
        assert!(!NwpError::InvalidHorizon { requested: 500, model_max: 384 }.is_deferrable());
        assert!(err.to_string().contains("[6]"));
    }

    #[test]
    fn test_cycle_not_ready_counts_every_missing_file() {
        let err = NwpError::CycleNotReady {
            missing_offsets: vec![3, 6],
            validation_file_missing: false,
        };
        assert_eq!(
            err.to_string(),
            "Cycle not ready: 2 file(s) missing [3, 6], validation file missing: false"
        );
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(NwpError::from(io), NwpError::NotFound(_)));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(NwpError::from(io), NwpError::StorageError(_)));
    }
}
