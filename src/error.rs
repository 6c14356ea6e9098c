//! Error types for page-lock diagnostics.
//!
//! Only management-facing calls return these. Recording a lock event never
//! fails; see [`crate::Tracker`].

use crate::registry::OperationId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    /// `begin` was called for an operation that already has a live tracker.
    #[error("operation '{0}' is already tracked")]
    AlreadyTracked(OperationId),

    /// A dump was requested for an operation or thread with no live tracker.
    #[error("no tracker for {0}")]
    NotFound(String),

    /// The management interface could not be registered.
    #[error("failed to register management bean '{bean}': {reason}")]
    RegistrationFailure { bean: String, reason: String },

    /// A dump was rendered but could not be persisted.
    #[error("failed to write dump: {0}")]
    DumpWrite(String),

    /// A configuration value is out of range.
    #[error("invalid diagnostics config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, DiagnosticsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_subject() {
        let err = DiagnosticsError::AlreadyTracked(OperationId::from("op1"));
        assert_eq!(err.to_string(), "operation 'op1' is already tracked");

        let err = DiagnosticsError::NotFound("operation 'unknown'".to_string());
        assert_eq!(err.to_string(), "no tracker for operation 'unknown'");

        let err = DiagnosticsError::RegistrationFailure {
            bean: "node-1:Diagnostic:PageLockTracker".to_string(),
            reason: "directory closed".to_string(),
        };
        assert!(err.to_string().contains("directory closed"));
    }
}
