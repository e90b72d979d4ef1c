//! Domain-level error taxonomy for Strata.

use strata_store::StorageError;

/// Rollup and query errors.
#[derive(Debug, thiserror::Error)]
pub enum RollupError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("corrupt {what}: {reason}")]
    CorruptPayload { what: String, reason: String },

    #[error("histogram error: {0}")]
    Histogram(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid agent rollup id: {0:?}")]
    InvalidAgentRollupId(String),
}

impl RollupError {
    /// Transient failures leave the bucket pending for the next pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, RollupError::Storage(e) if e.is_transient())
    }

    pub(crate) fn corrupt(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RollupError::CorruptPayload {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for Strata domain operations.
pub type Result<T> = std::result::Result<T, RollupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_timeouts_are_transient() {
        let err: RollupError = StorageError::Timeout {
            operation: "read_aggregates".into(),
            after_ms: 5,
        }
        .into();
        assert!(err.is_transient());
        assert!(err.to_string().contains("storage error"));
    }

    #[test]
    fn corrupt_payload_is_not_transient() {
        let err = RollupError::corrupt("profile blob#3", "unexpected end of input");
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "corrupt profile blob#3: unexpected end of input"
        );
    }
}
