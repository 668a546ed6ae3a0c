//! Error types for the analytics engine

use thiserror::Error;

/// Main error type returned by every public operation
#[derive(Error, Debug)]
pub enum Error {
    /// Empty event name or user id, malformed operands
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Wrong number of keys for a set-algebra operator
    #[error("Operator {op} expects {expected}, got {got} key(s)")]
    InvalidOperandCount {
        /// Operator that was requested
        op: String,
        /// Human readable arity requirement
        expected: &'static str,
        /// Number of keys supplied
        got: usize,
    },

    /// Configuration error (empty interval catalog, bad prefix, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A store round-trip exceeded its deadline
    #[error("Store timeout: {0}")]
    StoreTimeout(String),

    /// Connection-level failure talking to the store
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A multi-interval write was only partially applied
    ///
    /// Bit writes are idempotent, so the whole `record` call can be retried.
    #[error("Partial write: {applied} of {total} bit writes applied")]
    PartialWrite {
        /// Writes known to have been applied
        applied: usize,
        /// Writes in the batch
        total: usize,
    },

    /// The store rejected a command (type error, script error, ...)
    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    /// Whether re-issuing the same call is safe and may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreTimeout(_) | Error::StoreUnavailable(_) | Error::PartialWrite { .. }
        )
    }

    /// Short stable name of the variant, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::InvalidOperandCount { .. } => "invalid_operand_count",
            Error::Configuration(_) => "configuration",
            Error::StoreTimeout(_) => "store_timeout",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::PartialWrite { .. } => "partial_write",
            Error::Store(_) => "store",
        }
    }
}

/// Errors raised by a [`BitmapStore`](crate::engine::traits::BitmapStore) implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Command exceeded its deadline
    #[error("Command timeout: {0}")]
    Timeout(String),

    /// Connection could not be established or was dropped
    #[error("Connection error: {0}")]
    Unavailable(String),

    /// Store answered with an error reply
    #[error("Response error: {0}")]
    Response(String),

    /// A non-atomic batch stopped after some writes were applied
    #[error("Batch stopped after {applied} of {total} writes: {reason}")]
    PartialWrite {
        /// Writes applied before the failure
        applied: usize,
        /// Writes in the batch
        total: usize,
        /// Underlying failure
        reason: String,
    },
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout(msg) => Error::StoreTimeout(msg),
            StoreError::Unavailable(msg) => Error::StoreUnavailable(msg),
            StoreError::Response(msg) => Error::Store(msg),
            StoreError::PartialWrite { applied, total, .. } => {
                Error::PartialWrite { applied, total }
            },
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_conversion() {
        let err: Error = StoreError::Timeout("BITCOUNT".to_string()).into();
        assert!(matches!(err, Error::StoreTimeout(_)));

        let err: Error = StoreError::Unavailable("refused".to_string()).into();
        assert!(matches!(err, Error::StoreUnavailable(_)));

        let err: Error = StoreError::Response("WRONGTYPE".to_string()).into();
        assert!(matches!(err, Error::Store(_)));

        let err: Error = StoreError::PartialWrite {
            applied: 2,
            total: 5,
            reason: "io".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            Error::PartialWrite {
                applied: 2,
                total: 5
            }
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::StoreTimeout("t".into()).is_retryable());
        assert!(Error::PartialWrite {
            applied: 1,
            total: 2
        }
        .is_retryable());
        assert!(!Error::InvalidArgument("x".into()).is_retryable());
        assert!(!Error::Store("WRONGTYPE".into()).is_retryable());
    }

    #[test]
    fn test_operand_count_message() {
        let err = Error::InvalidOperandCount {
            op: "NOT".to_string(),
            expected: "exactly one",
            got: 2,
        };
        assert_eq!(err.to_string(), "Operator NOT expects exactly one, got 2 key(s)");
    }
}
