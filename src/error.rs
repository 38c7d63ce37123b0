//! Error types for mediabufs.
//!
//! The set is deliberately closed: callers only ever see one of the four
//! outcomes below. Kernel error codes are folded into
//! [`Error::OperationFailed`] and only survive as log text.

use thiserror::Error;

/// Result type alias using mediabufs' Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for request and buffer pool operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A kernel call or pool operation failed.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// The driver could not provide the requested buffer type or format.
    #[error("unsupported buffer type: {0}")]
    UnsupportedBufferType(String),

    /// The hardware flagged the completed buffer as bad.
    #[error("decoding error reported by hardware")]
    DecodingError,

    /// Backing memory could not be allocated or grown.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),
}

impl Error {
    /// Shorthand for an [`Error::OperationFailed`] with a formatted message.
    pub(crate) fn op(msg: impl Into<String>) -> Self {
        Error::OperationFailed(msg.into())
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(errno: rustix::io::Errno) -> Self {
        Error::OperationFailed(format!("system error: {}", errno))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::OperationFailed(format!("I/O error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_folds_into_operation_failed() {
        let err: Error = rustix::io::Errno::INVAL.into();
        assert!(matches!(err, Error::OperationFailed(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::DecodingError.to_string(),
            "decoding error reported by hardware"
        );
        assert_eq!(
            Error::AllocationFailed("plane 0".into()).to_string(),
            "allocation failed: plane 0"
        );
    }
}
