//! Custom error types for fgsort operations.

use std::io;
use thiserror::Error;

/// Result type alias for fgsort operations
pub type Result<T> = std::result::Result<T, FgsortError>;

/// Error type for fgsort operations
#[derive(Error, Debug)]
pub enum FgsortError {
    /// A value does not fit its packed on-disk representation
    #[error("Value out of range for {what}: {value}")]
    Encoding {
        /// What was being encoded (e.g. "intra-block offset")
        what: &'static str,
        /// The offending value
        value: u64,
    },

    /// Temp-file or output I/O failure
    #[error("Storage failure while {context}: {source}")]
    Storage {
        /// What the operation was doing when it failed
        context: String,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// An index stream failed validation during loading
    #[error("Corrupt index: {reason}")]
    CorruptIndex {
        /// Explanation of the problem
        reason: String,
    },

    /// A component was driven outside its legal state-machine order
    #[error("Illegal state: {reason}")]
    IllegalState {
        /// Explanation of the contract violation
        reason: String,
    },

    /// Invalid parameter value provided
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// The parameter name
        parameter: String,
        /// Explanation of why it's invalid
        reason: String,
    },
}

impl FgsortError {
    /// Wrap an I/O error with a description of the operation in flight.
    pub(crate) fn storage(context: impl Into<String>, source: io::Error) -> Self {
        Self::Storage { context: context.into(), source }
    }

    /// Build a `CorruptIndex` error from a reason string.
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptIndex { reason: reason.into() }
    }

    /// Build an `IllegalState` error from a reason string.
    pub(crate) fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState { reason: reason.into() }
    }
}
