//! Error types for the atomdb database
//!
//! A single `Error` enum is shared by every crate in the workspace. We use
//! `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Error Categories
//!
//! - **Validation**: malformed input, empty required arguments, unknown
//!   attribute names in query expressions
//! - **User**: policy violations such as a duplicate key in `to_dict`
//! - **Corruption**: a pointer resolving to missing data, checksum mismatch,
//!   unknown type tag, inconsistent tree invariants after load
//! - **NotSupported**: operation on a value of an unexpected kind, or an
//!   unimplemented plan path
//! - **Cancelled**: a query stopped by its cancellation token or deadline
//! - **Unexpected**: caught I/O or runtime failure; carries the original
//!   kind as a string and wraps the underlying message
//!
//! Corruption and unexpected errors abort and invalidate the current
//! transaction. Validation, user and not-supported errors surface to the
//! caller without touching storage state.

use std::io;
use thiserror::Error;

/// Result type alias for atomdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the atomdb database.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input or request
    #[error("validation error: {message}")]
    Validation {
        /// What is wrong with the input
        message: String,
    },

    /// Policy violation by the caller
    #[error("user error: {message}")]
    User {
        /// Which policy was violated
        message: String,
    },

    /// Data integrity failure
    ///
    /// The referenced data is missing, fails its checksum, or violates a
    /// structural invariant. Recovery requires going back to an earlier
    /// root or an offline repair pass.
    #[error("corruption detected: {message}")]
    Corruption {
        /// Description of the corruption
        message: String,
    },

    /// Operation not supported for the given value or plan shape
    #[error("not supported: {message}")]
    NotSupported {
        /// What was attempted
        message: String,
    },

    /// A query was stopped by its cancellation token or deadline
    #[error("cancelled: {message}")]
    Cancelled {
        /// Why execution stopped
        message: String,
    },

    /// Caught I/O or runtime failure
    ///
    /// `kind` preserves the class of the underlying error (for example
    /// `"io"` or the `io::ErrorKind` name) so callers can report it without
    /// downcasting.
    #[error("unexpected error ({kind}): {message}")]
    Unexpected {
        /// Class of the underlying failure
        kind: String,
        /// Underlying message
        message: String,
    },
}

impl Error {
    /// Create a Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Create a User error.
    pub fn user(message: impl Into<String>) -> Self {
        Error::User {
            message: message.into(),
        }
    }

    /// Create a Corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Error::Corruption {
            message: message.into(),
        }
    }

    /// Create a NotSupported error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Error::NotSupported {
            message: message.into(),
        }
    }

    /// Create a Cancelled error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Error::Cancelled {
            message: message.into(),
        }
    }

    /// Create an Unexpected error with an explicit kind.
    pub fn unexpected(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Unexpected {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Check whether this error invalidates the current transaction.
    ///
    /// Corruption and unexpected errors abort the transaction; everything
    /// else leaves it usable.
    pub fn invalidates_transaction(&self) -> bool {
        matches!(
            self,
            Error::Corruption { .. } | Error::Unexpected { .. }
        )
    }

    /// Check whether this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Check whether this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption { .. })
    }

    /// Check whether this error came from a cancelled query.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Unexpected {
            kind: format!("io::{:?}", e.kind()),
            message: e.to_string(),
        }
    }
}
