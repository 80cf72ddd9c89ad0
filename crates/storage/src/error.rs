//! Error types and result alias.
//!
//! The taxonomy separates programming errors, which are returned
//! synchronously from builder and construction calls, from operation
//! failures, which travel through a [`Request`](crate::Request)'s rejection
//! channel.
//!
//! # Error Types
//!
//! - [`DbError::Argument`] - structurally invalid input (bad field count, unknown index, malformed
//!   range)
//! - [`DbError::InvalidState`] - the operation needs context that is not present
//! - [`DbError::NotSupported`] - the active back-end lacks a required capability
//! - [`DbError::NotFound`], [`DbError::Constraint`], [`DbError::Aborted`],
//!   [`DbError::Serialization`], [`DbError::Internal`] - failures reported by the storage engine
//!
//! # Example
//!
//! ```
//! use cursordb_storage::{DbError, DbResult};
//!
//! fn select(fields: &[&str]) -> DbResult<()> {
//!     if fields.len() > 2 {
//!         return Err(DbError::argument("too many fields in select"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(select(&["a", "b", "c"]).unwrap_err().is_argument());
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A shared boxed error used for source chain tracking.
///
/// `Arc` rather than `Box` so a single rejection can be handed to every
/// observer of a request.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors produced by the request, query and back-end layers.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum DbError {
    /// The caller supplied structurally invalid input.
    ///
    /// Always returned synchronously: it is a programming error that can be
    /// detected before any I/O takes place.
    #[error("Argument error: {message}")]
    Argument {
        /// Description of the invalid argument.
        message: String,
    },

    /// The operation requires context that is not currently present, such as
    /// aborting a request that has no transaction attached.
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Description of the violated precondition.
        message: String,
    },

    /// The active back-end does not support the requested capability.
    #[error("Not supported: {message}")]
    NotSupported {
        /// The missing capability.
        message: String,
    },

    /// A store, index or record does not exist.
    #[error("Not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A write violated a uniqueness constraint.
    #[error("Constraint violation: {message}")]
    Constraint {
        /// Description of the violated constraint.
        message: String,
    },

    /// The transaction was aborted before the operation completed.
    #[error("Transaction aborted: {message}")]
    Aborted {
        /// Label of the aborted transaction or request.
        message: String,
    },

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Back-end specific failure that fits no other category.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },
}

impl DbError {
    /// Creates a new `Argument` error.
    #[must_use]
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument { message: message.into() }
    }

    /// Creates a new `InvalidState` error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    /// Creates a new `NotSupported` error.
    #[must_use]
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported { message: message.into() }
    }

    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a new `Constraint` error.
    #[must_use]
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint { message: message.into() }
    }

    /// Creates a new `Aborted` error.
    #[must_use]
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted { message: message.into() }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` for [`DbError::Argument`].
    #[must_use]
    pub fn is_argument(&self) -> bool {
        matches!(self, Self::Argument { .. })
    }

    /// Returns `true` for [`DbError::InvalidState`].
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// Returns `true` for [`DbError::NotSupported`].
    #[must_use]
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }

    /// Returns `true` for [`DbError::Aborted`].
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Returns `true` when the error was raised synchronously by input
    /// validation rather than reported by the storage engine.
    #[must_use]
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::Argument { .. } | Self::InvalidState { .. } | Self::NotSupported { .. }
        )
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_with_source(err.to_string(), err)
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Minimum allowed value.
        min: String,
        /// Value that was supplied.
        value: String,
    },

    /// A required string field is empty.
    #[error("{field} must not be empty")]
    Empty {
        /// Name of the offending field.
        field: &'static str,
    },
}
