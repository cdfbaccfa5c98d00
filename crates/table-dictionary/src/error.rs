//! Error types and result alias.
//!
//! Every public operation in this crate either returns a typed result or
//! fails with exactly one [`StorageError`] variant. Row-store implementations
//! map their transport and service errors onto the same variants so that
//! callers see a single taxonomy regardless of the backing store.
//!
//! # Error Classes
//!
//! | Class | Variants | Retried by [`RetryingTableClient`](crate::RetryingTableClient) |
//! |-------|----------|---------|
//! | Local validation | [`Validation`](StorageError::Validation), [`SizeLimitExceeded`](StorageError::SizeLimitExceeded), [`Config`](StorageError::Config) | never |
//! | Codec | [`UnsupportedShape`](StorageError::UnsupportedShape), [`TypeMismatch`](StorageError::TypeMismatch), [`Serialization`](StorageError::Serialization) | never |
//! | Store outcome | [`NotFound`](StorageError::NotFound), [`Conflict`](StorageError::Conflict), [`InvalidArgument`](StorageError::InvalidArgument), [`BatchOperation`](StorageError::BatchOperation) | never |
//! | Transport | [`Unavailable`](StorageError::Unavailable), [`Throttled`](StorageError::Throttled), [`Timeout`](StorageError::Timeout) | yes |
//!
//! # Example
//!
//! ```
//! use table_dictionary::{StorageError, StorageResult};
//!
//! fn lookup(key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(key))
//! }
//!
//! assert!(lookup("missing").unwrap_err().is_not_found());
//! ```

use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;

use crate::entity::PropertyKind;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for all storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while talking to the row-store or while encoding
/// and validating dictionary entries.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// An identifier or value failed local validation.
    ///
    /// Raised before any network call and never retried.
    #[error("Validation failed for {field}: {message}")]
    Validation {
        /// The field that failed validation (e.g. `"key"`).
        field: String,
        /// Why the value was rejected.
        message: String,
    },

    /// An identifier, property, or row exceeded a store-imposed ceiling.
    #[error("{kind} size {actual} exceeds limit of {limit}")]
    SizeLimitExceeded {
        /// What was measured (e.g. `"key"`, `"property 'Body'"`).
        kind: String,
        /// The measured size.
        actual: usize,
        /// The configured limit.
        limit: usize,
    },

    /// A configuration value was out of range.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No entity exists at the requested address.
    ///
    /// This is a recoverable outcome; dictionary lookups translate it into
    /// `None` / `false` where the operation contract allows.
    #[error("Entity not found: {key}")]
    NotFound {
        /// The address that was not found.
        key: String,
    },

    /// Optimistic concurrency violation.
    ///
    /// The expected version token did not match the stored row, or an
    /// insert collided with an existing row. Never retried by this crate;
    /// re-reading and retrying is a caller policy decision.
    #[error("Version conflict")]
    Conflict,

    /// A value shape cannot be represented in the flat property model.
    #[error("Unsupported value shape: {message}")]
    UnsupportedShape {
        /// Description of the offending member.
        message: String,
    },

    /// A stored property's kind is incompatible with the target member.
    #[error("Type mismatch for property '{property}': expected {expected}, found {actual}")]
    TypeMismatch {
        /// The property name.
        property: String,
        /// The kind the target member requires.
        expected: PropertyKind,
        /// The kind that was stored.
        actual: PropertyKind,
    },

    /// A serialized property payload could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The store rejected the request arguments.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// The store's explanation.
        message: String,
    },

    /// The store could not be reached.
    #[error("Service unavailable: {message}")]
    Unavailable {
        /// Description of the transport failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The store is shedding load.
    #[error("Request throttled")]
    Throttled {
        /// Server-suggested delay before the next attempt, if any.
        retry_after: Option<Duration>,
    },

    /// The operation exceeded its deadline.
    #[error("Operation timeout")]
    Timeout,

    /// One operation inside an atomic batch failed, aborting the batch.
    ///
    /// `index` is the position of the failing operation within the batch
    /// as submitted.
    #[error("Batch operation {index} failed: {source}")]
    BatchOperation {
        /// Position of the failing operation.
        index: usize,
        /// Why that operation failed.
        #[source]
        source: Box<StorageError>,
    },

    /// Catch-all for failures that fit no other category.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },
}

impl StorageError {
    /// Creates a new `Validation` error.
    #[must_use]
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    /// Creates a new `SizeLimitExceeded` error.
    #[must_use]
    pub fn size_limit_exceeded(kind: impl Into<String>, actual: usize, limit: usize) -> Self {
        Self::SizeLimitExceeded { kind: kind.into(), actual, limit }
    }

    /// Creates a new `NotFound` error for the given address.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
    }

    /// Creates a new `UnsupportedShape` error.
    #[must_use]
    pub fn unsupported_shape(message: impl Into<String>) -> Self {
        Self::UnsupportedShape { message: message.into() }
    }

    /// Creates a new `TypeMismatch` error.
    #[must_use]
    pub fn type_mismatch(
        property: impl Into<String>,
        expected: PropertyKind,
        actual: PropertyKind,
    ) -> Self {
        Self::TypeMismatch { property: property.into(), expected, actual }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `InvalidArgument` error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Creates a new `Unavailable` error with the given message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into(), source: None }
    }

    /// Creates a new `Unavailable` error with a message and source error.
    #[must_use]
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Throttled` error.
    #[must_use]
    pub fn throttled(retry_after: Option<Duration>) -> Self {
        Self::Throttled { retry_after }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Wraps `source` as the failure of operation `index` in a batch.
    #[must_use]
    pub fn batch_operation(index: usize, source: StorageError) -> Self {
        Self::BatchOperation { index, source: Box::new(source) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` for failures that may succeed when retried unchanged.
    ///
    /// Only transport-level failures qualify. `Conflict` is deliberately
    /// excluded: retrying a version-checked write needs a fresh read.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Throttled { .. } | Self::Timeout)
    }

    /// Returns `true` for errors detected locally before any network call.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::SizeLimitExceeded { .. } | Self::Config(_))
    }

    /// Returns `true` if this is a `NotFound` error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is a `Conflict` error.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }

    /// Returns the coarse kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::SizeLimitExceeded { .. } | Self::Config(_) => {
                ErrorKind::Validation
            },
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict => ErrorKind::Conflict,
            Self::UnsupportedShape { .. } => ErrorKind::UnsupportedShape,
            Self::TypeMismatch { .. } | Self::Serialization { .. } => ErrorKind::TypeMismatch,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Unavailable { .. } | Self::Timeout => ErrorKind::Unavailable,
            Self::Throttled { .. } => ErrorKind::Throttled,
            Self::BatchOperation { source, .. } => source.kind(),
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}

/// Coarse classification of a [`StorageError`].
///
/// Useful for metrics labels and for callers that only branch on the
/// category rather than the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Local identifier, size, or configuration validation.
    Validation,
    /// Point lookup or delete miss.
    NotFound,
    /// Version token mismatch.
    Conflict,
    /// Value cannot be encoded.
    UnsupportedShape,
    /// Stored data cannot be decoded into the target type.
    TypeMismatch,
    /// Store rejected the request.
    InvalidArgument,
    /// Transport failure or timeout.
    Unavailable,
    /// Store throttling.
    Throttled,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::UnsupportedShape => "unsupported_shape",
            Self::TypeMismatch => "type_mismatch",
            Self::InvalidArgument => "invalid_argument",
            Self::Unavailable => "unavailable",
            Self::Throttled => "throttled",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric setting is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// The offending field.
        field: &'static str,
        /// The minimum accepted value.
        min: String,
        /// The value that was supplied.
        value: String,
    },

    /// Two settings contradict each other.
    #[error("{field} is inconsistent: {reason}")]
    Inconsistent {
        /// The offending field.
        field: &'static str,
        /// Why the combination is rejected.
        reason: String,
    },
}
