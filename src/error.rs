//! Domain errors returned by the storage engine.
//!
//! Every failure that leaves the engine is a [`StorageError`]. Backend and codec
//! failures are translated at the engine boundary (see `storage::errors`), so
//! callers only ever match on the kinds below.

use thiserror::Error;

/// Message used when a watch starts at a compacted revision.
pub const WATCH_TOO_OLD: &str = "The resourceVersion for the provided watch is too old.";

/// Message used when a non-paginated list reads a compacted revision.
pub const LIST_TOO_OLD: &str = "The resourceVersion for the provided list is too old.";

/// Message used when a continue token can no longer be served.
pub const CONTINUE_EXPIRED: &str = "The provided continue parameter is too old to display a \
consistent list result. You can start a new list without the continue parameter.";

/// Message used when any other read asks for a compacted revision.
pub const RESOURCE_VERSION_TOO_OLD: &str = "The requested resourceVersion is too old.";

/// Stable numeric codes, matching the codes used by apiserver storage errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    KeyNotFound = 1,
    KeyExists = 2,
    ResourceVersionConflict = 3,
    InvalidObject = 4,
    Unreachable = 5,
    ResourceExpired = 6,
    TooLargeResourceVersion = 7,
    Cancelled = 8,
    Internal = 9,
}

/// Errors surfaced by [`crate::Store`] and the REST boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("key not found: {key}, resource version: {resource_version}")]
    KeyNotFound { key: String, resource_version: i64 },

    #[error("key exists: {key}, resource version: {resource_version}")]
    KeyExists { key: String, resource_version: i64 },

    #[error("resource version conflicts: {key}, resource version: {resource_version}: {message}")]
    ResourceVersionConflict {
        key: String,
        resource_version: i64,
        message: String,
    },

    #[error("invalid object: {key}: {message}")]
    InvalidObject { key: String, message: String },

    #[error("server unreachable: {key}: {message}")]
    Unreachable { key: String, message: String },

    #[error("resource expired: {message}")]
    ResourceExpired { message: String },

    #[error("Too large resource version: {requested}, current: {current}")]
    TooLargeResourceVersion { requested: i64, current: i64 },

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn not_found(key: impl Into<String>, resource_version: i64) -> Self {
        StorageError::KeyNotFound {
            key: key.into(),
            resource_version,
        }
    }

    pub fn exists(key: impl Into<String>, resource_version: i64) -> Self {
        StorageError::KeyExists {
            key: key.into(),
            resource_version,
        }
    }

    pub fn conflict(
        key: impl Into<String>,
        resource_version: i64,
        message: impl Into<String>,
    ) -> Self {
        StorageError::ResourceVersionConflict {
            key: key.into(),
            resource_version,
            message: message.into(),
        }
    }

    pub fn invalid_object(key: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::InvalidObject {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn unreachable(key: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Unreachable {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn expired(message: impl Into<String>) -> Self {
        StorageError::ResourceExpired {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::KeyNotFound { .. } => ErrorCode::KeyNotFound,
            StorageError::KeyExists { .. } => ErrorCode::KeyExists,
            StorageError::ResourceVersionConflict { .. } => ErrorCode::ResourceVersionConflict,
            StorageError::InvalidObject { .. } => ErrorCode::InvalidObject,
            StorageError::Unreachable { .. } => ErrorCode::Unreachable,
            StorageError::ResourceExpired { .. } => ErrorCode::ResourceExpired,
            StorageError::TooLargeResourceVersion { .. } => ErrorCode::TooLargeResourceVersion,
            StorageError::Cancelled(_) => ErrorCode::Cancelled,
            StorageError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// The key the error refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            StorageError::KeyNotFound { key, .. }
            | StorageError::KeyExists { key, .. }
            | StorageError::ResourceVersionConflict { key, .. }
            | StorageError::InvalidObject { key, .. }
            | StorageError::Unreachable { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Conflicts and unreachable backends may succeed when retried as-is.
    /// An expired resource version needs a fresh list instead.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageError::ResourceVersionConflict { .. } | StorageError::Unreachable { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::KeyNotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::ResourceVersionConflict { .. })
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, StorageError::ResourceExpired { .. })
    }
}
