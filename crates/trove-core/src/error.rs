//! Unified error type for trove.
//!
//! Every crate in the workspace reports failures through [`Error`]. Errors
//! travel inside terminal chunks and may be handed to several consumers, so
//! the type is `Clone`; foreign errors (I/O, JSON) are captured as text.
//! [`Error::code`] gives a stable machine-readable tag for each variant.

use std::fmt;

use crate::caps::OperationKind;
use crate::keys::KeyType;

/// Unified error type covering all failure modes in trove.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// A key name is already registered with a different value type.
    #[error("metadata key '{name}' already registered as {existing}, cannot re-register as {requested}")]
    DuplicateKey {
        name: String,
        existing: KeyType,
        requested: KeyType,
    },

    /// A source with the same id is already registered.
    #[error("source '{0}' is already registered")]
    DuplicateSource(String),

    /// The target source does not implement the requested operation.
    #[error("source '{source_id}' does not support {operation}")]
    UnsupportedOperation {
        source_id: String,
        operation: OperationKind,
    },

    /// The requested options fall outside the source's caps and the caller
    /// asked for strict negotiation.
    #[error("source '{source_id}' rejected options for {operation}: {detail}")]
    CapabilityRejected {
        source_id: String,
        operation: OperationKind,
        detail: String,
    },

    /// The backing source reported an error for an in-flight operation.
    #[error("source '{source_id}' failed: {message}")]
    SourceFailure { source_id: String, message: String },

    /// A key name or id that is not registered (or not canonical).
    #[error("invalid metadata key: {0}")]
    InvalidKey(String),

    /// A value does not match the declared type of its key.
    #[error("type mismatch for key '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: KeyType,
        found: KeyType,
    },

    /// No source is registered under the given id.
    #[error("unknown source: {0}")]
    UnknownSource(String),

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Browse was requested on a leaf media item.
    #[error("media '{0}' is not a container and cannot be browsed")]
    NotBrowsable(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A multi-source operation found no source able to run it.
    #[error("no sources available for {0}")]
    NoSources(OperationKind),

    /// A blocking wait gave up before the terminal chunk arrived.
    #[error("operation timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::DuplicateKey { .. } => "duplicate_key",
            Error::DuplicateSource(_) => "duplicate_source",
            Error::UnsupportedOperation { .. } => "unsupported_operation",
            Error::CapabilityRejected { .. } => "capability_rejected",
            Error::SourceFailure { .. } => "source_failure",
            Error::InvalidKey(_) => "invalid_key",
            Error::TypeMismatch { .. } => "type_mismatch",
            Error::UnknownSource(_) => "unknown_source",
            Error::NotFound { .. } => "not_found",
            Error::NotBrowsable(_) => "not_browsable",
            Error::Cancelled => "cancelled",
            Error::NoSources(_) => "no_sources",
            Error::Timeout { .. } => "timeout",
            Error::Validation(_) => "validation",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Internal(_) => "internal",
        }
    }

    /// True for the errors that terminate an operation the caller cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Convenience constructor for [`Error::SourceFailure`].
    pub fn source_failure(source_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::SourceFailure {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    /// Convenience constructor for [`Error::UnsupportedOperation`].
    pub fn unsupported(source_id: impl Into<String>, operation: OperationKind) -> Self {
        Error::UnsupportedOperation {
            source_id: source_id.into(),
            operation,
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
