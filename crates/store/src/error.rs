//! Error types for the store crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use crate::Digest;
use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for store operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while reading or writing the on-disk tier
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(cairn::store::io),
        help("Check file permissions and ensure the store directory is writable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Content was never written or has been evicted
    #[error("Digest not found in store: {digest}")]
    #[diagnostic(
        code(cairn::store::not_found),
        help("The content may have been garbage collected or never existed")
    )]
    NotFound {
        /// The digest that was requested
        digest: Digest,
    },

    /// Two inputs declare different content at the same path
    #[error("Conflicting entries at '{path}': {message}")]
    #[diagnostic(code(cairn::store::conflict))]
    Conflict {
        /// Path (relative to the tree root) where the conflict was found
        path: String,
        /// Description of the mismatched entries
        message: String,
    },

    /// Stored bytes do not hash to the digest they were stored under
    #[error("Integrity check failed: expected {expected}, computed {actual}")]
    #[diagnostic(
        code(cairn::store::integrity),
        help("The on-disk store is corrupt; remove the affected blob and retry")
    )]
    Integrity {
        /// Digest the content was requested by
        expected: Digest,
        /// Digest of the bytes actually read
        actual: Digest,
    },

    /// A path was absolute, escaped the tree, or did not match a prefix
    #[error("Invalid path '{path}': {reason}")]
    #[diagnostic(code(cairn::store::invalid_path))]
    InvalidPath {
        /// The offending path
        path: String,
        /// Why the path was rejected
        reason: String,
    },

    /// A digest or fingerprint string could not be parsed
    #[error("Invalid digest: {message}")]
    #[diagnostic(
        code(cairn::store::invalid_digest),
        help("Digests are written as <64 hex chars>-<size in bytes>")
    )]
    InvalidDigest {
        /// Description of the parse failure
        message: String,
    },

    /// A directory node or cache record could not be (de)serialized
    #[error("Serialization error: {message}")]
    #[diagnostic(code(cairn::store::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub const fn not_found(digest: Digest) -> Self {
        Self::NotFound { digest }
    }

    /// Create a conflict error
    #[must_use]
    pub fn conflict(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid path error
    #[must_use]
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid digest error
    #[must_use]
    pub fn invalid_digest(msg: impl Into<String>) -> Self {
        Self::InvalidDigest {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Whether this error means the requested content is absent
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;
