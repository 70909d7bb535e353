//! Error types for refkb.

use thiserror::Error;

/// Result type alias using refkb's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for refkb operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration is missing or unusable (source store path, engine config).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Query against the source library failed (wraps sqlx::Error)
    #[error("Extraction error: {0}")]
    Extraction(#[from] sqlx::Error),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attachment not present in the metadata universe
    #[error("Attachment not found: {0}")]
    AttachmentNotFound(i64),

    /// Conversion engine failed, or the source file is unreadable or corrupt
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Serialization/deserialization error (JSON, CSV)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error must abort a whole run.
    ///
    /// Configuration and extraction failures are fatal: partial metadata is
    /// never a safe basis for downstream caching decisions. Everything else
    /// is scoped to a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Extraction(_))
    }

    /// Whether the error reports a missing record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::AttachmentNotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
