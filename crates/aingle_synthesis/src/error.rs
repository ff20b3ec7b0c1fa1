//! Error types for the AIngle synthesis engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A specialized `Result` type for synthesis operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Defines the errors that can occur while importing sources and synthesizing them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// No registered adapter, including the generic fallback, accepts the payload.
    #[error("Unrecognized format for source '{source_id}'")]
    UnrecognizedFormat { source_id: String },

    /// A format tag was declared or requested that no adapter is registered for.
    #[error("Unknown format tag: {0}")]
    UnknownFormat(String),

    /// An adapter rejected a payload during validation.
    #[error("Malformed source '{source_id}' at {field_path}: {reason}")]
    MalformedSource {
        source_id: String,
        field_path: String,
        reason: String,
    },

    /// The run configuration is invalid or incomplete for the data being synthesized.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A System Model provider failed to supply the model or accept proposals.
    #[error("System model provider error: {0}")]
    Provider(String),

    /// An error occurred during data serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Shorthand for a [`Error::MalformedSource`].
    pub fn malformed(
        source_id: impl Into<String>,
        field_path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::MalformedSource {
            source_id: source_id.into(),
            field_path: field_path.into(),
            reason: reason.into(),
        }
    }

    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnrecognizedFormat { .. } => ErrorKind::UnrecognizedFormat,
            Error::UnknownFormat(_) => ErrorKind::UnknownFormat,
            Error::MalformedSource { .. } => ErrorKind::MalformedSource,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Provider(_) => ErrorKind::Provider,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Returns the offending field path for malformed sources.
    pub fn field_path(&self) -> Option<&str> {
        match self {
            Error::MalformedSource { field_path, .. } => Some(field_path),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// The category of an [`Error`], recorded alongside skipped sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnrecognizedFormat,
    UnknownFormat,
    MalformedSource,
    Configuration,
    Provider,
    Serialization,
}
