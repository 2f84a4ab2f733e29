//! Error types for coldsnap

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for coldsnap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for coldsnap
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (file system operations)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration errors (bad options, missing encryption key,
    /// nonexistent restore target). Always raised before any
    /// destructive action.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Segment store errors (sink/source failures)
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Structural errors in the serialized backup stream
    /// (malformed frame, truncated segment, token out of order)
    #[error("Stream error: {message}")]
    Stream { message: String },

    /// Compression or cipher failures
    #[error("Codec error: {message}")]
    Codec { message: String },

    /// Manifest serialization or versioning errors
    #[error("Manifest error: {message}")]
    Manifest { message: String },

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// File not found
    #[error("File not found: {path}")]
    NotFound { path: PathBuf },
}

impl Error {
    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a stream error
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    /// Create a codec error
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: format!("TOML parse error: {}", err),
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::Codec {
            message: format!("cipher error: {}", err),
        }
    }
}
