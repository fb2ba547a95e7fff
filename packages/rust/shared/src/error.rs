//! Error types for Folio.
//!
//! Library crates use [`FolioError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Folio operations.
///
/// The rendered message of each variant starts with a short prefix
/// ("network error:", "database error:", ...). The error classifier in
/// `folio-core` matches keywords against that rendered text, so the prefix
/// doubles as the error's kind name for categorization.
#[derive(Debug, thiserror::Error)]
pub enum FolioError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to a remote collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed payload (JSON body, checkpoint file, OCR response).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Persistence layer error.
    #[error("database error: {0}")]
    Database(String),

    /// OCR / vision model error.
    #[error("ocr error: {0}")]
    Ocr(String),

    /// File transfer error raised by a download adapter.
    #[error("download error: {file}: {message}")]
    Download { file: String, message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (invalid input, missing field, bad format).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A pipeline stage exceeded its time limit.
    #[error("{stage} stage timed out after {secs}s")]
    Timeout { stage: String, secs: u64 },

    /// The file listing could not be produced.
    #[error("discovery error: {0}")]
    Discovery(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, FolioError>;

impl FolioError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a download error for the named file.
    pub fn download(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Download {
            file: file.into(),
            message: message.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a timeout error for the named stage.
    pub fn timeout(stage: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            stage: stage.into(),
            secs,
        }
    }

    /// Variant name, recorded as the error kind on processing errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "ConfigError",
            Self::Network(_) => "NetworkError",
            Self::Parse { .. } => "ParseError",
            Self::Database(_) => "DatabaseError",
            Self::Ocr(_) => "OcrError",
            Self::Download { .. } => "DownloadError",
            Self::Io { .. } => "IoError",
            Self::Validation { .. } => "ValidationError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Discovery(_) => "DiscoveryError",
        }
    }
}
