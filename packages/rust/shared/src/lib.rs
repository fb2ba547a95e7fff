//! Shared types, error model, and configuration for Folio.
//!
//! This crate is the foundation depended on by all other Folio crates.
//! It provides:
//! - [`FolioError`], the unified error type
//! - Domain types ([`PageFile`], [`SourceFile`], [`ProcessingError`], [`JobId`])
//! - Configuration ([`AppConfig`], [`IngestConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CircuitBreakerConfig, DegradationConfig, IngestConfig, JobDefaults,
    MonitorConfig, OcrConfig, ResourceConfig, RetryConfig, RetryPolicy, SourceConfig,
    StorageConfig, TimeoutConfig, config_dir, config_file_path, expand_home, init_config,
    load_config, load_config_from, ocr_api_key, source_token,
};
pub use error::{FolioError, Result};
pub use types::{
    ErrorCategory, ErrorSeverity, FilenameFormat, JobId, PageFile, ProcessingError, SourceFile,
    UNPARSEABLE_PAGE,
};
