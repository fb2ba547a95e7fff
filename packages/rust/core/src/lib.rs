//! Page-ingestion pipeline for Folio.
//!
//! Turns a folder of scanned page images into stored, OCR-transcribed pages:
//! filenames are parsed into page numbers, pages are processed one at a
//! time through download → OCR → store, and every run ends with a report.
//!
//! Stage collaborators are traits in [`stages`]; concrete adapters live in
//! `folio-adapters`.

pub mod checkpoint;
pub mod degradation;
pub mod error_handler;
pub mod filename;
pub mod monitor;
pub mod pipeline;
pub mod resources;
pub mod stages;

pub use error_handler::{ErrorContext, ErrorHandler, RetryFailure};
pub use filename::{FilenameParser, SequenceIssue, validate_sequence};
pub use pipeline::{IngestReport, Orchestrator, ProgressReporter, RunStatus, SilentProgress, Stages};
pub use resources::{ManagedConnection, ResourceManager};
