//! Concrete stage collaborators for the ingestion pipeline.
//!
//! Local folders and a simple HTTP file service for listing and download,
//! an OpenAI-compatible vision endpoint for OCR, and the libSQL store for
//! persistence.

mod http;
mod local;
mod store;
mod vision;

use std::path::Path;

pub use http::{HttpDownloader, HttpFileSource};
pub use local::{LocalDownloader, LocalFolderSource};
pub use store::LibsqlPageStore;
pub use vision::{PassResult, VisionOcr, parse_pass_response};

/// User-Agent string for outbound requests.
const USER_AGENT: &str = concat!("Folio/", env!("CARGO_PKG_VERSION"));

/// Used when the extension maps to no known type.
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// MIME type guessed from a file extension, for listings and data URLs.
pub fn mime_for_path(path: &Path) -> &'static str {
    mime_guess::from_path(path).first_raw().unwrap_or(DEFAULT_MIME)
}
