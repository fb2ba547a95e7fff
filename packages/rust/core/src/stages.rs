//! Stage collaborator interfaces: file listing, download, OCR, persistence.
//!
//! Adapters signal failure by returning `Err`, never by an `Ok` carrying a
//! failure flag, so the retry wrapper sees every failure the same way.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use folio_shared::{FolioError, Result, SourceFile};

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Lists candidate page files in a folder.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn list_files(&self, folder: &str, client_ref: &str) -> Result<Vec<SourceFile>>;
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub file_id: String,
    pub file_name: String,
    pub client_ref: String,
    /// Tracked temp path the file should be written to.
    pub dest: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Downloaded {
    pub local_path: PathBuf,
    pub size_bytes: u64,
}

/// Fetches one file to a local path the OCR stage can open.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, request: &DownloadRequest) -> Result<Downloaded>;
}

// ---------------------------------------------------------------------------
// OCR
// ---------------------------------------------------------------------------

/// Word counts reported by the OCR engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_words: Option<u64>,
    #[serde(default)]
    pub normal_transcription: u64,
    #[serde(default)]
    pub context_logic_transcription: u64,
    #[serde(default)]
    pub unable_to_transcribe: u64,
}

/// Transcription of one page image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub transcription: String,
    #[serde(default)]
    pub unclear_sections: Vec<String>,
    /// Engine's own quality estimate, if it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_stats: Option<ProcessingStats>,
    /// Internal passes the engine ran.
    #[serde(default)]
    pub passes: u32,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Turns a page image into text. Internal passes are opaque to the caller.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn transcribe(&self, image_path: &Path) -> Result<OcrOutput>;
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StoreRequest {
    pub client_ref: String,
    pub book_key: String,
    pub page_number: u32,
    pub file_name: String,
    pub language_code: String,
    pub page_text: String,
    pub ocr_metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPage {
    pub id: String,
}

/// Persists one transcribed page.
#[async_trait]
pub trait PageStore: Send + Sync {
    async fn store(&self, request: &StoreRequest) -> Result<StoredPage>;
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

/// Run `fut` with a hard limit; expiry becomes [`FolioError::Timeout`].
pub async fn with_timeout<T, F>(stage: &str, secs: u64, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_secs(secs), fut).await {
        Ok(result) => result,
        Err(_) => Err(FolioError::timeout(stage, secs)),
    }
}
