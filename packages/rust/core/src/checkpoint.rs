//! Resumable-run checkpoint persisted as JSON.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use folio_shared::{FolioError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPage {
    pub page: u32,
    pub file: String,
    pub error: String,
}

/// On-disk shape of a checkpoint file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointData {
    #[serde(default)]
    pub processed_pages: Vec<u32>,
    #[serde(default)]
    pub failed_pages: Vec<FailedPage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

/// Tracks processed and failed pages, flushing to disk periodically.
pub struct Checkpoint {
    path: PathBuf,
    save_every: usize,
    processed: BTreeSet<u32>,
    failed: Vec<FailedPage>,
    unsaved: usize,
}

impl Checkpoint {
    /// Open `path`, loading prior progress if the file exists.
    pub fn open(path: impl Into<PathBuf>, save_every: usize) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| FolioError::io(&path, e))?;
            serde_json::from_str::<CheckpointData>(&raw)
                .map_err(|e| FolioError::parse(format!("checkpoint {}: {e}", path.display())))?
        } else {
            CheckpointData::default()
        };

        if !data.processed_pages.is_empty() {
            info!(
                path = %path.display(),
                processed = data.processed_pages.len(),
                failed = data.failed_pages.len(),
                "resuming from checkpoint"
            );
        }

        Ok(Self {
            path,
            save_every: save_every.max(1),
            processed: data.processed_pages.into_iter().collect(),
            failed: data.failed_pages,
            unsaved: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_processed(&self, page_number: u32) -> bool {
        self.processed.contains(&page_number)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Record a success; saves every `save_every` pages.
    pub fn mark_processed(&mut self, page_number: u32) -> Result<()> {
        self.processed.insert(page_number);
        self.failed.retain(|f| f.page != page_number);
        self.unsaved += 1;
        if self.unsaved >= self.save_every {
            self.save()?;
        }
        Ok(())
    }

    /// Record a failure and save immediately.
    pub fn mark_failed(&mut self, page_number: u32, file: &str, error: &str) -> Result<()> {
        self.failed.retain(|f| f.page != page_number);
        self.failed.push(FailedPage {
            page: page_number,
            file: file.to_string(),
            error: error.to_string(),
        });
        self.save()
    }

    pub fn save(&mut self) -> Result<()> {
        let data = CheckpointData {
            processed_pages: self.processed.iter().copied().collect(),
            failed_pages: self.failed.clone(),
            last_update: Some(Utc::now()),
        };
        let json = serde_json::to_string_pretty(&data)
            .map_err(|e| FolioError::parse(format!("checkpoint serialization: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| FolioError::io(parent, e))?;
        }
        // Write-then-rename so a crash never leaves a truncated checkpoint.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| FolioError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| FolioError::io(&self.path, e))?;

        self.unsaved = 0;
        debug!(
            path = %self.path.display(),
            processed = self.processed_count(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Save if anything is pending, logging instead of failing.
    pub fn flush(&mut self) {
        if self.unsaved == 0 {
            return;
        }
        if let Err(e) = self.save() {
            warn!(path = %self.path.display(), error = %e, "failed to save checkpoint");
        }
    }
}
