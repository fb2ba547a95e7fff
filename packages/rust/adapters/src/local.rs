//! Local-filesystem file source and downloader.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};

use folio_core::stages::{DownloadRequest, Downloaded, Downloader, FileSource};
use folio_shared::{FolioError, Result, SourceFile};

use crate::mime_for_path;

// ---------------------------------------------------------------------------
// LocalFolderSource
// ---------------------------------------------------------------------------

/// Lists regular files directly inside a directory. The folder reference is
/// a path; file ids are absolute paths.
#[derive(Debug, Clone, Default)]
pub struct LocalFolderSource;

#[async_trait]
impl FileSource for LocalFolderSource {
    #[instrument(skip_all, fields(folder = %folder))]
    async fn list_files(&self, folder: &str, _client_ref: &str) -> Result<Vec<SourceFile>> {
        let dir = PathBuf::from(folder);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| FolioError::Discovery(format!("{}: {e}", dir.display())))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FolioError::Discovery(format!("{}: {e}", dir.display())))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| FolioError::io(entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }

            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let mut file = SourceFile::new(path.to_string_lossy(), name);
            file.mime_type = Some(mime_for_path(&path).to_string());
            file.size_bytes = Some(meta.len());
            files.push(file);
        }

        // Directory order is platform-dependent.
        files.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = files.len(), "listed local folder");
        Ok(files)
    }
}

// ---------------------------------------------------------------------------
// LocalDownloader
// ---------------------------------------------------------------------------

/// "Downloads" by copying the file at `file_id` to the tracked temp path.
#[derive(Debug, Clone, Default)]
pub struct LocalDownloader;

#[async_trait]
impl Downloader for LocalDownloader {
    #[instrument(skip_all, fields(file = %request.file_name))]
    async fn download(&self, request: &DownloadRequest) -> Result<Downloaded> {
        let source = Path::new(&request.file_id);
        if let Some(parent) = request.dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FolioError::io(parent, e))?;
        }

        let size_bytes = tokio::fs::copy(source, &request.dest)
            .await
            .map_err(|e| FolioError::io(source, e))?;

        debug!(size_bytes, dest = %request.dest.display(), "copied local file");
        Ok(Downloaded {
            local_path: request.dest.clone(),
            size_bytes,
        })
    }
}
