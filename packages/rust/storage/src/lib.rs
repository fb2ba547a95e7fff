//! Turso Embedded / libSQL storage for transcribed book pages.
//!
//! The [`Storage`] struct wraps a libSQL database holding one row per
//! transcribed page, the history of ingestion runs, and a full-text index
//! over page text.
//!
//! **Access rules:**
//! - Ingestion: read-write via [`Storage::open`]
//! - Reporting/inspection: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use folio_shared::{FolioError, Result};
use libsql::{Connection, Database, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Version label for untouched OCR output.
pub const ORIGINAL_VERSION: &str = "original";

fn db_err(e: libsql::Error) -> FolioError {
    FolioError::Database(e.to_string())
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    closed: AtomicBool,
}

/// A page to insert or replace.
#[derive(Debug, Clone)]
pub struct NewBookPage<'a> {
    pub client_user_id: &'a str,
    pub book_key: &'a str,
    pub page_number: u32,
    pub file_name: &'a str,
    pub language_code: &'a str,
    pub page_text: &'a str,
    pub ocr_metadata: &'a serde_json::Value,
}

/// A stored page row.
#[derive(Debug, Clone, Serialize)]
pub struct BookPage {
    pub id: String,
    pub client_user_id: String,
    pub book_key: String,
    pub page_number: u32,
    pub file_name: String,
    pub language_code: String,
    pub version: String,
    pub page_text: String,
    /// SHA-256 of `page_text`, hex encoded.
    pub text_hash: String,
    pub ocr_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row of ingestion run history.
#[derive(Debug, Clone, Serialize)]
pub struct IngestJobRecord {
    pub id: String,
    pub client_user_id: String,
    pub book_key: String,
    pub folder: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub report_json: Option<String>,
}

/// A search result from FTS5.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub page_number: u32,
    pub file_name: String,
    /// FTS5 rank score (lower is better).
    pub score: f64,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FolioError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            closed: AtomicBool::new(false),
        };
        storage.run_migrations().await?;
        tracing::debug!(path = %path.display(), "page database opened");
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            closed: AtomicBool::new(false),
        })
    }

    /// Mark the handle closed; later calls fail. The connection itself is
    /// released when the handle is dropped.
    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("page database closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        FolioError::Database(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(FolioError::Database("database connection is closed".into()));
        }
        Ok(())
    }

    /// Ensure we're open and in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.readonly {
            return Err(FolioError::Database(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Page operations
    // -----------------------------------------------------------------------

    /// Insert a page, or replace the text and metadata of the existing row
    /// for the same book, page, version, and language. Returns the row ID.
    pub async fn upsert_book_page(&self, page: &NewBookPage<'_>) -> Result<String> {
        self.check_writable()?;
        if page.page_text.trim().is_empty() {
            return Err(FolioError::validation("page_text is required"));
        }

        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let metadata = serde_json::to_string(page.ocr_metadata)
            .map_err(|e| FolioError::parse(format!("ocr_metadata: {e}")))?;

        let mut rows = self
            .conn
            .query(
                "INSERT INTO book_pages (id, client_user_id, book_key, page_number, file_name,
                    language_code, version, page_text, text_hash, ocr_metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(book_key, page_number, version, language_code) DO UPDATE SET
                   client_user_id = excluded.client_user_id,
                   file_name = excluded.file_name,
                   page_text = excluded.page_text,
                   text_hash = excluded.text_hash,
                   ocr_metadata = excluded.ocr_metadata,
                   updated_at = excluded.updated_at
                 RETURNING id",
                params![
                    id.as_str(),
                    page.client_user_id,
                    page.book_key,
                    page.page_number,
                    page.file_name,
                    page.language_code,
                    ORIGINAL_VERSION,
                    page.page_text,
                    text_hash(page.page_text),
                    metadata,
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => row.get::<String>(0).map_err(db_err),
            None => Err(FolioError::Database("upsert returned no row".into())),
        }
    }

    /// Get the original-version page for a book, page number, and language.
    pub async fn get_book_page(
        &self,
        book_key: &str,
        page_number: u32,
        language_code: &str,
    ) -> Result<Option<BookPage>> {
        self.check_open()?;
        let mut rows = self
            .conn
            .query(
                "SELECT id, client_user_id, book_key, page_number, file_name, language_code,
                        version, page_text, text_hash, ocr_metadata, created_at, updated_at
                 FROM book_pages
                 WHERE book_key = ?1 AND page_number = ?2 AND language_code = ?3 AND version = ?4",
                params![book_key, page_number, language_code, ORIGINAL_VERSION],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_book_page(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List all pages of a book in page order.
    pub async fn list_book_pages(&self, book_key: &str) -> Result<Vec<BookPage>> {
        self.check_open()?;
        let mut rows = self
            .conn
            .query(
                "SELECT id, client_user_id, book_key, page_number, file_name, language_code,
                        version, page_text, text_hash, ocr_metadata, created_at, updated_at
                 FROM book_pages WHERE book_key = ?1 ORDER BY page_number, language_code",
                params![book_key],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_book_page(&row)?);
        }
        Ok(results)
    }

    /// Delete every page of a book. Returns the number of rows removed.
    pub async fn delete_book(&self, book_key: &str) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM book_pages WHERE book_key = ?1", params![book_key])
            .await
            .map_err(db_err)
    }

    // -----------------------------------------------------------------------
    // Ingest job operations
    // -----------------------------------------------------------------------

    /// Record the start of an ingestion run.
    pub async fn insert_ingest_job(
        &self,
        job_id: &str,
        client_user_id: &str,
        book_key: &str,
        folder: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO ingest_jobs (id, client_user_id, book_key, folder, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
                params![job_id, client_user_id, book_key, folder, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record the outcome of an ingestion run.
    pub async fn finish_ingest_job(&self, job_id: &str, status: &str, report_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE ingest_jobs SET status = ?1, finished_at = ?2, report_json = ?3 WHERE id = ?4",
                params![status, now.as_str(), report_json, job_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_ingest_job(&self, job_id: &str) -> Result<Option<IngestJobRecord>> {
        self.check_open()?;
        let mut rows = self
            .conn
            .query(
                "SELECT id, client_user_id, book_key, folder, status, started_at, finished_at, report_json
                 FROM ingest_jobs WHERE id = ?1",
                params![job_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(IngestJobRecord {
                id: row.get::<String>(0).map_err(db_err)?,
                client_user_id: row.get::<String>(1).map_err(db_err)?,
                book_key: row.get::<String>(2).map_err(db_err)?,
                folder: row.get::<String>(3).map_err(db_err)?,
                status: row.get::<String>(4).map_err(db_err)?,
                started_at: row.get::<String>(5).map_err(db_err)?,
                finished_at: row.get::<String>(6).ok(),
                report_json: row.get::<String>(7).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // FTS search
    // -----------------------------------------------------------------------

    /// Full-text search across the pages of a book.
    pub async fn search(&self, book_key: &str, query: &str, limit: u32) -> Result<Vec<SearchResult>> {
        self.check_open()?;
        let mut rows = self
            .conn
            .query(
                "SELECT p.page_number, p.file_name, rank
                 FROM book_pages_fts fts
                 JOIN book_pages p ON p.rowid = fts.rowid
                 WHERE book_pages_fts MATCH ?1 AND p.book_key = ?2
                 ORDER BY rank
                 LIMIT ?3",
                params![query, book_key, limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(SearchResult {
                page_number: row.get::<u32>(0).map_err(db_err)?,
                file_name: row.get::<String>(1).map_err(db_err)?,
                score: row.get::<f64>(2).unwrap_or(0.0),
            });
        }
        Ok(results)
    }
}

/// SHA-256 of page text, hex encoded.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FolioError::Database(format!("invalid date: {e}")))
}

/// Convert a database row to a [`BookPage`].
fn row_to_book_page(row: &libsql::Row) -> Result<BookPage> {
    let metadata: Option<String> = row.get::<String>(9).ok();
    Ok(BookPage {
        id: row.get::<String>(0).map_err(db_err)?,
        client_user_id: row.get::<String>(1).map_err(db_err)?,
        book_key: row.get::<String>(2).map_err(db_err)?,
        page_number: row.get::<u32>(3).map_err(db_err)?,
        file_name: row.get::<String>(4).map_err(db_err)?,
        language_code: row.get::<String>(5).map_err(db_err)?,
        version: row.get::<String>(6).map_err(db_err)?,
        page_text: row.get::<String>(7).map_err(db_err)?,
        text_hash: row.get::<String>(8).map_err(db_err)?,
        ocr_metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: parse_timestamp(&row.get::<String>(10).map_err(db_err)?)?,
        updated_at: parse_timestamp(&row.get::<String>(11).map_err(db_err)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("folio_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn page<'a>(number: u32, text: &'a str, metadata: &'a serde_json::Value) -> NewBookPage<'a> {
        NewBookPage {
            client_user_id: "client-1",
            book_key: "baron-book",
            page_number: number,
            file_name: "baron001.png",
            language_code: "es",
            page_text: text,
            ocr_metadata: metadata,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("folio_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn page_upsert_replaces_text_and_keeps_id() {
        let storage = test_storage().await;
        let meta = serde_json::json!({"ocr_passes": 3, "quality_score": 0.92});

        let first = storage
            .upsert_book_page(&page(1, "primera version", &meta))
            .await
            .expect("insert");
        let second = storage
            .upsert_book_page(&page(1, "segunda version", &meta))
            .await
            .expect("upsert");
        assert_eq!(first, second);

        let found = storage
            .get_book_page("baron-book", 1, "es")
            .await
            .expect("get")
            .expect("row");
        assert_eq!(found.page_text, "segunda version");
        assert_eq!(found.version, ORIGINAL_VERSION);
        assert_eq!(found.text_hash, text_hash("segunda version"));
        assert_eq!(found.text_hash.len(), 64);
        assert_eq!(found.ocr_metadata, Some(meta));
    }

    #[tokio::test]
    async fn pages_list_in_order() {
        let storage = test_storage().await;
        let meta = serde_json::json!({});
        for n in [3, 1, 2] {
            storage
                .upsert_book_page(&page(n, "texto", &meta))
                .await
                .expect("insert");
        }
        let pages = storage.list_book_pages("baron-book").await.expect("list");
        let numbers: Vec<u32> = pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        assert_eq!(storage.delete_book("baron-book").await.expect("delete"), 3);
        assert!(storage.list_book_pages("baron-book").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let storage = test_storage().await;
        let meta = serde_json::json!({});
        let err = storage
            .upsert_book_page(&page(1, "   ", &meta))
            .await
            .expect_err("should reject");
        assert!(matches!(err, FolioError::Validation { .. }));
    }

    #[tokio::test]
    async fn ingest_job_lifecycle() {
        let storage = test_storage().await;
        let job_id = Uuid::now_v7().to_string();
        storage
            .insert_ingest_job(&job_id, "client-1", "baron-book", "/scans/baron")
            .await
            .expect("insert job");

        let job = storage.get_ingest_job(&job_id).await.expect("get").expect("row");
        assert_eq!(job.status, "running");
        assert!(job.finished_at.is_none());

        storage
            .finish_ingest_job(&job_id, "completed", r#"{"failed": 0}"#)
            .await
            .expect("finish job");
        let job = storage.get_ingest_job(&job_id).await.expect("get").expect("row");
        assert_eq!(job.status, "completed");
        assert!(job.finished_at.is_some());
        assert_eq!(job.report_json.as_deref(), Some(r#"{"failed": 0}"#));
    }

    #[tokio::test]
    async fn fts_search() {
        let storage = test_storage().await;
        let meta = serde_json::json!({});
        storage
            .upsert_book_page(&page(1, "el baron llego a Medellin", &meta))
            .await
            .expect("insert");
        storage
            .upsert_book_page(&page(2, "la cosecha de cafe fue buena", &meta))
            .await
            .expect("insert");

        let results = storage.search("baron-book", "cafe", 10).await.expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].page_number, 2);
    }

    #[tokio::test]
    async fn closed_handle_rejects_calls() {
        let storage = test_storage().await;
        storage.close().expect("close");
        storage.close().expect("close twice");
        assert!(storage.is_closed());

        let meta = serde_json::json!({});
        let err = storage
            .upsert_book_page(&page(1, "texto", &meta))
            .await
            .expect_err("closed");
        assert!(err.to_string().contains("closed"));
        assert!(storage.list_book_pages("baron-book").await.is_err());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("folio_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.expect("open rw");
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.expect("open ro");
        let meta = serde_json::json!({});
        let result = ro.upsert_book_page(&page(1, "texto", &meta)).await;
        assert!(result.is_err());
    }
}
