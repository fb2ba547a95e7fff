//! SQL migration definitions for the Folio page database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: book_pages, ingest_jobs",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One transcribed page per (book, page, version, language)
CREATE TABLE IF NOT EXISTS book_pages (
    id             TEXT PRIMARY KEY,
    client_user_id TEXT NOT NULL,
    book_key       TEXT NOT NULL,
    page_number    INTEGER NOT NULL,
    file_name      TEXT NOT NULL,
    language_code  TEXT NOT NULL,
    version        TEXT NOT NULL DEFAULT 'original',
    page_text      TEXT NOT NULL,
    text_hash      TEXT NOT NULL,
    ocr_metadata   TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    UNIQUE(book_key, page_number, version, language_code)
);

CREATE INDEX IF NOT EXISTS idx_book_pages_book ON book_pages(book_key);
CREATE INDEX IF NOT EXISTS idx_book_pages_client ON book_pages(client_user_id);

-- Ingestion run history
CREATE TABLE IF NOT EXISTS ingest_jobs (
    id             TEXT PRIMARY KEY,
    client_user_id TEXT NOT NULL,
    book_key       TEXT NOT NULL,
    folder         TEXT NOT NULL,
    status         TEXT NOT NULL,
    started_at     TEXT NOT NULL,
    finished_at    TEXT,
    report_json    TEXT
);

CREATE INDEX IF NOT EXISTS idx_ingest_jobs_book ON ingest_jobs(book_key);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Full-text search over page text",
            sql: r#"
CREATE VIRTUAL TABLE IF NOT EXISTS book_pages_fts USING fts5(
    page_text,
    content=book_pages,
    content_rowid=rowid
);

CREATE TRIGGER IF NOT EXISTS book_pages_fts_insert AFTER INSERT ON book_pages BEGIN
    INSERT INTO book_pages_fts(rowid, page_text) VALUES (new.rowid, new.page_text);
END;

CREATE TRIGGER IF NOT EXISTS book_pages_fts_delete AFTER DELETE ON book_pages BEGIN
    INSERT INTO book_pages_fts(book_pages_fts, rowid, page_text)
    VALUES ('delete', old.rowid, old.page_text);
END;

CREATE TRIGGER IF NOT EXISTS book_pages_fts_update AFTER UPDATE ON book_pages BEGIN
    INSERT INTO book_pages_fts(book_pages_fts, rowid, page_text)
    VALUES ('delete', old.rowid, old.page_text);
    INSERT INTO book_pages_fts(rowid, page_text) VALUES (new.rowid, new.page_text);
END;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
