//! Page persistence backed by `folio-storage`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use folio_core::ManagedConnection;
use folio_core::stages::{PageStore, StoreRequest, StoredPage};
use folio_shared::Result;
use folio_storage::{NewBookPage, Storage};

/// Writes pages into the `book_pages` table. Also registered with the
/// resource manager so the run closes the database on exit.
#[derive(Clone)]
pub struct LibsqlPageStore {
    storage: Arc<Storage>,
}

impl LibsqlPageStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

#[async_trait]
impl PageStore for LibsqlPageStore {
    #[instrument(skip_all, fields(book = %request.book_key, page = request.page_number))]
    async fn store(&self, request: &StoreRequest) -> Result<StoredPage> {
        let id = self
            .storage
            .upsert_book_page(&NewBookPage {
                client_user_id: &request.client_ref,
                book_key: &request.book_key,
                page_number: request.page_number,
                file_name: &request.file_name,
                language_code: &request.language_code,
                page_text: &request.page_text,
                ocr_metadata: &request.ocr_metadata,
            })
            .await?;
        debug!(%id, "page stored");
        Ok(StoredPage { id })
    }
}

impl ManagedConnection for LibsqlPageStore {
    fn close(&self) -> Result<()> {
        self.storage.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_shared::FolioError;

    async fn store() -> (LibsqlPageStore, std::path::PathBuf) {
        let path =
            std::env::temp_dir().join(format!("folio-store-test-{}.db", uuid::Uuid::now_v7()));
        let storage = Storage::open(&path).await.unwrap();
        (LibsqlPageStore::new(Arc::new(storage)), path)
    }

    fn request(page: u32, text: &str) -> StoreRequest {
        StoreRequest {
            client_ref: "client-1".into(),
            book_key: "baron".into(),
            page_number: page,
            file_name: format!("baron_{page:03}.jpg"),
            language_code: "es".into(),
            page_text: text.into(),
            ocr_metadata: serde_json::json!({"passes": 1}),
        }
    }

    #[tokio::test]
    async fn stores_and_reprocesses_in_place() {
        let (store, path) = store().await;

        let first = store.store(&request(1, "primera versión")).await.unwrap();
        let second = store.store(&request(1, "segunda versión")).await.unwrap();
        assert_eq!(first.id, second.id);

        let page = store
            .storage()
            .get_book_page("baron", 1, "es")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(page.page_text, "segunda versión");

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn closing_rejects_later_writes() {
        let (store, path) = store().await;
        ManagedConnection::close(&store).unwrap();

        let err = store.store(&request(2, "texto")).await.unwrap_err();
        assert!(matches!(err, FolioError::Database(_)));

        let _ = std::fs::remove_file(path);
    }
}
