//! File listing and download against a remote file service.
//!
//! The service exposes two endpoints:
//!
//! - `GET {base}/folders/{folder}/files[?page_token=..]` returning
//!   `{"files": [{"id", "name", "mime_type"?, "size_bytes"?}], "next_page_token"?}`
//! - `GET {base}/files/{id}` returning the raw file bytes
//!
//! Both accept an optional bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use folio_core::stages::{DownloadRequest, Downloaded, Downloader, FileSource};
use folio_shared::{FolioError, Result, SourceFile};

use crate::USER_AGENT;

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Listing pages beyond this are treated as a misbehaving server.
const MAX_LISTING_PAGES: usize = 1000;

fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
        .map_err(|e| FolioError::Network(format!("failed to build HTTP client: {e}")))
}

fn parse_base(base_url: &str) -> Result<Url> {
    let url = Url::parse(base_url)
        .map_err(|e| FolioError::config(format!("invalid source base_url {base_url}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(FolioError::config(format!(
            "source base_url cannot be a base: {base_url}"
        )));
    }
    Ok(url)
}

/// `base` with `segments` appended, each percent-encoded as one segment.
fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

// ---------------------------------------------------------------------------
// HttpFileSource
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListingPage {
    #[serde(default)]
    files: Vec<SourceFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Lists a remote folder, following `next_page_token` until exhausted.
pub struct HttpFileSource {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpFileSource {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base: parse_base(base_url)?,
            token,
        })
    }
}

#[async_trait]
impl FileSource for HttpFileSource {
    #[instrument(skip_all, fields(folder = %folder))]
    async fn list_files(&self, folder: &str, client_ref: &str) -> Result<Vec<SourceFile>> {
        let url = endpoint(&self.base, &["folders", folder, "files"]);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_LISTING_PAGES {
            let mut request = self.client.get(url.clone());
            if !client_ref.is_empty() {
                request = request.query(&[("client", client_ref)]);
            }
            if let Some(token) = &page_token {
                request = request.query(&[("page_token", token.as_str())]);
            }

            let response = authorize(request, self.token.as_deref())
                .send()
                .await
                .map_err(|e| FolioError::Discovery(format!("{folder}: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(FolioError::Discovery(format!("{folder}: HTTP {status}")));
            }

            let page: ListingPage = response
                .json()
                .await
                .map_err(|e| FolioError::Discovery(format!("{folder}: bad listing body: {e}")))?;

            debug!(batch = page.files.len(), "received listing page");
            files.extend(page.files);

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => return Ok(files),
            }
        }

        warn!(pages = MAX_LISTING_PAGES, "listing did not terminate");
        Err(FolioError::Discovery(format!(
            "{folder}: listing exceeded {MAX_LISTING_PAGES} pages"
        )))
    }
}

// ---------------------------------------------------------------------------
// HttpDownloader
// ---------------------------------------------------------------------------

/// Downloads `GET {base}/files/{id}` into the request's temp path.
pub struct HttpDownloader {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpDownloader {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base: parse_base(base_url)?,
            token,
        })
    }
}

/// Map a non-success status to an error whose message classifies correctly.
///
/// Messages name the file rather than the URL, so a port number can never
/// read as a status code. The file name itself is kept out of classification.
fn status_error(name: &str, status: StatusCode) -> FolioError {
    match status.as_u16() {
        429 => FolioError::download(name, "HTTP 429 too many requests"),
        401 => FolioError::download(name, "HTTP 401 unauthorized"),
        403 => FolioError::download(name, "HTTP 403 forbidden"),
        404 => FolioError::download(name, "file not found (HTTP 404)"),
        code if status.is_server_error() => FolioError::Network(format!("{name}: HTTP {code}")),
        code => FolioError::download(name, format!("HTTP {code}")),
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    #[instrument(skip_all, fields(file = %request.file_name))]
    async fn download(&self, request: &DownloadRequest) -> Result<Downloaded> {
        let name = request.file_name.as_str();
        let url = endpoint(&self.base, &["files", &request.file_id]);

        let mut builder = self.client.get(url);
        if !request.client_ref.is_empty() {
            builder = builder.query(&[("client", request.client_ref.as_str())]);
        }
        let response = authorize(builder, self.token.as_deref())
            .send()
            .await
            .map_err(|e| FolioError::Network(format!("{name}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(name, status));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FolioError::Network(format!("{name}: failed to read body: {e}")))?;

        if let Some(parent) = request.dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FolioError::io(parent, e))?;
        }
        tokio::fs::write(&request.dest, &bytes)
            .await
            .map_err(|e| FolioError::io(&request.dest, e))?;

        debug!(size_bytes = bytes.len(), "downloaded file");
        Ok(Downloaded {
            local_path: request.dest.clone(),
            size_bytes: bytes.len() as u64,
        })
    }
}
