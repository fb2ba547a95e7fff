//! Application configuration for Folio.
//!
//! User config lives at `~/.folio/folio.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{FolioError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "folio.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".folio";

// ---------------------------------------------------------------------------
// Config structs (matching folio.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Per-job defaults.
    #[serde(default)]
    pub job: JobDefaults,

    /// OCR quality thresholds.
    #[serde(default)]
    pub degradation: DegradationConfig,

    /// Retry budgets per error category.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Hard limits per stage.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Early-stop heuristics.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Temp files, caches, and large-file accounting.
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Performance accounting.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Where page files come from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Vision OCR endpoint.
    #[serde(default)]
    pub ocr: OcrConfig,

    /// Page database.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[job]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    /// Language code stored with each page.
    #[serde(default = "default_language_code")]
    pub language_code: String,

    /// Word that introduces grouped file names (`baron001 3.png`).
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,

    /// Pages per group in grouped file names.
    #[serde(default = "default_group_size")]
    pub group_size: u32,

    /// Largest gap between consecutive page numbers before it is reported.
    #[serde(default = "default_max_gap")]
    pub max_gap: u32,

    /// Only process the first N sorted pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_limit: Option<usize>,

    /// Extensions (lowercase, with dot) treated as page images.
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Save the checkpoint after every N processed pages.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            language_code: default_language_code(),
            group_prefix: default_group_prefix(),
            group_size: default_group_size(),
            max_gap: default_max_gap(),
            page_limit: None,
            image_extensions: default_image_extensions(),
            checkpoint_every: default_checkpoint_every(),
        }
    }
}

fn default_language_code() -> String {
    "es".into()
}
fn default_group_prefix() -> String {
    "baron".into()
}
fn default_group_size() -> u32 {
    25
}
fn default_max_gap() -> u32 {
    5
}
fn default_image_extensions() -> Vec<String> {
    [".png", ".jpg", ".jpeg", ".webp", ".gif", ".bmp", ".tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_checkpoint_every() -> usize {
    10
}

/// `[degradation]` section: score boundaries for OCR quality levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    #[serde(default = "default_very_poor")]
    pub very_poor_below: f64,
    #[serde(default = "default_poor")]
    pub poor_below: f64,
    #[serde(default = "default_moderate")]
    pub moderate_below: f64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            very_poor_below: default_very_poor(),
            poor_below: default_poor(),
            moderate_below: default_moderate(),
        }
    }
}

fn default_very_poor() -> f64 {
    0.3
}
fn default_poor() -> f64 {
    0.6
}
fn default_moderate() -> f64 {
    0.8
}

/// Backoff policy for one error category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub backoff_multiplier: f64,
    pub max_delay_secs: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: f64, multiplier: f64, max: f64) -> Self {
        Self {
            max_retries,
            base_delay_secs: base,
            backoff_multiplier: multiplier,
            max_delay_secs: max,
            jitter: true,
        }
    }

    /// Same budget with no waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_secs: 0.0,
            backoff_multiplier: 1.0,
            max_delay_secs: 0.0,
            jitter: false,
        }
    }
}

/// A `[retry.<category>]` table as written. Missing keys keep the
/// category's own default rather than one shared fallback.
#[derive(Deserialize)]
struct PartialRetryPolicy {
    max_retries: Option<u32>,
    base_delay_secs: Option<f64>,
    backoff_multiplier: Option<f64>,
    max_delay_secs: Option<f64>,
    jitter: Option<bool>,
}

impl PartialRetryPolicy {
    fn over(self, base: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            base_delay_secs: self.base_delay_secs.unwrap_or(base.base_delay_secs),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(base.backoff_multiplier),
            max_delay_secs: self.max_delay_secs.unwrap_or(base.max_delay_secs),
            jitter: self.jitter.unwrap_or(base.jitter),
        }
    }
}

fn overlay_retry<'de, D: Deserializer<'de>>(
    deserializer: D,
    base: fn() -> RetryPolicy,
) -> std::result::Result<RetryPolicy, D::Error> {
    PartialRetryPolicy::deserialize(deserializer).map(|partial| partial.over(base()))
}

/// `[retry.*]` tables. Categories without an entry are never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_network_retry", deserialize_with = "network_retry")]
    pub network: RetryPolicy,
    #[serde(
        default = "default_rate_limit_retry",
        deserialize_with = "rate_limit_retry"
    )]
    pub rate_limit: RetryPolicy,
    #[serde(
        default = "default_storage_service_retry",
        deserialize_with = "storage_service_retry"
    )]
    pub storage_service: RetryPolicy,
    #[serde(
        default = "default_persistence_retry",
        deserialize_with = "persistence_retry"
    )]
    pub persistence: RetryPolicy,
    #[serde(default = "default_ocr_retry", deserialize_with = "ocr_retry")]
    pub ocr: RetryPolicy,
    #[serde(default = "default_timeout_retry", deserialize_with = "timeout_retry")]
    pub timeout: RetryPolicy,
}

fn network_retry<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<RetryPolicy, D::Error> {
    overlay_retry(d, default_network_retry)
}
fn rate_limit_retry<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<RetryPolicy, D::Error> {
    overlay_retry(d, default_rate_limit_retry)
}
fn storage_service_retry<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<RetryPolicy, D::Error> {
    overlay_retry(d, default_storage_service_retry)
}
fn persistence_retry<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<RetryPolicy, D::Error> {
    overlay_retry(d, default_persistence_retry)
}
fn ocr_retry<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<RetryPolicy, D::Error> {
    overlay_retry(d, default_ocr_retry)
}
fn timeout_retry<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<RetryPolicy, D::Error> {
    overlay_retry(d, default_timeout_retry)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            network: default_network_retry(),
            rate_limit: default_rate_limit_retry(),
            storage_service: default_storage_service_retry(),
            persistence: default_persistence_retry(),
            ocr: default_ocr_retry(),
            timeout: default_timeout_retry(),
        }
    }
}

impl RetryConfig {
    /// Every category retried `max_retries` times without sleeping.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            network: RetryPolicy::immediate(max_retries),
            rate_limit: RetryPolicy::immediate(max_retries),
            storage_service: RetryPolicy::immediate(max_retries),
            persistence: RetryPolicy::immediate(max_retries),
            ocr: RetryPolicy::immediate(max_retries),
            timeout: RetryPolicy::immediate(max_retries),
        }
    }
}

fn default_network_retry() -> RetryPolicy {
    RetryPolicy::new(3, 2.0, 2.0, 30.0)
}
fn default_rate_limit_retry() -> RetryPolicy {
    RetryPolicy::new(5, 5.0, 2.0, 120.0)
}
fn default_storage_service_retry() -> RetryPolicy {
    RetryPolicy::new(3, 1.0, 2.0, 15.0)
}
fn default_persistence_retry() -> RetryPolicy {
    RetryPolicy::new(3, 1.0, 2.0, 10.0)
}
fn default_ocr_retry() -> RetryPolicy {
    RetryPolicy::new(2, 3.0, 1.5, 20.0)
}
fn default_timeout_retry() -> RetryPolicy {
    RetryPolicy::new(1, 2.0, 2.0, 10.0)
}

/// `[timeouts]` section, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_download_secs")]
    pub download_secs: u64,
    #[serde(default = "default_ocr_secs")]
    pub ocr_secs: u64,
    #[serde(default = "default_store_secs")]
    pub store_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            download_secs: default_download_secs(),
            ocr_secs: default_ocr_secs(),
            store_secs: default_store_secs(),
        }
    }
}

fn default_download_secs() -> u64 {
    120
}
fn default_ocr_secs() -> u64 {
    300
}
fn default_store_secs() -> u64 {
    60
}

/// `[circuit_breaker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Whether the orchestrator honors the stop signal.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How many preceding page attempts count as "recent".
    #[serde(default = "default_window")]
    pub window: u32,
    /// Stop once this many critical errors are recent.
    #[serde(default = "default_max_critical")]
    pub max_critical: usize,
    /// Stop once this many errors are recent...
    #[serde(default = "default_max_recent_errors")]
    pub max_recent_errors: usize,
    /// ...but only after this many pages.
    #[serde(default = "default_min_pages")]
    pub min_pages: usize,
    /// Stop once this many recent errors are all non-recoverable.
    #[serde(default = "default_max_unrecoverable")]
    pub max_unrecoverable: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: default_window(),
            max_critical: default_max_critical(),
            max_recent_errors: default_max_recent_errors(),
            min_pages: default_min_pages(),
            max_unrecoverable: default_max_unrecoverable(),
        }
    }
}

fn default_window() -> u32 {
    5
}
fn default_max_critical() -> usize {
    3
}
fn default_max_recent_errors() -> usize {
    4
}
fn default_min_pages() -> usize {
    5
}
fn default_max_unrecoverable() -> usize {
    3
}

/// `[resources]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Parent of per-job temp directories (system temp dir when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_root: Option<PathBuf>,
    #[serde(default = "default_credential_ttl")]
    pub credential_ttl_secs: u64,
    #[serde(default = "default_large_file_mb")]
    pub large_file_threshold_mb: u64,
    #[serde(default = "default_max_temp_space_mb")]
    pub max_temp_space_mb: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            temp_root: None,
            credential_ttl_secs: default_credential_ttl(),
            large_file_threshold_mb: default_large_file_mb(),
            max_temp_space_mb: default_max_temp_space_mb(),
        }
    }
}

fn default_credential_ttl() -> u64 {
    3600
}
fn default_large_file_mb() -> u64 {
    10
}
fn default_max_temp_space_mb() -> u64 {
    1000
}

/// `[monitor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Coordination calls allowed per page before it is flagged.
    #[serde(default = "default_max_llm_calls")]
    pub max_llm_calls_per_page: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_llm_calls_per_page: default_max_llm_calls(),
        }
    }
}

fn default_max_llm_calls() -> u32 {
    4
}

/// `[source]` section. Without a `base_url`, folders are local directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of a file service exposing `/folders/{folder}/files` and
    /// `/files/{id}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Name of the env var holding an optional bearer token.
    #[serde(default = "default_source_token_env")]
    pub token_env: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token_env: default_source_token_env(),
        }
    }
}

fn default_source_token_env() -> String {
    "FOLIO_SOURCE_TOKEN".into()
}

/// `[ocr]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_ocr_endpoint")]
    pub endpoint: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Vision model name.
    #[serde(default = "default_ocr_model")]
    pub model: String,

    /// Transcription passes per page.
    #[serde(default = "default_ocr_passes")]
    pub passes: u32,

    /// Response token cap per pass.
    #[serde(default = "default_ocr_max_tokens")]
    pub max_tokens: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ocr_endpoint(),
            api_key_env: default_api_key_env(),
            model: default_ocr_model(),
            passes: default_ocr_passes(),
            max_tokens: default_ocr_max_tokens(),
        }
    }
}

fn default_ocr_endpoint() -> String {
    "https://api.openai.com/v1".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_ocr_model() -> String {
    "gpt-4o".into()
}
fn default_ocr_passes() -> u32 {
    3
}
fn default_ocr_max_tokens() -> u32 {
    2500
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the libSQL page database (`~` expands to home).
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.folio/folio.db".into()
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Ingest config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime configuration for one ingestion job.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Folder reference handed to the file source.
    pub folder: String,
    /// Client/actor the pages belong to.
    pub client_user_id: String,
    /// Book identifier stored with each page (defaults to the folder).
    pub book_key: String,
    pub language_code: String,
    pub page_limit: Option<usize>,
    pub group_prefix: String,
    pub group_size: u32,
    pub max_gap: u32,
    pub image_extensions: Vec<String>,
    /// Checkpoint file for resumable runs.
    pub checkpoint_path: Option<PathBuf>,
    pub checkpoint_every: usize,
    pub degradation: DegradationConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub resources: ResourceConfig,
    pub monitor: MonitorConfig,
}

impl From<&AppConfig> for IngestConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            folder: String::new(),
            client_user_id: String::new(),
            book_key: String::new(),
            language_code: config.job.language_code.clone(),
            page_limit: config.job.page_limit,
            group_prefix: config.job.group_prefix.clone(),
            group_size: config.job.group_size,
            max_gap: config.job.max_gap,
            image_extensions: config.job.image_extensions.clone(),
            checkpoint_path: None,
            checkpoint_every: config.job.checkpoint_every,
            degradation: config.degradation.clone(),
            retry: config.retry.clone(),
            timeouts: config.timeouts.clone(),
            circuit_breaker: config.circuit_breaker.clone(),
            resources: config.resources.clone(),
            monitor: config.monitor.clone(),
        }
    }
}

impl IngestConfig {
    /// Defaults from an empty config file, pointed at `folder`.
    pub fn for_folder(folder: impl Into<String>) -> Self {
        let folder = folder.into();
        let mut config = Self::from(&AppConfig::default());
        config.book_key = folder.clone();
        config.folder = folder;
        config
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.folio/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| FolioError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.folio/folio.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| FolioError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| FolioError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| FolioError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| FolioError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| FolioError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| FolioError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the OCR API key from the configured env var.
pub fn ocr_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.ocr.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(FolioError::config(format!(
            "OCR API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Bearer token for the remote file service, if its env var is set.
pub fn source_token(config: &AppConfig) -> Option<String> {
    std::env::var(&config.source.token_env)
        .ok()
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("group_size"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.job.group_size, 25);
        assert_eq!(parsed.retry.network.max_retries, 3);
        assert_eq!(parsed.retry.rate_limit.max_delay_secs, 120.0);
        assert_eq!(parsed.monitor.max_llm_calls_per_page, 4);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let toml_str = r#"
[job]
group_size = 20
page_limit = 50

[retry.ocr]
max_retries = 1
base_delay_secs = 1.0
backoff_multiplier = 1.0
max_delay_secs = 1.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.job.group_size, 20);
        assert_eq!(config.job.page_limit, Some(50));
        assert_eq!(config.job.language_code, "es");
        assert_eq!(config.retry.ocr.max_retries, 1);
        assert!(config.retry.ocr.jitter);
        assert_eq!(config.retry.network.max_retries, 3);
        assert_eq!(config.timeouts.ocr_secs, 300);
        assert!(config.source.base_url.is_none());
        assert_eq!(config.source.token_env, "FOLIO_SOURCE_TOKEN");
    }

    #[test]
    fn partial_retry_table_keeps_category_defaults() {
        let config: AppConfig =
            toml::from_str("[retry.network]\nmax_retries = 5\n").expect("parse");
        assert_eq!(config.retry.network.max_retries, 5);
        assert_eq!(config.retry.network.base_delay_secs, 2.0);
        assert_eq!(config.retry.network.max_delay_secs, 30.0);
        assert!(config.retry.network.jitter);

        let config: AppConfig =
            toml::from_str("[retry.rate_limit]\njitter = false\n").expect("parse");
        assert_eq!(config.retry.rate_limit, RetryPolicy {
            jitter: false,
            ..RetryPolicy::new(5, 5.0, 2.0, 120.0)
        });
    }

    #[test]
    fn ingest_config_from_app_config() {
        let app = AppConfig::default();
        let ingest = IngestConfig::from(&app);
        assert_eq!(ingest.group_size, 25);
        assert_eq!(ingest.max_gap, 5);
        assert_eq!(ingest.image_extensions.len(), 7);
        assert!(ingest.checkpoint_path.is_none());
    }

    #[test]
    fn for_folder_sets_book_key() {
        let ingest = IngestConfig::for_folder("/books/baron");
        assert_eq!(ingest.folder, "/books/baron");
        assert_eq!(ingest.book_key, "/books/baron");
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(
            expand_home("/var/folio.db").expect("expand"),
            PathBuf::from("/var/folio.db")
        );
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        config.ocr.api_key_env = "FOLIO_TEST_NONEXISTENT_KEY_12345".into();
        let result = ocr_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
