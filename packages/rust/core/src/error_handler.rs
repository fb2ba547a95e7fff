//! Error classification, retry with backoff, and the run-level error history.
//!
//! Classification is a keyword heuristic over the rendered error text. It is
//! best effort: a message that happens to mention "connection" is treated as
//! a network problem whatever actually went wrong.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use folio_shared::{
    CircuitBreakerConfig, DegradationConfig, ErrorCategory, ErrorSeverity, FolioError,
    ProcessingError, RetryConfig, RetryPolicy,
};

use crate::degradation::{self, DegradedOcr};
use crate::stages::OcrOutput;

// ---------------------------------------------------------------------------
// Keyword tables
// ---------------------------------------------------------------------------

const MODEL_CONFIG_KEYWORDS: &[&str] = &[
    "litellm",
    "unknown parameter",
    "invalid parameter",
    "model not found",
    "unsupported model",
    "gpt-4.1",
    "openai.error",
    "invalid request error",
];

const NETWORK_KEYWORDS: &[&str] = &[
    "connection",
    "timeout",
    "network",
    "dns",
    "socket",
    "connectionerror",
    "timeouterror",
    "httperror",
];

const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "rate limit",
    "quota",
    "too many requests",
    "429",
    "rate_limit_exceeded",
    "quota_exceeded",
];

const STORAGE_SERVICE_KEYWORDS: &[&str] = &[
    "google drive",
    "drive api",
    "file not found",
    "permission denied",
    "invalid file id",
    "drive service",
];

const PERSISTENCE_KEYWORDS: &[&str] = &[
    "database",
    "sqlalchemy",
    "connection pool",
    "postgresql",
    "psycopg2",
    "database connection",
    "transaction",
];

const OCR_KEYWORDS: &[&str] = &[
    "openai",
    "gpt-4o",
    "vision",
    "image processing",
    "ocr",
    "base64",
    "image format",
    "model error",
];

const FILE_ACCESS_KEYWORDS: &[&str] = &[
    "file not found",
    "permission denied",
    "no such file",
    "access denied",
    "disk space",
    "temporary file",
];

const VALIDATION_KEYWORDS: &[&str] = &[
    "validation",
    "invalid input",
    "schema",
    "required field",
    "pydantic",
    "validation error",
];

const AUTH_KEYWORDS: &[&str] = &[
    "authentication",
    "authorization",
    "api key",
    "token",
    "unauthorized",
    "forbidden",
    "401",
    "403",
];

const RESOURCE_KEYWORDS: &[&str] = &[
    "memory",
    "disk space",
    "resource",
    "out of memory",
    "no space left",
    "resource exhausted",
];

const CRITICAL_KEYWORDS: &[&str] = &["critical", "fatal", "system error", "out of memory"];

const HIGH_KEYWORDS: &[&str] = &[
    "database connection",
    "invalid schema",
    "required field missing",
];

/// Messages that are never worth retrying, whatever their category.
const NON_RECOVERABLE_PATTERNS: &[&str] = &[
    "invalid api key",
    "authentication failed",
    "permission denied",
    "file not found",
    "invalid file id",
    "schema validation failed",
    "required field missing",
    "unsupported format",
    "litellm",
    "unknown parameter",
    "invalid parameter",
    "model not found",
    "unsupported model",
    "gpt-4.1",
    "openai.error",
    "invalid request error",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Lowercased error text the keyword tables run against.
///
/// Paths and file names are left out: pages are routinely named `401.png`
/// or `ocr_scan_003.jpg`, which must not read as a status or a stage.
fn classification_text(err: &FolioError) -> String {
    let text = match err {
        FolioError::Io { source, .. } => format!("i/o error: {source}"),
        FolioError::Download { message, .. } => format!("download error: {message}"),
        other => other.to_string(),
    };
    text.to_lowercase()
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Map an error to a category. First matching keyword table wins.
pub fn categorize(err: &FolioError) -> ErrorCategory {
    if matches!(err, FolioError::Timeout { .. }) {
        return ErrorCategory::Timeout;
    }

    let msg = classification_text(err);
    let table: [(&[&str], ErrorCategory); 10] = [
        (MODEL_CONFIG_KEYWORDS, ErrorCategory::ModelConfiguration),
        (NETWORK_KEYWORDS, ErrorCategory::Network),
        (RATE_LIMIT_KEYWORDS, ErrorCategory::RateLimit),
        (STORAGE_SERVICE_KEYWORDS, ErrorCategory::StorageService),
        (PERSISTENCE_KEYWORDS, ErrorCategory::Persistence),
        (OCR_KEYWORDS, ErrorCategory::OcrProcessing),
        (FILE_ACCESS_KEYWORDS, ErrorCategory::FileAccess),
        (VALIDATION_KEYWORDS, ErrorCategory::Validation),
        (AUTH_KEYWORDS, ErrorCategory::Authentication),
        (RESOURCE_KEYWORDS, ErrorCategory::ResourceExhaustion),
    ];

    table
        .iter()
        .find(|(keywords, _)| contains_any(&msg, keywords))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Severity from the category, escalated by alarming message keywords.
pub fn assess_severity(err: &FolioError, category: ErrorCategory) -> ErrorSeverity {
    let msg = classification_text(err);

    match category {
        ErrorCategory::Authentication | ErrorCategory::ResourceExhaustion => {
            return ErrorSeverity::Critical;
        }
        _ if contains_any(&msg, CRITICAL_KEYWORDS) => return ErrorSeverity::Critical,
        _ => {}
    }

    match category {
        ErrorCategory::Persistence | ErrorCategory::Validation => return ErrorSeverity::High,
        _ if contains_any(&msg, HIGH_KEYWORDS) => return ErrorSeverity::High,
        _ => {}
    }

    match category {
        ErrorCategory::OcrProcessing | ErrorCategory::StorageService => ErrorSeverity::Medium,
        ErrorCategory::Network | ErrorCategory::RateLimit => ErrorSeverity::Low,
        _ => ErrorSeverity::Medium,
    }
}

/// Whether retrying could plausibly help.
pub fn is_recoverable(err: &FolioError, category: ErrorCategory) -> bool {
    if matches!(
        category,
        ErrorCategory::Validation
            | ErrorCategory::Authentication
            | ErrorCategory::ModelConfiguration
    ) {
        return false;
    }
    !contains_any(&classification_text(err), NON_RECOVERABLE_PATTERNS)
}

/// Backoff before retry number `retry_count + 1`.
///
/// `base * multiplier^retry_count`, capped at the policy maximum. Jitter
/// scales the delay by a random factor in `[0.5, 1.0]`. Nonsensical policy
/// values yield zero; values past `Duration::MAX` saturate.
pub fn retry_delay(policy: &RetryPolicy, retry_count: u32) -> Duration {
    let exp = policy
        .backoff_multiplier
        .powi(i32::try_from(retry_count).unwrap_or(i32::MAX));
    let uncapped = policy.base_delay_secs * exp;
    if uncapped.is_nan() {
        return Duration::ZERO;
    }
    let mut secs = uncapped.min(policy.max_delay_secs);
    if policy.jitter {
        secs *= rand::thread_rng().gen_range(0.5..=1.0);
    }
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

fn source_chain(err: &FolioError) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = std::error::Error::source(err);
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    chain
}

// ---------------------------------------------------------------------------
// Context and failures
// ---------------------------------------------------------------------------

/// Where an operation ran, attached to every error it produces.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Position of the page in this run's processing order.
    pub attempt_index: Option<usize>,
    pub page_number: Option<u32>,
    pub file_name: Option<String>,
    pub file_id: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn operation(name: &str) -> Self {
        let mut ctx = Self::default();
        ctx.extra.insert("operation".into(), name.into());
        ctx
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Terminal failure of [`ErrorHandler::execute_with_retry`].
#[derive(Debug, thiserror::Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct RetryFailure {
    /// The last error raised by the operation.
    #[source]
    pub error: FolioError,
    /// Classified record of that last error, as stored in the history.
    pub record: ProcessingError,
    pub attempts: u32,
}

/// Aggregate view of the error history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub error_categories: BTreeMap<ErrorCategory, usize>,
    pub severity_breakdown: BTreeMap<ErrorSeverity, usize>,
    pub recoverable_errors: usize,
    pub non_recoverable_errors: usize,
    pub pages_with_errors: usize,
    pub most_common_category: Option<ErrorCategory>,
    pub highest_severity: Option<ErrorSeverity>,
}

// ---------------------------------------------------------------------------
// ErrorHandler
// ---------------------------------------------------------------------------

struct LoggedError {
    attempt_index: Option<usize>,
    record: ProcessingError,
}

#[derive(Default)]
struct HandlerState {
    history: Vec<LoggedError>,
    temp_files: Vec<PathBuf>,
}

/// Classifies, records, and retries failures for one run.
pub struct ErrorHandler {
    retry: RetryConfig,
    breaker: CircuitBreakerConfig,
    degradation: DegradationConfig,
    state: Mutex<HandlerState>,
}

impl ErrorHandler {
    pub fn new(
        retry: RetryConfig,
        breaker: CircuitBreakerConfig,
        degradation: DegradationConfig,
    ) -> Self {
        Self {
            retry,
            breaker,
            degradation,
            state: Mutex::new(HandlerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Retry budget for a category. Categories without one are never retried.
    pub fn retry_policy(&self, category: ErrorCategory) -> Option<&RetryPolicy> {
        match category {
            ErrorCategory::Network => Some(&self.retry.network),
            ErrorCategory::RateLimit => Some(&self.retry.rate_limit),
            ErrorCategory::StorageService => Some(&self.retry.storage_service),
            ErrorCategory::Persistence => Some(&self.retry.persistence),
            ErrorCategory::OcrProcessing => Some(&self.retry.ocr),
            ErrorCategory::Timeout => Some(&self.retry.timeout),
            _ => None,
        }
    }

    /// Classify `err`, append it to the history, and log it at a level
    /// matching its severity.
    pub fn log_error(
        &self,
        err: &FolioError,
        ctx: &ErrorContext,
        retry_count: u32,
    ) -> ProcessingError {
        let category = categorize(err);
        let severity = assess_severity(err, category);
        let recoverable = is_recoverable(err, category);

        let record = ProcessingError {
            error_kind: err.kind().to_string(),
            message: err.to_string(),
            category,
            severity,
            page_number: ctx.page_number,
            file_name: ctx.file_name.clone(),
            file_id: ctx.file_id.clone(),
            timestamp: Utc::now(),
            source_chain: source_chain(err),
            context: ctx.extra.clone(),
            retry_count,
            recoverable,
        };

        let page = ctx.page_number;
        let file = ctx.file_name.as_deref().unwrap_or("-");
        match severity {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(?page, file, %category, %severity, retry_count, recoverable, error = %err, "processing error");
            }
            ErrorSeverity::Medium => {
                warn!(?page, file, %category, retry_count, recoverable, error = %err, "processing error");
            }
            ErrorSeverity::Low => {
                info!(?page, file, %category, retry_count, recoverable, error = %err, "processing error");
            }
        }

        self.state().history.push(LoggedError {
            attempt_index: ctx.attempt_index,
            record: record.clone(),
        });
        record
    }

    /// Run `operation` until it succeeds, fails non-recoverably, or runs out
    /// of retries for its error category.
    ///
    /// Every failed attempt is recorded in the history. The backoff sleep is
    /// an awaited timer, so the caller's task yields while waiting.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        ctx: &ErrorContext,
        mut operation: F,
    ) -> std::result::Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = folio_shared::Result<T>>,
    {
        let mut retry_count: u32 = 0;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let record = self.log_error(&err, ctx, retry_count);
            let attempts = retry_count + 1;

            if !record.recoverable {
                debug!(category = %record.category, "not retrying non-recoverable error");
                return Err(RetryFailure {
                    error: err,
                    record,
                    attempts,
                });
            }

            let Some(policy) = self.retry_policy(record.category) else {
                return Err(RetryFailure {
                    error: err,
                    record,
                    attempts,
                });
            };
            if retry_count >= policy.max_retries {
                warn!(
                    category = %record.category,
                    attempts,
                    "retry budget exhausted"
                );
                return Err(RetryFailure {
                    error: err,
                    record,
                    attempts,
                });
            }

            let delay = retry_delay(policy, retry_count);
            info!(
                page = ?ctx.page_number,
                file = ctx.file_name.as_deref().unwrap_or("-"),
                delay_ms = delay.as_millis() as u64,
                attempt = attempts + 1,
                max_attempts = policy.max_retries + 1,
                "retrying"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }

    /// Grade an OCR result and annotate or flag it. Never fails.
    pub fn handle_ocr_degradation(
        &self,
        output: OcrOutput,
        page_number: u32,
        file_name: &str,
    ) -> DegradedOcr {
        degradation::apply(&self.degradation, output, page_number, file_name)
    }

    /// Advisory circuit breaker: `false` once recent failures look systemic.
    ///
    /// "Recent" means logged while processing one of the last `window`
    /// attempts before `current_index`.
    pub fn should_continue_processing(&self, current_index: usize, total: usize) -> bool {
        let state = self.state();
        if state.history.is_empty() {
            return true;
        }

        let since = current_index.saturating_sub(self.breaker.window as usize);
        let recent: Vec<&LoggedError> = state
            .history
            .iter()
            .filter(|e| e.attempt_index.is_some_and(|i| i >= since && i < current_index))
            .collect();

        let critical = recent
            .iter()
            .filter(|e| e.record.severity == ErrorSeverity::Critical)
            .count();
        if critical >= self.breaker.max_critical {
            error!(critical, current_index, total, "stopping: critical errors in recent pages");
            return false;
        }

        let mut failed_attempts: Vec<usize> =
            recent.iter().filter_map(|e| e.attempt_index).collect();
        failed_attempts.dedup();
        if failed_attempts.len() >= self.breaker.max_recent_errors
            && current_index >= self.breaker.min_pages
        {
            error!(
                failed = failed_attempts.len(),
                window = self.breaker.window,
                "stopping: high error rate in recent pages"
            );
            return false;
        }

        if recent.len() >= self.breaker.max_unrecoverable
            && recent.iter().all(|e| !e.record.recoverable)
        {
            error!(count = recent.len(), "stopping: consecutive non-recoverable errors");
            return false;
        }

        true
    }

    /// Snapshot of every error logged so far, in order.
    pub fn history(&self) -> Vec<ProcessingError> {
        self.state().history.iter().map(|e| e.record.clone()).collect()
    }

    pub fn error_summary(&self) -> ErrorSummary {
        let state = self.state();
        let mut summary = ErrorSummary {
            total_errors: state.history.len(),
            ..ErrorSummary::default()
        };
        let mut pages = std::collections::BTreeSet::new();

        for logged in &state.history {
            let e = &logged.record;
            *summary.error_categories.entry(e.category).or_default() += 1;
            *summary.severity_breakdown.entry(e.severity).or_default() += 1;
            if e.recoverable {
                summary.recoverable_errors += 1;
            } else {
                summary.non_recoverable_errors += 1;
            }
            if let Some(page) = e.page_number {
                pages.insert(page);
            }
        }

        summary.pages_with_errors = pages.len();
        summary.most_common_category = summary
            .error_categories
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(category, _)| *category);
        summary.highest_severity = summary.severity_breakdown.keys().max().copied();
        summary
    }

    /// Remember a temp file to delete in [`Self::cleanup_temp_files`].
    pub fn register_temp_file(&self, path: impl Into<PathBuf>) {
        self.state().temp_files.push(path.into());
    }

    /// Delete every registered temp file. Failures are logged, not returned.
    pub fn cleanup_temp_files(&self) {
        let files = std::mem::take(&mut self.state().temp_files);
        for path in files {
            if !path.exists() {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(?path, "removed temp file"),
                Err(e) => warn!(?path, error = %e, "failed to remove temp file"),
            }
        }
    }
}
