//! Ingestion pipeline: list → sort → per-page download/OCR/store → report.
//!
//! Pages are processed strictly one at a time in sorted order. A page that
//! fails at any stage is recorded and skipped; only a failed listing or a
//! tripped circuit breaker ends the run early, and both still produce an
//! [`IngestReport`] rather than an error.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use folio_shared::{
    ErrorCategory, ErrorSeverity, FolioError, IngestConfig, JobId, PageFile, Result, SourceFile,
};

use crate::checkpoint::Checkpoint;
use crate::degradation::{DegradedOcr, QualityLevel};
use crate::error_handler::{ErrorContext, ErrorHandler, ErrorSummary, RetryFailure};
use crate::filename::{FilenameParser, IssueSeverity, SequenceIssue, validate_sequence};
use crate::monitor::{PerformanceMonitor, RunReport};
use crate::resources::{ResourceManager, ResourceStats};
use crate::stages::{
    DownloadRequest, Downloader, FileSource, OcrEngine, OcrOutput, PageStore, StoreRequest,
    with_timeout,
};

/// The four collaborators a run needs.
#[derive(Clone)]
pub struct Stages {
    pub source: Arc<dyn FileSource>,
    pub downloader: Arc<dyn Downloader>,
    pub ocr: Arc<dyn OcrEngine>,
    pub store: Arc<dyn PageStore>,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every selected page was attempted (or skipped via checkpoint).
    Completed,
    /// The circuit breaker ended the run early.
    Stopped,
    /// Nothing could be processed.
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageSuccess {
    pub page_number: u32,
    pub file_name: String,
    pub file_id: String,
    pub stored_id: String,
    pub quality_score: f64,
    pub quality_level: QualityLevel,
    pub requires_manual_review: bool,
    pub degradation_applied: Option<&'static str>,
    pub text_length: usize,
    pub ocr_passes: u32,
    pub download_secs: f64,
    pub ocr_secs: f64,
    pub storage_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageFailure {
    pub page_number: u32,
    pub file_name: String,
    pub file_id: String,
    /// Stage that gave up: `download`, `ocr`, or `storage`.
    pub stage: &'static str,
    pub error: String,
    pub error_category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PageOutcome {
    Succeeded(PageSuccess),
    Failed(PageFailure),
}

impl PageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn page_number(&self) -> u32 {
        match self {
            Self::Succeeded(s) => s.page_number,
            Self::Failed(f) => f.page_number,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityMetrics {
    pub average_quality_score: f64,
    pub quality_distribution: BTreeMap<QualityLevel, usize>,
    pub pages_requiring_review: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SequenceValidation {
    pub total_files: usize,
    pub warnings: usize,
    pub errors: usize,
    pub issues: Vec<SequenceIssue>,
}

impl SequenceValidation {
    fn new(total_files: usize, issues: Vec<SequenceIssue>) -> Self {
        let count = |s: IssueSeverity| issues.iter().filter(|i| i.severity == s).count();
        Self {
            total_files,
            warnings: count(IssueSeverity::Warning),
            errors: count(IssueSeverity::Error),
            issues,
        }
    }
}

/// Final result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub job_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub folder: String,
    pub book_key: String,
    /// Pages selected for processing, after the page limit.
    pub total_pages: usize,
    pub attempted_pages: usize,
    pub processed_successfully: usize,
    pub failed: usize,
    /// Pages skipped because a checkpoint already marked them processed.
    pub skipped_pages: Vec<u32>,
    pub processing_time: String,
    pub average_time_per_page: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub successful_pages: Vec<PageSuccess>,
    pub failed_pages: Vec<PageFailure>,
    pub detailed_results: Vec<PageOutcome>,
    pub error_summary: ErrorSummary,
    pub quality_metrics: QualityMetrics,
    pub page_sequence_validation: SequenceValidation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_metrics: Option<RunReport>,
    pub resource_usage: ResourceStats,
}

impl IngestReport {
    /// Completed with no failed pages.
    pub fn is_clean(&self) -> bool {
        self.status == RunStatus::Completed && self.failed == 0
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called before a page's first stage.
    fn page_started(&self, page: &PageFile, current: usize, total: usize);
    /// Called after a page succeeded or failed.
    fn page_finished(&self, outcome: &PageOutcome, current: usize, total: usize);
    /// Called once with the final report.
    fn done(&self, report: &IngestReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn page_started(&self, _page: &PageFile, _current: usize, _total: usize) {}
    fn page_finished(&self, _outcome: &PageOutcome, _current: usize, _total: usize) {}
    fn done(&self, _report: &IngestReport) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Releases run-scoped resources even if the run future panics or is dropped.
struct RunCleanup<'a> {
    errors: &'a ErrorHandler,
    resources: &'a ResourceManager,
}

impl Drop for RunCleanup<'_> {
    fn drop(&mut self) {
        self.errors.cleanup_temp_files();
        self.resources.cleanup_all();
    }
}

/// Drives one ingestion job. Each job owns its own error history, resource
/// manager, and performance monitor.
pub struct Orchestrator {
    job_id: JobId,
    config: IngestConfig,
    stages: Stages,
    parser: FilenameParser,
    errors: ErrorHandler,
    resources: Arc<ResourceManager>,
}

impl Orchestrator {
    pub fn new(mut config: IngestConfig, stages: Stages) -> Result<Self> {
        if config.folder.trim().is_empty() {
            return Err(FolioError::validation("folder reference is required"));
        }
        if config.book_key.trim().is_empty() {
            config.book_key = config.folder.clone();
        }
        let parser = FilenameParser::new(&config.group_prefix, config.group_size)?;
        let errors = ErrorHandler::new(
            config.retry.clone(),
            config.circuit_breaker.clone(),
            config.degradation.clone(),
        );
        let job_id = JobId::new();
        let resources = Arc::new(ResourceManager::new(job_id.clone(), &config.resources));

        Ok(Self {
            job_id,
            config,
            stages,
            parser,
            errors,
            resources,
        })
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// This job's resource manager, e.g. to register cached connections
    /// that should be closed when the run ends.
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Run the job to completion. Never fails; problems are in the report.
    #[instrument(skip_all, fields(job_id = %self.job_id, folder = %self.config.folder))]
    pub async fn run(self, progress: &dyn ProgressReporter) -> IngestReport {
        let _cleanup = RunCleanup {
            errors: &self.errors,
            resources: &self.resources,
        };
        let report = self.execute(progress).await;
        progress.done(&report);
        info!(
            status = ?report.status,
            succeeded = report.processed_successfully,
            failed = report.failed,
            skipped = report.skipped_pages.len(),
            time = %report.processing_time,
            "ingestion finished"
        );
        report
    }

    async fn execute(&self, progress: &dyn ProgressReporter) -> IngestReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(book_key = %self.config.book_key, "starting ingestion");

        // --- Discovery ---
        progress.phase("Listing files");
        let listed = match self
            .stages
            .source
            .list_files(&self.config.folder, &self.config.client_user_id)
            .await
        {
            Ok(files) => files,
            Err(e) => {
                error!(error = %e, "file listing failed");
                return self.error_report(format!("Discovery failed: {e}"), started_at, clock);
            }
        };
        let listed_count = listed.len();
        let images: Vec<SourceFile> = listed
            .into_iter()
            .filter(|f| f.has_extension(&self.config.image_extensions))
            .collect();
        if images.is_empty() {
            warn!(listed = listed_count, "no image files in folder");
            return self.error_report("No image files found in folder".into(), started_at, clock);
        }
        info!(images = images.len(), listed = listed_count, "files discovered");

        // --- Sort and validate ---
        progress.phase("Sorting pages");
        let mut pages = self.parser.sort(&images);
        let issues = validate_sequence(&pages, self.config.max_gap);
        for issue in &issues {
            match issue.severity {
                IssueSeverity::Error | IssueSeverity::Warning => {
                    warn!(kind = ?issue.kind, "{}", issue.message)
                }
                IssueSeverity::Info => debug!(kind = ?issue.kind, "{}", issue.message),
            }
        }
        let validation = SequenceValidation::new(pages.len(), issues);

        if let Some(limit) = self.config.page_limit.filter(|&l| pages.len() > l) {
            info!(limit, available = pages.len(), "applying page limit");
            pages.truncate(limit);
        }

        let mut checkpoint = match &self.config.checkpoint_path {
            Some(path) => match Checkpoint::open(path, self.config.checkpoint_every) {
                Ok(c) => Some(c),
                Err(e) => {
                    error!(error = %e, "checkpoint could not be loaded");
                    let mut report =
                        self.error_report(format!("Checkpoint unreadable: {e}"), started_at, clock);
                    report.total_pages = pages.len();
                    report.page_sequence_validation = validation;
                    return report;
                }
            },
            None => None,
        };

        // --- Per-page loop ---
        progress.phase("Processing pages");
        let mut monitor = PerformanceMonitor::new(self.config.monitor.max_llm_calls_per_page);
        let total = pages.len();
        let mut outcomes: Vec<PageOutcome> = Vec::with_capacity(total);
        let mut skipped = Vec::new();
        let mut stop_reason = None;

        for (index, page) in pages.iter().enumerate() {
            if self.config.circuit_breaker.enabled
                && !self.errors.should_continue_processing(index, total)
            {
                let reason = format!(
                    "stopped before page {} ({} of {}): recent errors look systemic",
                    page.page_number,
                    index + 1,
                    total
                );
                error!("{reason}");
                stop_reason = Some(reason);
                break;
            }

            if checkpoint
                .as_ref()
                .is_some_and(|c| c.is_processed(page.page_number))
            {
                debug!(page = page.page_number, "already processed, skipping");
                skipped.push(page.page_number);
                continue;
            }

            progress.page_started(page, index + 1, total);
            monitor.start_page(page.page_number, &page.file_name);

            let outcome = self.process_page(index, page, &mut monitor).await;

            self.resources.cleanup_page_resources(page.page_number);
            monitor.end_page(outcome.is_success());

            if let Some(ckpt) = checkpoint.as_mut() {
                let saved = match &outcome {
                    PageOutcome::Succeeded(s) => ckpt.mark_processed(s.page_number),
                    PageOutcome::Failed(f) => {
                        ckpt.mark_failed(f.page_number, &f.file_name, &f.error)
                    }
                };
                if let Err(e) = saved {
                    warn!(error = %e, "checkpoint update failed");
                }
            }

            progress.page_finished(&outcome, index + 1, total);
            outcomes.push(outcome);
        }

        if let Some(ckpt) = checkpoint.as_mut() {
            ckpt.flush();
        }

        // --- Aggregate ---
        let performance = monitor.finalize();
        performance.log_summary();

        let status = if stop_reason.is_some() {
            RunStatus::Stopped
        } else {
            RunStatus::Completed
        };
        let mut report = self.base_report(status, started_at);
        report.stop_reason = stop_reason;
        report.total_pages = total;
        report.skipped_pages = skipped;
        report.page_sequence_validation = validation;
        report.performance_metrics = Some(performance);
        self.fill_outcomes(&mut report, outcomes);
        self.finish_report(&mut report, clock);
        report
    }

    /// Download, transcribe, and store one page. Never fails; a stage
    /// failure becomes [`PageOutcome::Failed`].
    #[instrument(skip_all, fields(page = page.page_number, file = %page.file_name))]
    async fn process_page(
        &self,
        index: usize,
        page: &PageFile,
        monitor: &mut PerformanceMonitor,
    ) -> PageOutcome {
        let timeouts = &self.config.timeouts;

        // --- Download ---
        let ctx = self.page_context(index, page, "download");
        let dest = match self
            .resources
            .page_temp_file(page.page_number, &extension_of(&page.file_name))
        {
            Ok(path) => path,
            Err(e) => {
                let record = self.errors.log_error(&e, &ctx, 0);
                let failure = RetryFailure {
                    error: e,
                    record,
                    attempts: 0,
                };
                return self.page_failed(page, "download", failure, monitor);
            }
        };
        self.errors.register_temp_file(dest.clone());

        let request = DownloadRequest {
            file_id: page.file_id.clone(),
            file_name: page.file_name.clone(),
            client_ref: self.config.client_user_id.clone(),
            dest,
        };
        let downloader = &self.stages.downloader;
        let (downloaded, download_secs) = match self
            .run_stage(
                "download",
                timeouts.download_secs,
                &ctx,
                monitor,
                || downloader.download(&request),
                |_| 0,
            )
            .await
        {
            Ok(done) => done,
            Err(failure) => return self.page_failed(page, "download", failure, monitor),
        };
        let size_bytes = match self.resources.record_file_size(&downloaded.local_path) {
            Ok(size) => size,
            Err(e) => {
                debug!(error = %e, "could not stat downloaded file");
                downloaded.size_bytes
            }
        };

        // --- OCR ---
        let ctx = self.page_context(index, page, "ocr");
        let ocr = &self.stages.ocr;
        let image = downloaded.local_path.as_path();
        let (output, ocr_secs) = match self
            .run_stage(
                "ocr",
                timeouts.ocr_secs,
                &ctx,
                monitor,
                || ocr.transcribe(image),
                |o: &OcrOutput| o.tokens_used,
            )
            .await
        {
            Ok(done) => done,
            Err(failure) => return self.page_failed(page, "ocr", failure, monitor),
        };
        for _ in 0..output.passes {
            monitor.record_ocr_pass();
        }

        let degraded =
            self.errors
                .handle_ocr_degradation(output, page.page_number, &page.file_name);
        monitor.record_quality_metrics(
            degraded.quality_score,
            degraded.output.unclear_sections.len(),
            degraded.requires_manual_review,
        );
        let text_length = degraded.output.transcription.chars().count();
        monitor.record_file_metrics(size_bytes, text_length);

        // --- Store ---
        let ctx = self.page_context(index, page, "storage");
        let request = StoreRequest {
            client_ref: self.config.client_user_id.clone(),
            book_key: self.config.book_key.clone(),
            page_number: page.page_number,
            file_name: page.file_name.clone(),
            language_code: self.config.language_code.clone(),
            page_text: degraded.output.transcription.clone(),
            ocr_metadata: ocr_metadata(page, &degraded, download_secs, ocr_secs),
        };
        let store = &self.stages.store;
        let (stored, storage_secs) = match self
            .run_stage(
                "storage",
                timeouts.store_secs,
                &ctx,
                monitor,
                || store.store(&request),
                |_| 0,
            )
            .await
        {
            Ok(done) => done,
            Err(failure) => return self.page_failed(page, "storage", failure, monitor),
        };

        info!(
            stored_id = %stored.id,
            quality = degraded.quality_score,
            review = degraded.requires_manual_review,
            "page stored"
        );

        PageOutcome::Succeeded(PageSuccess {
            page_number: page.page_number,
            file_name: page.file_name.clone(),
            file_id: page.file_id.clone(),
            stored_id: stored.id,
            quality_score: degraded.quality_score,
            quality_level: degraded.quality_level,
            requires_manual_review: degraded.requires_manual_review,
            degradation_applied: degraded.degradation_applied,
            text_length,
            ocr_passes: degraded.output.passes,
            download_secs,
            ocr_secs,
            storage_secs,
        })
    }

    /// Run one stage call under timeout and retry, recording each attempt
    /// as a coordination call. Returns the value and the stage's elapsed
    /// seconds.
    async fn run_stage<T, F, Fut>(
        &self,
        stage: &'static str,
        timeout_secs: u64,
        ctx: &ErrorContext,
        monitor: &mut PerformanceMonitor,
        mut call: F,
        tokens: fn(&T) -> u64,
    ) -> std::result::Result<(T, f64), RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts: u32 = 0;
        monitor.start_operation(stage);
        let result = self
            .errors
            .execute_with_retry(ctx, || {
                attempts += 1;
                with_timeout(stage, timeout_secs, call())
            })
            .await;
        let elapsed = monitor.end_operation(stage);

        let failed_attempts = if result.is_ok() {
            attempts.saturating_sub(1)
        } else {
            attempts
        };
        for _ in 0..failed_attempts {
            monitor.record_llm_call(0);
        }
        for _ in 1..attempts {
            monitor.record_retry();
        }

        result.map(|value| {
            monitor.record_llm_call(tokens(&value));
            (value, elapsed)
        })
    }

    fn page_context(&self, index: usize, page: &PageFile, stage: &str) -> ErrorContext {
        ErrorContext {
            attempt_index: Some(index),
            page_number: Some(page.page_number),
            file_name: Some(page.file_name.clone()),
            file_id: Some(page.file_id.clone()),
            ..ErrorContext::operation(stage)
        }
    }

    fn page_failed(
        &self,
        page: &PageFile,
        stage: &'static str,
        failure: RetryFailure,
        monitor: &mut PerformanceMonitor,
    ) -> PageOutcome {
        let record = failure.record;
        monitor.record_error(record.category, &record.message);
        warn!(
            page = page.page_number,
            file = %page.file_name,
            stage,
            category = %record.category,
            attempts = failure.attempts,
            "page failed"
        );
        PageOutcome::Failed(PageFailure {
            page_number: page.page_number,
            file_name: page.file_name.clone(),
            file_id: page.file_id.clone(),
            stage,
            error: failure.error.to_string(),
            error_category: record.category,
            severity: record.severity,
            recoverable: record.recoverable,
            attempts: failure.attempts,
        })
    }

    // -----------------------------------------------------------------------
    // Report assembly
    // -----------------------------------------------------------------------

    fn base_report(&self, status: RunStatus, started_at: DateTime<Utc>) -> IngestReport {
        IngestReport {
            job_id: self.job_id.to_string(),
            status,
            error: None,
            stop_reason: None,
            folder: self.config.folder.clone(),
            book_key: self.config.book_key.clone(),
            total_pages: 0,
            attempted_pages: 0,
            processed_successfully: 0,
            failed: 0,
            skipped_pages: Vec::new(),
            processing_time: String::new(),
            average_time_per_page: String::new(),
            started_at,
            completed_at: started_at,
            successful_pages: Vec::new(),
            failed_pages: Vec::new(),
            detailed_results: Vec::new(),
            error_summary: ErrorSummary::default(),
            quality_metrics: QualityMetrics::default(),
            page_sequence_validation: SequenceValidation::default(),
            performance_metrics: None,
            resource_usage: self.resources.stats(),
        }
    }

    fn error_report(&self, message: String, started_at: DateTime<Utc>, clock: Instant) -> IngestReport {
        let mut report = self.base_report(RunStatus::Error, started_at);
        report.error = Some(message);
        self.finish_report(&mut report, clock);
        report
    }

    fn fill_outcomes(&self, report: &mut IngestReport, outcomes: Vec<PageOutcome>) {
        let mut quality = QualityMetrics::default();
        let mut score_sum = 0.0;

        for outcome in &outcomes {
            match outcome {
                PageOutcome::Succeeded(s) => {
                    score_sum += s.quality_score;
                    *quality.quality_distribution.entry(s.quality_level).or_default() += 1;
                    if s.requires_manual_review {
                        quality.pages_requiring_review.push(s.page_number);
                    }
                    report.successful_pages.push(s.clone());
                }
                PageOutcome::Failed(f) => report.failed_pages.push(f.clone()),
            }
        }

        if !report.successful_pages.is_empty() {
            quality.average_quality_score = score_sum / report.successful_pages.len() as f64;
        }
        report.attempted_pages = outcomes.len();
        report.processed_successfully = report.successful_pages.len();
        report.failed = report.failed_pages.len();
        report.quality_metrics = quality;
        report.detailed_results = outcomes;
    }

    fn finish_report(&self, report: &mut IngestReport, clock: Instant) {
        let secs = clock.elapsed().as_secs_f64();
        let per_page = if report.attempted_pages == 0 {
            0.0
        } else {
            secs / report.attempted_pages as f64
        };
        report.processing_time = format!("{secs:.1}s");
        report.average_time_per_page = format!("{per_page:.1}s");
        report.completed_at = Utc::now();
        report.error_summary = self.errors.error_summary();
        report.resource_usage = self.resources.stats();
    }
}

/// Metadata persisted alongside the page text.
fn ocr_metadata(
    page: &PageFile,
    degraded: &DegradedOcr,
    download_secs: f64,
    ocr_secs: f64,
) -> serde_json::Value {
    serde_json::json!({
        "file_id": page.file_id,
        "source_file_name": page.file_name,
        "filename_format": page.format,
        "page_confidence": page.confidence,
        "processing_stats": degraded.output.processing_stats,
        "ocr_passes": degraded.output.passes,
        "model": degraded.output.model,
        "unclear_sections": degraded.output.unclear_sections,
        "quality_score": degraded.quality_score,
        "quality_level": degraded.quality_level,
        "degradation_applied": degraded.degradation_applied,
        "requires_manual_review": degraded.requires_manual_review,
        "processing_time": {
            "download_seconds": download_secs,
            "ocr_seconds": ocr_secs,
        },
    })
}

/// `.png` for `scan 001.PNG`; `.img` when there is no extension.
fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_else(|| ".img".to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use folio_shared::RetryConfig;

    use super::*;
    use crate::stages::{Downloaded, StoredPage};

    const CLEAN_TEXT: &str =
        "En la ciudad de Medellin vivia un hombre que todos llamaban el baron del cafe";

    struct ListedFiles(Vec<&'static str>);

    #[async_trait]
    impl FileSource for ListedFiles {
        async fn list_files(&self, _folder: &str, _client: &str) -> Result<Vec<SourceFile>> {
            Ok(self
                .0
                .iter()
                .map(|name| SourceFile::new(format!("id-{name}"), *name))
                .collect())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl FileSource for BrokenSource {
        async fn list_files(&self, _folder: &str, _client: &str) -> Result<Vec<SourceFile>> {
            Err(FolioError::Discovery("folder not shared".into()))
        }
    }

    /// Writes a few bytes to the destination; files listed in `failures`
    /// fail their first N calls (`u32::MAX` for always).
    #[derive(Default)]
    struct FakeDownloader {
        failures: HashMap<&'static str, (u32, &'static str)>,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl FakeDownloader {
        fn failing(name: &'static str, times: u32, message: &'static str) -> Self {
            let mut failures = HashMap::new();
            failures.insert(name, (times, message));
            Self {
                failures,
                ..Self::default()
            }
        }

        fn calls(&self, name: &str) -> u32 {
            self.calls
                .lock()
                .expect("lock")
                .get(name)
                .copied()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl Downloader for FakeDownloader {
        async fn download(&self, request: &DownloadRequest) -> Result<Downloaded> {
            let call = {
                let mut calls = self.calls.lock().expect("lock");
                let n = calls.entry(request.file_name.clone()).or_default();
                *n += 1;
                *n
            };
            if let Some((times, message)) = self.failures.get(request.file_name.as_str()) {
                if call <= *times {
                    return Err(FolioError::download(&request.file_name, *message));
                }
            }
            std::fs::write(&request.dest, b"fake image bytes")
                .map_err(|e| FolioError::io(&request.dest, e))?;
            Ok(Downloaded {
                local_path: request.dest.clone(),
                size_bytes: 16,
            })
        }
    }

    struct FakeOcr {
        delay: Option<Duration>,
    }

    #[async_trait]
    impl OcrEngine for FakeOcr {
        async fn transcribe(&self, image_path: &Path) -> Result<OcrOutput> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            assert!(image_path.exists(), "OCR should see the downloaded file");
            Ok(OcrOutput {
                transcription: CLEAN_TEXT.into(),
                passes: 3,
                tokens_used: 250,
                ..OcrOutput::default()
            })
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        stored: Mutex<Vec<StoreRequest>>,
        counter: AtomicU32,
    }

    impl RecordingStore {
        fn pages(&self) -> Vec<(u32, String)> {
            self.stored
                .lock()
                .expect("lock")
                .iter()
                .map(|r| (r.page_number, r.page_text.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl PageStore for RecordingStore {
        async fn store(&self, request: &StoreRequest) -> Result<StoredPage> {
            self.stored.lock().expect("lock").push(request.clone());
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(StoredPage {
                id: format!("row-{n}"),
            })
        }
    }

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("folio-pipeline-test-{}", Uuid::now_v7()))
    }

    fn config() -> IngestConfig {
        let mut config = IngestConfig::for_folder("book-folder");
        config.client_user_id = "client-1".into();
        config.retry = RetryConfig::immediate(3);
        config.resources.temp_root = Some(temp_root());
        config
    }

    fn stages(
        source: impl FileSource + 'static,
        downloader: Arc<FakeDownloader>,
        store: Arc<RecordingStore>,
    ) -> Stages {
        Stages {
            source: Arc::new(source),
            downloader,
            ocr: Arc::new(FakeOcr { delay: None }),
            store,
        }
    }

    #[tokio::test]
    async fn one_failing_page_does_not_affect_the_others() {
        let files = vec!["003.png", "001.png", "002.png"];

        let clean_store = Arc::new(RecordingStore::default());
        let clean = Orchestrator::new(
            config(),
            stages(
                ListedFiles(files.clone()),
                Arc::new(FakeDownloader::default()),
                Arc::clone(&clean_store),
            ),
        )
        .expect("orchestrator")
        .run(&SilentProgress)
        .await;
        assert_eq!(clean.processed_successfully, 3);

        let downloader = Arc::new(FakeDownloader::failing("002.png", u32::MAX, "permission denied"));
        let store = Arc::new(RecordingStore::default());
        let report = Orchestrator::new(
            config(),
            stages(ListedFiles(files), Arc::clone(&downloader), Arc::clone(&store)),
        )
        .expect("orchestrator")
        .run(&SilentProgress)
        .await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.processed_successfully, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(downloader.calls("002.png"), 1, "non-recoverable, no retry");

        let failed = &report.failed_pages[0];
        assert_eq!((failed.page_number, failed.file_name.as_str()), (2, "002.png"));
        assert_eq!(failed.stage, "download");
        assert!(!failed.recoverable);
        assert_eq!(failed.error_category, ErrorCategory::StorageService);

        let order: Vec<u32> = report.detailed_results.iter().map(|o| o.page_number()).collect();
        assert_eq!(order, vec![1, 2, 3]);

        let clean_pages: Vec<(u32, String)> = clean_store
            .pages()
            .into_iter()
            .filter(|(n, _)| *n != 2)
            .collect();
        assert_eq!(store.pages(), clean_pages);
        assert_eq!(report.error_summary.pages_with_errors, 1);
    }

    #[tokio::test]
    async fn empty_folder_returns_error_report() {
        let report = Orchestrator::new(
            config(),
            stages(
                ListedFiles(vec!["notes.txt", "cover.pdf"]),
                Arc::new(FakeDownloader::default()),
                Arc::new(RecordingStore::default()),
            ),
        )
        .expect("orchestrator")
        .run(&SilentProgress)
        .await;

        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.error.as_deref(), Some("No image files found in folder"));
        assert_eq!(report.total_pages, 0);
        assert!(report.detailed_results.is_empty());
    }

    #[tokio::test]
    async fn listing_failure_returns_error_report() {
        let report = Orchestrator::new(
            config(),
            stages(
                BrokenSource,
                Arc::new(FakeDownloader::default()),
                Arc::new(RecordingStore::default()),
            ),
        )
        .expect("orchestrator")
        .run(&SilentProgress)
        .await;

        assert_eq!(report.status, RunStatus::Error);
        assert!(report.error.as_deref().is_some_and(|e| e.starts_with("Discovery failed")));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_and_counted() {
        let downloader = Arc::new(FakeDownloader::failing("001.png", 2, "connection reset"));
        let report = Orchestrator::new(
            config(),
            stages(
                ListedFiles(vec!["001.png"]),
                Arc::clone(&downloader),
                Arc::new(RecordingStore::default()),
            ),
        )
        .expect("orchestrator")
        .run(&SilentProgress)
        .await;

        assert_eq!(report.processed_successfully, 1);
        assert_eq!(downloader.calls("001.png"), 3);

        // 3 download attempts + 1 OCR + 1 store exceeds the default ceiling of 4.
        let perf = report.performance_metrics.as_ref().expect("perf");
        assert_eq!(perf.llm_usage.total_calls, 5);
        assert_eq!(perf.llm_usage.total_tokens, 250);
        assert_eq!(perf.pages_exceeding_llm_limit, vec![1]);
        assert_eq!(perf.llm_usage.compliance, "FAIL");
        assert_eq!(perf.errors.total_retries, 2);
        assert_eq!(perf.ocr.total_passes, 3);
        assert_eq!(report.error_summary.total_errors, 2);
    }

    #[tokio::test]
    async fn clean_run_is_within_call_ceiling() {
        let report = Orchestrator::new(
            config(),
            stages(
                ListedFiles(vec!["001.png", "002.png"]),
                Arc::new(FakeDownloader::default()),
                Arc::new(RecordingStore::default()),
            ),
        )
        .expect("orchestrator")
        .run(&SilentProgress)
        .await;

        assert!(report.is_clean());
        let perf = report.performance_metrics.as_ref().expect("perf");
        assert_eq!(perf.llm_usage.compliance, "PASS");
        assert_eq!(perf.database.total_transactions, 2);
        assert_eq!(
            report.quality_metrics.quality_distribution.get(&QualityLevel::Good),
            Some(&2)
        );
    }

    #[tokio::test]
    async fn circuit_breaker_stops_the_run() {
        let names = vec!["001.png", "002.png", "003.png", "004.png", "005.png", "006.png"];
        let mut downloader = FakeDownloader::default();
        for name in &names {
            downloader.failures.insert(*name, (u32::MAX, "permission denied"));
        }
        let report = Orchestrator::new(
            config(),
            stages(
                ListedFiles(names),
                Arc::new(downloader),
                Arc::new(RecordingStore::default()),
            ),
        )
        .expect("orchestrator")
        .run(&SilentProgress)
        .await;

        assert_eq!(report.status, RunStatus::Stopped);
        assert_eq!(report.attempted_pages, 3);
        assert_eq!(report.failed, 3);
        assert_eq!(report.total_pages, 6);
        assert!(report.stop_reason.is_some());
    }

    #[tokio::test]
    async fn checkpointed_pages_are_skipped() {
        let mut config = config();
        let ckpt_path = temp_root().join("checkpoint.json");
        std::fs::create_dir_all(ckpt_path.parent().expect("parent")).expect("mkdir");
        std::fs::write(
            &ckpt_path,
            r#"{"processed_pages": [1], "failed_pages": []}"#,
        )
        .expect("write");
        config.checkpoint_path = Some(ckpt_path.clone());

        let store = Arc::new(RecordingStore::default());
        let report = Orchestrator::new(
            config,
            stages(
                ListedFiles(vec!["001.png", "002.png", "003.png"]),
                Arc::new(FakeDownloader::default()),
                Arc::clone(&store),
            ),
        )
        .expect("orchestrator")
        .run(&SilentProgress)
        .await;

        assert_eq!(report.skipped_pages, vec![1]);
        assert_eq!(report.processed_successfully, 2);
        let stored: Vec<u32> = store.pages().into_iter().map(|(n, _)| n).collect();
        assert_eq!(stored, vec![2, 3]);

        let resumed = Checkpoint::open(&ckpt_path, 10).expect("reopen");
        assert!(resumed.is_processed(3));
        assert_eq!(resumed.processed_count(), 3);
        let _ = std::fs::remove_dir_all(ckpt_path.parent().expect("parent"));
    }

    #[tokio::test]
    async fn page_limit_truncates_sorted_pages() {
        let mut config = config();
        config.page_limit = Some(2);
        let store = Arc::new(RecordingStore::default());
        let report = Orchestrator::new(
            config,
            stages(
                ListedFiles(vec!["003.png", "002.png", "001.png"]),
                Arc::new(FakeDownloader::default()),
                Arc::clone(&store),
            ),
        )
        .expect("orchestrator")
        .run(&SilentProgress)
        .await;

        assert_eq!(report.total_pages, 2);
        let stored: Vec<u32> = store.pages().into_iter().map(|(n, _)| n).collect();
        assert_eq!(stored, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_ocr_times_out_as_its_own_category() {
        let mut config = config();
        config.timeouts.ocr_secs = 1;
        config.retry = RetryConfig::immediate(1);
        let stages = Stages {
            source: Arc::new(ListedFiles(vec!["001.png"])),
            downloader: Arc::new(FakeDownloader::default()),
            ocr: Arc::new(FakeOcr {
                delay: Some(Duration::from_secs(30)),
            }),
            store: Arc::new(RecordingStore::default()),
        };
        let report = Orchestrator::new(config, stages)
            .expect("orchestrator")
            .run(&SilentProgress)
            .await;

        let failed = &report.failed_pages[0];
        assert_eq!(failed.stage, "ocr");
        assert_eq!(failed.error_category, ErrorCategory::Timeout);
        assert_eq!(failed.attempts, 2);
    }

    #[tokio::test]
    async fn resources_are_released_after_the_run() {
        let orchestrator = Orchestrator::new(
            config(),
            stages(
                ListedFiles(vec!["001.png", "002.png"]),
                Arc::new(FakeDownloader::default()),
                Arc::new(RecordingStore::default()),
            ),
        )
        .expect("orchestrator");
        let resources = Arc::clone(orchestrator.resources());
        let report = orchestrator.run(&SilentProgress).await;

        assert_eq!(report.resource_usage.temp_files.created, 2);
        let stats = resources.stats();
        assert_eq!(stats.temp_files.active, 0);
        assert_eq!(stats.database.active_connections, 0);
        assert!(resources.job_dir().is_none());
    }

    #[test]
    fn blank_folder_is_rejected() {
        let stages = stages(
            ListedFiles(vec![]),
            Arc::new(FakeDownloader::default()),
            Arc::new(RecordingStore::default()),
        );
        let err = Orchestrator::new(IngestConfig::for_folder("  "), stages)
            .err()
            .expect("should reject");
        assert!(matches!(err, FolioError::Validation { .. }));
    }

    #[test]
    fn extension_is_normalized() {
        assert_eq!(extension_of("scan 001.PNG"), ".png");
        assert_eq!(extension_of("noext"), ".img");
    }
}
