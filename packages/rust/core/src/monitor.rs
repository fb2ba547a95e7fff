//! Per-run performance accounting: timing, coordination-call volume, and
//! OCR quality.
//!
//! The monitor is owned by a single orchestrator, so every method takes
//! `&mut self` and per-page recording is serialized by construction.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use folio_shared::ErrorCategory;

const HIGH_QUALITY_ABOVE: f64 = 0.8;
const LOW_QUALITY_BELOW: f64 = 0.6;

/// Everything recorded about one page.
#[derive(Debug, Clone, Serialize)]
pub struct PageMetrics {
    pub page_number: u32,
    pub file_name: String,
    pub started_at: DateTime<Utc>,
    pub total_time_secs: f64,
    /// Elapsed seconds per named operation (`download`, `ocr`, `storage`).
    pub operations: BTreeMap<String, f64>,
    pub llm_calls: u32,
    pub tokens_used: u64,
    pub ocr_passes: u32,
    pub file_size_bytes: u64,
    pub text_length: usize,
    pub quality_score: Option<f64>,
    pub unclear_count: usize,
    pub requires_review: bool,
    pub errors: Vec<String>,
    pub retries: u32,
    pub success: bool,
    pub exceeded_llm_limit: bool,
}

struct OpenPage {
    metrics: PageMetrics,
    started: Instant,
    operations: HashMap<String, Instant>,
}

#[derive(Default)]
struct Totals {
    pages: usize,
    successful: usize,
    failed: usize,
    llm_calls: u64,
    tokens: u64,
    ocr_passes: u64,
    db_transactions: u64,
    db_time_secs: f64,
    db_errors: u64,
    retries: u64,
    errors_by_category: BTreeMap<ErrorCategory, usize>,
    quality_sum: f64,
    quality_count: usize,
    high_quality: usize,
    low_quality: usize,
    requiring_review: usize,
    bytes: u64,
    text_chars: u64,
}

/// Running counters returned by [`PerformanceMonitor::current_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct CurrentStats {
    pub pages_started: usize,
    pub successful_pages: usize,
    pub failed_pages: usize,
    pub llm_calls: u64,
    pub elapsed_secs: f64,
    pub current_page: Option<u32>,
}

pub struct PerformanceMonitor {
    max_llm_calls_per_page: u32,
    started: Instant,
    current: Option<OpenPage>,
    pages: Vec<PageMetrics>,
    totals: Totals,
}

impl PerformanceMonitor {
    pub fn new(max_llm_calls_per_page: u32) -> Self {
        Self {
            max_llm_calls_per_page,
            started: Instant::now(),
            current: None,
            pages: Vec::new(),
            totals: Totals::default(),
        }
    }

    /// Open a page. An unfinished previous page is closed as failed.
    pub fn start_page(&mut self, page_number: u32, file_name: &str) {
        if let Some(open) = &self.current {
            warn!(
                page = open.metrics.page_number,
                "page was never ended; closing it as failed"
            );
            self.end_page(false);
        }
        self.totals.pages += 1;
        self.current = Some(OpenPage {
            metrics: PageMetrics {
                page_number,
                file_name: file_name.to_string(),
                started_at: Utc::now(),
                total_time_secs: 0.0,
                operations: BTreeMap::new(),
                llm_calls: 0,
                tokens_used: 0,
                ocr_passes: 0,
                file_size_bytes: 0,
                text_length: 0,
                quality_score: None,
                unclear_count: 0,
                requires_review: false,
                errors: Vec::new(),
                retries: 0,
                success: false,
                exceeded_llm_limit: false,
            },
            started: Instant::now(),
            operations: HashMap::new(),
        });
        debug!(page = page_number, file = file_name, "page started");
    }

    /// Close the current page and fold it into the run totals.
    pub fn end_page(&mut self, success: bool) {
        let Some(open) = self.current.take() else {
            warn!("end_page called with no page in progress");
            return;
        };
        let mut m = open.metrics;
        m.total_time_secs = open.started.elapsed().as_secs_f64();
        m.success = success;

        if success {
            self.totals.successful += 1;
        } else {
            self.totals.failed += 1;
        }

        if m.llm_calls > self.max_llm_calls_per_page {
            m.exceeded_llm_limit = true;
            warn!(
                page = m.page_number,
                calls = m.llm_calls,
                limit = self.max_llm_calls_per_page,
                "page exceeded coordination-call limit"
            );
        }

        if let Some(score) = m.quality_score {
            self.totals.quality_sum += score;
            self.totals.quality_count += 1;
            if score > HIGH_QUALITY_ABOVE {
                self.totals.high_quality += 1;
            } else if score < LOW_QUALITY_BELOW {
                self.totals.low_quality += 1;
            }
        }
        if m.requires_review {
            self.totals.requiring_review += 1;
        }

        debug!(
            page = m.page_number,
            success,
            secs = m.total_time_secs,
            llm_calls = m.llm_calls,
            "page ended"
        );
        self.pages.push(m);
    }

    pub fn start_operation(&mut self, name: &str) {
        match &mut self.current {
            Some(open) => {
                open.operations.insert(name.to_string(), Instant::now());
            }
            None => warn!(operation = name, "operation started outside a page"),
        }
    }

    /// Seconds since the matching [`Self::start_operation`], or zero (with a
    /// warning) when there was none.
    pub fn end_operation(&mut self, name: &str) -> f64 {
        let Some(open) = &mut self.current else {
            warn!(operation = name, "operation ended outside a page");
            return 0.0;
        };
        let Some(started) = open.operations.remove(name) else {
            warn!(operation = name, "operation ended without being started");
            return 0.0;
        };
        let elapsed = started.elapsed().as_secs_f64();
        *open.metrics.operations.entry(name.to_string()).or_default() += elapsed;

        if name == "storage" {
            self.totals.db_transactions += 1;
            self.totals.db_time_secs += elapsed;
        }
        elapsed
    }

    fn page(&mut self) -> Option<&mut PageMetrics> {
        self.current.as_mut().map(|open| &mut open.metrics)
    }

    /// Count one coordination call against the current page.
    pub fn record_llm_call(&mut self, tokens: u64) {
        self.totals.llm_calls += 1;
        self.totals.tokens += tokens;
        if let Some(m) = self.page() {
            m.llm_calls += 1;
            m.tokens_used += tokens;
        }
    }

    pub fn record_ocr_pass(&mut self) {
        self.totals.ocr_passes += 1;
        if let Some(m) = self.page() {
            m.ocr_passes += 1;
        }
    }

    pub fn record_file_metrics(&mut self, size_bytes: u64, text_length: usize) {
        self.totals.bytes += size_bytes;
        self.totals.text_chars += text_length as u64;
        if let Some(m) = self.page() {
            m.file_size_bytes = size_bytes;
            m.text_length = text_length;
        }
    }

    pub fn record_quality_metrics(&mut self, score: f64, unclear_count: usize, requires_review: bool) {
        if let Some(m) = self.page() {
            m.quality_score = Some(score);
            m.unclear_count = unclear_count;
            m.requires_review = requires_review;
        }
    }

    pub fn record_error(&mut self, category: ErrorCategory, message: &str) {
        *self.totals.errors_by_category.entry(category).or_default() += 1;
        let is_storage = matches!(
            category,
            ErrorCategory::Persistence | ErrorCategory::StorageService
        );
        if is_storage {
            self.totals.db_errors += 1;
        }
        if let Some(m) = self.page() {
            m.errors.push(format!("{category}: {message}"));
        }
    }

    pub fn record_retry(&mut self) {
        self.totals.retries += 1;
        if let Some(m) = self.page() {
            m.retries += 1;
        }
    }

    pub fn current_stats(&self) -> CurrentStats {
        CurrentStats {
            pages_started: self.totals.pages,
            successful_pages: self.totals.successful,
            failed_pages: self.totals.failed,
            llm_calls: self.totals.llm_calls,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            current_page: self.current.as_ref().map(|o| o.metrics.page_number),
        }
    }

    /// Compute the run report. Consumes the monitor; a page still open is
    /// closed as failed first.
    pub fn finalize(mut self) -> RunReport {
        if self.current.is_some() {
            self.end_page(false);
        }
        let t = &self.totals;
        let total_time = self.started.elapsed().as_secs_f64();
        let page_times: Vec<f64> = self.pages.iter().map(|p| p.total_time_secs).collect();
        let finished = self.pages.len();

        let exceeding: Vec<u32> = self
            .pages
            .iter()
            .filter(|p| p.exceeded_llm_limit)
            .map(|p| p.page_number)
            .collect();

        RunReport {
            summary: SummarySection {
                total_pages: t.pages,
                successful_pages: t.successful,
                failed_pages: t.failed,
                success_rate: format!("{:.1}%", ratio(t.successful as f64, t.pages) * 100.0),
            },
            timing: TimingSection {
                total_execution_time_secs: total_time,
                average_page_time_secs: ratio(page_times.iter().sum(), finished),
                fastest_page_time_secs: page_times.iter().copied().reduce(f64::min).unwrap_or(0.0),
                slowest_page_time_secs: page_times.iter().copied().reduce(f64::max).unwrap_or(0.0),
            },
            llm_usage: LlmUsageSection {
                total_calls: t.llm_calls,
                total_tokens: t.tokens,
                average_calls_per_page: ratio(t.llm_calls as f64, finished),
                max_calls_per_page: self.max_llm_calls_per_page,
                pages_exceeding_limit: exceeding.len(),
                compliance: if exceeding.is_empty() { "PASS" } else { "FAIL" }.to_string(),
            },
            pages_exceeding_llm_limit: exceeding,
            ocr: OcrSection {
                total_passes: t.ocr_passes,
                average_passes_per_page: ratio(t.ocr_passes as f64, finished),
            },
            database: DatabaseSection {
                total_transactions: t.db_transactions,
                average_time_secs: ratio(t.db_time_secs, t.db_transactions as usize),
                errors: t.db_errors,
            },
            quality: QualitySection {
                average_score: ratio(t.quality_sum, t.quality_count),
                high_quality_pages: t.high_quality,
                low_quality_pages: t.low_quality,
                requiring_review: t.requiring_review,
            },
            errors: ErrorSection {
                total_errors: t.errors_by_category.values().sum(),
                total_retries: t.retries,
                by_category: t.errors_by_category.clone(),
            },
            files: FileSection {
                total_bytes: t.bytes,
                total_text_chars: t.text_chars,
            },
            page_details: self.pages,
        }
    }
}

fn ratio(total: f64, count: usize) -> f64 {
    if count == 0 { 0.0 } else { total / count as f64 }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SummarySection {
    pub total_pages: usize,
    pub successful_pages: usize,
    pub failed_pages: usize,
    pub success_rate: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingSection {
    pub total_execution_time_secs: f64,
    pub average_page_time_secs: f64,
    pub fastest_page_time_secs: f64,
    pub slowest_page_time_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmUsageSection {
    pub total_calls: u64,
    pub total_tokens: u64,
    pub average_calls_per_page: f64,
    pub max_calls_per_page: u32,
    pub pages_exceeding_limit: usize,
    /// `PASS` when no page went over the per-page ceiling, else `FAIL`.
    pub compliance: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OcrSection {
    pub total_passes: u64,
    pub average_passes_per_page: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSection {
    pub total_transactions: u64,
    pub average_time_secs: f64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualitySection {
    pub average_score: f64,
    pub high_quality_pages: usize,
    pub low_quality_pages: usize,
    pub requiring_review: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSection {
    pub total_errors: usize,
    pub total_retries: u64,
    pub by_category: BTreeMap<ErrorCategory, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSection {
    pub total_bytes: u64,
    pub total_text_chars: u64,
}

/// Run-level aggregates produced by [`PerformanceMonitor::finalize`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub summary: SummarySection,
    pub timing: TimingSection,
    pub llm_usage: LlmUsageSection,
    /// Page numbers whose coordination calls exceeded the ceiling.
    pub pages_exceeding_llm_limit: Vec<u32>,
    pub ocr: OcrSection,
    pub database: DatabaseSection,
    pub quality: QualitySection,
    pub errors: ErrorSection,
    pub files: FileSection,
    pub page_details: Vec<PageMetrics>,
}

impl RunReport {
    /// Human-readable summary in the log.
    pub fn log_summary(&self) {
        let rule = "=".repeat(60);
        info!("{rule}");
        info!("PERFORMANCE SUMMARY");
        info!("{rule}");
        info!(
            "pages: {} total, {} ok, {} failed ({})",
            self.summary.total_pages,
            self.summary.successful_pages,
            self.summary.failed_pages,
            self.summary.success_rate
        );
        info!(
            "timing: {:.1}s total, {:.2}s avg/page (fastest {:.2}s, slowest {:.2}s)",
            self.timing.total_execution_time_secs,
            self.timing.average_page_time_secs,
            self.timing.fastest_page_time_secs,
            self.timing.slowest_page_time_secs
        );
        info!(
            "coordination calls: {} total, {:.2}/page, limit {}/page: {}",
            self.llm_usage.total_calls,
            self.llm_usage.average_calls_per_page,
            self.llm_usage.max_calls_per_page,
            self.llm_usage.compliance
        );
        if !self.pages_exceeding_llm_limit.is_empty() {
            warn!("pages over limit: {:?}", self.pages_exceeding_llm_limit);
        }
        info!(
            "quality: {:.2} avg, {} high, {} low, {} for review",
            self.quality.average_score,
            self.quality.high_quality_pages,
            self.quality.low_quality_pages,
            self.quality.requiring_review
        );
        info!("{rule}");
    }
}
