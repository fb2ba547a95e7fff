//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use folio_adapters::{
    HttpDownloader, HttpFileSource, LibsqlPageStore, LocalDownloader, LocalFolderSource, VisionOcr,
};
use folio_core::pipeline::PageOutcome;
use folio_core::stages::{Downloader, FileSource};
use folio_core::{
    FilenameParser, IngestReport, ManagedConnection, Orchestrator, ProgressReporter, RunStatus,
    Stages, validate_sequence,
};
use folio_shared::{
    AppConfig, IngestConfig, PageFile, expand_home, init_config, load_config, ocr_api_key,
    source_token,
};
use folio_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Folio: transcribe folders of scanned book pages into a searchable store.
#[derive(Parser)]
#[command(
    name = "folio",
    version,
    about = "OCR-ingest folders of scanned book pages, in page order, into a local database.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.folio/folio.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Transcribe and store every page in a folder.
    Ingest(IngestArgs),

    /// Show the page order and sequence issues for a folder without processing it.
    Plan {
        /// Folder reference (local path, or remote folder id with [source].base_url).
        folder: String,
    },

    /// List the stored pages of a book.
    Pages {
        /// Book key the pages were stored under.
        book_key: String,
    },

    /// Full-text search within a book's pages.
    Search {
        book_key: String,
        query: String,

        #[arg(short, long, default_value = "10")]
        limit: u32,
    },

    /// Show the recorded outcome of an ingestion run.
    Job {
        /// Job id printed at the end of `folio ingest`.
        id: String,
    },

    /// Delete every stored page of a book.
    Forget { book_key: String },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
pub(crate) struct IngestArgs {
    /// Folder reference (local path, or remote folder id with [source].base_url).
    folder: String,

    /// Client / owner id recorded on every stored page.
    #[arg(long, env = "FOLIO_CLIENT", default_value = "")]
    client: String,

    /// Book key pages are stored under (defaults to the folder reference).
    #[arg(long)]
    book_key: Option<String>,

    /// Language code of the text.
    #[arg(long)]
    language: Option<String>,

    /// Process at most this many pages (in page order).
    #[arg(long)]
    limit: Option<usize>,

    /// Checkpoint file; pages recorded there are skipped.
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Write the JSON report here.
    #[arg(long)]
    report: Option<PathBuf>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "folio=info",
        1 => "folio=debug",
        _ => "folio=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => folio_shared::load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Ingest(args) => cmd_ingest(&config, args).await,
        Command::Plan { folder } => cmd_plan(&config, &folder).await,
        Command::Pages { book_key } => cmd_pages(&config, &book_key).await,
        Command::Search {
            book_key,
            query,
            limit,
        } => cmd_search(&config, &book_key, &query, limit).await,
        Command::Job { id } => cmd_job(&config, &id).await,
        Command::Forget { book_key } => cmd_forget(&config, &book_key).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Listing and download adapters: remote when `[source].base_url` is set.
fn source_stages(config: &AppConfig) -> Result<(Arc<dyn FileSource>, Arc<dyn Downloader>)> {
    let Some(base) = &config.source.base_url else {
        let source: Arc<dyn FileSource> = Arc::new(LocalFolderSource);
        let downloader: Arc<dyn Downloader> = Arc::new(LocalDownloader);
        return Ok((source, downloader));
    };
    let token = source_token(config);
    let source: Arc<dyn FileSource> = Arc::new(HttpFileSource::new(base, token.clone())?);
    let downloader: Arc<dyn Downloader> = Arc::new(HttpDownloader::new(base, token)?);
    Ok((source, downloader))
}

fn db_path(config: &AppConfig) -> Result<PathBuf> {
    Ok(expand_home(&config.storage.db_path)?)
}

async fn open_readonly(config: &AppConfig) -> Result<Storage> {
    let path = db_path(config)?;
    if !path.exists() {
        return Err(eyre!(
            "no database at {} (run `folio ingest` first)",
            path.display()
        ));
    }
    Ok(Storage::open_readonly(&path).await?)
}

// ---------------------------------------------------------------------------
// ingest
// ---------------------------------------------------------------------------

async fn cmd_ingest(app: &AppConfig, args: IngestArgs) -> Result<()> {
    // Fail on a missing key before touching any files.
    let api_key = ocr_api_key(app)?;

    let mut config = IngestConfig::from(app);
    config.folder = args.folder;
    config.client_user_id = args.client;
    config.book_key = args.book_key.unwrap_or_else(|| config.folder.clone());
    if let Some(language) = args.language {
        config.language_code = language;
    }
    if args.limit.is_some() {
        config.page_limit = args.limit;
    }
    if args.checkpoint.is_some() {
        config.checkpoint_path = args.checkpoint;
    }

    let path = db_path(app)?;
    let storage = Arc::new(Storage::open(&path).await?);
    // Separate handle: the run closes the page store's connection on exit.
    let history = Storage::open(&path).await?;
    let store = Arc::new(LibsqlPageStore::new(storage));

    let (source, downloader) = source_stages(app)?;
    let stages = Stages {
        source,
        downloader,
        ocr: Arc::new(VisionOcr::new(&app.ocr, api_key)?),
        store: store.clone(),
    };

    let (folder, client, book_key) = (
        config.folder.clone(),
        config.client_user_id.clone(),
        config.book_key.clone(),
    );
    let orchestrator = Orchestrator::new(config, stages)?;
    orchestrator
        .resources()
        .get_db_connection("pages", || Ok(store as Arc<dyn ManagedConnection>))?;

    let job_id = orchestrator.job_id().to_string();
    history
        .insert_ingest_job(&job_id, &client, &book_key, &folder)
        .await?;
    info!(%job_id, %folder, %book_key, "ingestion job started");

    let progress = CliProgress::new();
    let report = orchestrator.run(&progress).await;

    let report_json = serde_json::to_string_pretty(&report)?;
    history
        .finish_ingest_job(&job_id, report.status.as_str(), &report_json)
        .await?;
    history.close()?;

    if let Some(out) = &args.report {
        std::fs::write(out, &report_json)
            .map_err(|e| eyre!("failed to write report to {}: {e}", out.display()))?;
        info!(path = %out.display(), "report written");
    }

    print_summary(&report);

    match report.status {
        RunStatus::Error => Err(eyre!(
            "ingestion failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        )),
        RunStatus::Stopped => Err(eyre!(
            "ingestion stopped early: {}",
            report.stop_reason.as_deref().unwrap_or("circuit breaker")
        )),
        RunStatus::Completed => Ok(()),
    }
}

fn print_summary(report: &IngestReport) {
    println!();
    println!("  Job:        {}", report.job_id);
    println!("  Status:     {}", report.status.as_str());
    println!("  Book:       {}", report.book_key);
    println!(
        "  Pages:      {} ok, {} failed, {} skipped (of {})",
        report.processed_successfully,
        report.failed,
        report.skipped_pages.len(),
        report.total_pages
    );
    println!(
        "  Quality:    {:.2} avg, {} need review",
        report.quality_metrics.average_quality_score,
        report.quality_metrics.pages_requiring_review.len()
    );
    println!(
        "  Time:       {} ({} per page)",
        report.processing_time, report.average_time_per_page
    );
    if let Some(perf) = &report.performance_metrics {
        println!(
            "  LLM calls:  {} total, max {} per page ({})",
            perf.llm_usage.total_calls, perf.llm_usage.max_calls_per_page, perf.llm_usage.compliance
        );
    }
    for failure in &report.failed_pages {
        println!(
            "  ! page {} ({}) failed at {}: [{}] {}",
            failure.page_number,
            failure.file_name,
            failure.stage,
            failure.error_category,
            failure.error
        );
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter: a spinner for phases, a bar once pages start.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .map(|s| s.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]))
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn page_started(&self, page: &PageFile, current: usize, total: usize) {
        if self.bar.length() != Some(total as u64) {
            self.bar.set_length(total as u64);
            self.bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} eta {eta} {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
        }
        self.bar.set_position(current.saturating_sub(1) as u64);
        self.bar
            .set_message(format!("page {} ({})", page.page_number, page.file_name));
    }

    fn page_finished(&self, outcome: &PageOutcome, current: usize, _total: usize) {
        self.bar.set_position(current as u64);
        if let PageOutcome::Failed(failure) = outcome {
            self.bar.println(format!(
                "  page {} failed: {}",
                failure.page_number, failure.error
            ));
        }
    }

    fn done(&self, _report: &IngestReport) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// plan
// ---------------------------------------------------------------------------

async fn cmd_plan(app: &AppConfig, folder: &str) -> Result<()> {
    let config = IngestConfig::from(app);
    let (source, _) = source_stages(app)?;

    let listed = source.list_files(folder, "").await?;
    let images: Vec<_> = listed
        .into_iter()
        .filter(|f| f.has_extension(&config.image_extensions))
        .collect();
    if images.is_empty() {
        return Err(eyre!("no image files found in {folder}"));
    }

    let parser = FilenameParser::new(&config.group_prefix, config.group_size)?;
    let pages = parser.sort(&images);
    let issues = validate_sequence(&pages, config.max_gap);

    println!("{:>6}  {:>5}  {:<10}  file", "page", "conf", "format");
    for page in &pages {
        println!(
            "{:>6}  {:>5.2}  {:<10}  {}",
            page.page_number,
            page.confidence,
            page.format.to_string(),
            page.file_name
        );
    }
    println!();
    println!("{} pages", pages.len());

    if issues.is_empty() {
        println!("no sequence issues");
    }
    for issue in &issues {
        println!("[{:?}] {}", issue.severity, issue.message);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stored data
// ---------------------------------------------------------------------------

async fn cmd_pages(app: &AppConfig, book_key: &str) -> Result<()> {
    let storage = open_readonly(app).await?;
    let pages = storage.list_book_pages(book_key).await?;
    if pages.is_empty() {
        println!("no pages stored for {book_key}");
        return Ok(());
    }
    for page in &pages {
        println!(
            "{:>6}  {:<4}  {:>7} chars  {}",
            page.page_number,
            page.language_code,
            page.page_text.chars().count(),
            page.file_name
        );
    }
    println!("{} pages", pages.len());
    Ok(())
}

async fn cmd_search(app: &AppConfig, book_key: &str, query: &str, limit: u32) -> Result<()> {
    let storage = open_readonly(app).await?;
    let hits = storage.search(book_key, query, limit).await?;
    if hits.is_empty() {
        println!("no matches");
    }
    for hit in hits {
        println!("{:>6}  {:>8.3}  {}", hit.page_number, hit.score, hit.file_name);
    }
    Ok(())
}

async fn cmd_job(app: &AppConfig, id: &str) -> Result<()> {
    let storage = open_readonly(app).await?;
    let job = storage
        .get_ingest_job(id)
        .await?
        .ok_or_else(|| eyre!("no ingestion job with id {id}"))?;

    println!("Job:      {}", job.id);
    println!("Book:     {} ({})", job.book_key, job.folder);
    println!("Status:   {}", job.status);
    println!("Started:  {}", job.started_at);
    if let Some(finished) = &job.finished_at {
        println!("Finished: {finished}");
    }
    if let Some(report) = &job.report_json {
        println!();
        println!("{report}");
    }
    Ok(())
}

async fn cmd_forget(app: &AppConfig, book_key: &str) -> Result<()> {
    let path = db_path(app)?;
    if !path.exists() {
        warn!(path = %path.display(), "no database, nothing to delete");
        return Ok(());
    }
    let storage = Storage::open(&path).await?;
    let removed = storage.delete_book(book_key).await?;
    println!("removed {removed} pages of {book_key}");
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}
