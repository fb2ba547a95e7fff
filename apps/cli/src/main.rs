//! Folio CLI: OCR ingestion of scanned book pages.
//!
//! Lists a folder of page images, orders them by the page number in their
//! filenames, transcribes each page with a vision model, and stores the text.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
