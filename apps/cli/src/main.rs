//! LeadEnrich CLI: concurrent, resumable contact enrichment for company lists.
//!
//! Reads a CSV of companies, asks an external enrichment command for the best
//! contact at each domain, and merges the results into an output CSV.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let log_file = commands::pipeline_log_file(&cli);
    commands::init_tracing(&cli, log_file);
    commands::run(cli).await
}
