//! CLI command definitions, routing, and tracing setup.

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use leadenrich_core::{
    BatchProgress, BatchReport, BatchScheduler, CommandEnricher, LogContext, RowStatus,
};
use leadenrich_shared::{
    AppConfig, BatchConfig, CONTACT_DATA_ENV, init_config, load_config, resolve_contact_data_dir,
};
use leadenrich_storage::ContactStore;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// LeadEnrich: find a contact for every company in a CSV.
#[derive(Parser)]
#[command(
    name = "leadenrich",
    version,
    about = "Enrich a CSV of companies with contacts, concurrently and resumably.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

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
    /// Enrich every unprocessed company in the input CSV.
    Run(RunArgs),

    /// List domains the output CSV already holds a contact for.
    Processed {
        /// Enriched output CSV.
        #[arg(long, alias = "output_csv")]
        output_csv: Option<PathBuf>,

        /// Header of the company domain column.
        #[arg(long)]
        domain_column: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Flags for `run`. Unset flags fall back to the config file.
#[derive(clap::Args, Default)]
pub(crate) struct RunArgs {
    /// Input CSV with one company per row.
    #[arg(long, alias = "input_csv")]
    pub input_csv: Option<PathBuf>,

    /// Output CSV receiving enriched rows.
    #[arg(long, alias = "output_csv")]
    pub output_csv: Option<PathBuf>,

    /// Number of companies enriched at once.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Total attempts per company.
    #[arg(long, alias = "max_retries")]
    pub max_retries: Option<u32>,

    /// Deadline for one enrichment call, in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Checkpoint the output every N completed rows.
    #[arg(long)]
    pub checkpoint_every: Option<usize>,

    /// Header of the company domain column.
    #[arg(long)]
    pub domain_column: Option<String>,

    /// Root for per-run directories and logs.
    #[arg(long)]
    pub contact_data_dir: Option<PathBuf>,

    /// Enrichment command, e.g. "python3 run_contact_agent.py". The domain is
    /// appended as the last argument.
    #[arg(long)]
    pub enricher_cmd: Option<String>,
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

/// Pipeline log file for `run`, under `<contact data root>/logs/pipeline/`.
/// Best effort: logging to the console still works without it.
pub(crate) fn pipeline_log_file(cli: &Cli) -> Option<File> {
    let Command::Run(args) = &cli.command else {
        return None;
    };
    let root = args.contact_data_dir.clone().unwrap_or_else(|| {
        let config = load_config().unwrap_or_default();
        resolve_contact_data_dir(&config.worker, std::env::var(CONTACT_DATA_ENV).ok())
    });
    let path = LogContext::new(root).pipeline_log_path("enrichment").ok()?;
    File::create(path).ok()
}

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli, log_file: Option<File>) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match cli.verbose {
        0 => "leadenrich=info",
        1 => "leadenrich=debug",
        _ => "leadenrich=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    fn file_layer<S>(log_file: Option<File>) -> Option<impl tracing_subscriber::Layer<S>>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        log_file.map(|file| {
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file))
        })
    }

    match cli.log_format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(false))
                .with(file_layer(log_file))
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .with(file_layer(log_file))
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Processed {
            output_csv,
            domain_column,
        } => cmd_processed(output_csv, domain_column).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Merge config-file values with `run` flags.
fn resolve_run_config(config: &AppConfig, args: &RunArgs) -> Result<(BatchConfig, CommandEnricher)> {
    let mut batch = BatchConfig::from(config);

    if let Some(p) = &args.input_csv {
        batch.input_csv = p.clone();
    }
    if let Some(p) = &args.output_csv {
        batch.output_csv = p.clone();
    }
    if let Some(n) = args.concurrency {
        batch.concurrency = n;
    }
    if let Some(n) = args.max_retries {
        batch.max_retries = n;
    }
    if let Some(secs) = args.timeout_secs {
        batch.timeout = Duration::from_secs(secs);
    }
    if let Some(n) = args.checkpoint_every {
        batch.checkpoint_every = n;
    }
    if let Some(c) = &args.domain_column {
        batch.domain_column = c.clone();
    }
    if let Some(p) = &args.contact_data_dir {
        batch.contact_data_dir = p.clone();
    }

    let enricher = match &args.enricher_cmd {
        Some(cmd) => {
            let mut parts = cmd.split_whitespace().map(String::from);
            let program = parts
                .next()
                .ok_or_else(|| eyre!("--enricher-cmd is empty"))?;
            CommandEnricher::new(program, parts.collect())
        }
        None => CommandEnricher::from_config(&config.enricher),
    };

    batch.validate()?;
    Ok((batch, enricher))
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let config = load_config()?;
    let (batch, enricher) = resolve_run_config(&config, &args)?;

    if !batch.input_csv.exists() {
        return Err(eyre!(
            "input file '{}' not found",
            batch.input_csv.display()
        ));
    }

    info!(
        input = %batch.input_csv.display(),
        output = %batch.output_csv.display(),
        concurrency = batch.concurrency,
        max_retries = batch.max_retries,
        contact_data = %batch.contact_data_dir.display(),
        "starting enrichment"
    );

    let scheduler = BatchScheduler::new(batch, Arc::new(enricher))?;
    let reporter = CliProgress::new();
    let report = scheduler.run(&reporter).await?;

    print_report(&report);
    Ok(())
}

fn print_report(report: &BatchReport) {
    println!();
    if report.nothing_to_do {
        println!("  All companies have already been processed. Nothing to do.");
        println!("  Output: {}", report.output_path.display());
        println!();
        return;
    }

    println!("  Enrichment complete!");
    println!("  Input rows:        {}", report.input_rows);
    println!("  Already processed: {}", report.already_processed);
    if report.duplicates > 0 {
        println!("  Duplicates:        {}", report.duplicates);
    }
    println!("  Enriched:          {}", report.succeeded);
    println!("  No contact:        {}", report.no_contact);
    println!("  Failed:            {}", report.failed);
    println!("  Skipped:           {}", report.skipped);
    println!("  Output rows:       {}", report.output_rows);
    println!("  Output:            {}", report.output_path.display());
    println!("  Time:              {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
                .progress_chars("=> "),
        );
        Self { bar }
    }
}

impl BatchProgress for CliProgress {
    fn started(&self, to_process: usize, already_processed: usize) {
        self.bar.set_length(to_process as u64);
        self.bar.enable_steady_tick(Duration::from_millis(80));
        if already_processed > 0 {
            self.bar
                .println(format!("  Skipping {already_processed} already processed companies"));
        }
    }

    fn row_dispatched(&self, domain: &str) {
        self.bar.set_message(format!("Enriching {domain}"));
    }

    fn row_finished(&self, domain: &str, status: RowStatus, done: usize, _total: usize) {
        self.bar.set_position(done as u64);
        let label = match status {
            RowStatus::Succeeded => "found contact",
            RowStatus::NoContact => "no contact",
            RowStatus::Failed => "failed",
            RowStatus::Skipped => "skipped (no domain)",
        };
        if !domain.is_empty() {
            self.bar.set_message(format!("{domain}: {label}"));
        }
    }

    fn checkpoint(&self, rows_written: usize) {
        self.bar
            .set_message(format!("Checkpoint: saved {rows_written} rows"));
    }

    fn done(&self, _report: &BatchReport) {
        self.bar.finish_and_clear();
    }
}

async fn cmd_processed(output_csv: Option<PathBuf>, domain_column: Option<String>) -> Result<()> {
    let config = load_config()?;
    let output = output_csv.unwrap_or_else(|| PathBuf::from(&config.defaults.output_csv));
    let column = domain_column.unwrap_or_else(|| config.defaults.domain_column.clone());

    if !output.exists() {
        warn!(output = %output.display(), "output file does not exist yet");
    }

    let store = ContactStore::new(&output, column);
    let mut domains: Vec<String> = store.processed_domains()?.into_iter().collect();
    domains.sort();

    for domain in &domains {
        println!("{domain}");
    }
    info!(count = domains.len(), "processed domains");
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
