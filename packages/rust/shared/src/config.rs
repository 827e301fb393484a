//! Application configuration for LeadEnrich.
//!
//! User config lives at `~/.leadenrich/leadenrich.toml`.
//! CLI flags override the environment, which overrides config file values,
//! which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LeadEnrichError, Result};
use crate::types::DEFAULT_DOMAIN_COLUMN;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "leadenrich.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".leadenrich";

/// Environment variable overriding the contact data root. The collaborator
/// subprocess also receives its run directory through it.
pub const CONTACT_DATA_ENV: &str = "CONTACT_DATA_PATH";

// ---------------------------------------------------------------------------
// Config structs (matching leadenrich.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Batch defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Per-row worker settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// External enrichment command.
    #[serde(default)]
    pub enricher: EnricherConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Input CSV with one company per row.
    #[serde(default = "default_input_csv")]
    pub input_csv: String,

    /// Output CSV receiving enriched rows.
    #[serde(default = "default_output_csv")]
    pub output_csv: String,

    /// Header of the column holding the company domain.
    #[serde(default = "default_domain_column")]
    pub domain_column: String,

    /// Number of rows enriched at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Total attempts per row before it is recorded as failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Checkpoint the output table every N completed rows.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            input_csv: default_input_csv(),
            output_csv: default_output_csv(),
            domain_column: default_domain_column(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            checkpoint_every: default_checkpoint_every(),
        }
    }
}

fn default_input_csv() -> String {
    "companies_data_1.csv".into()
}
fn default_output_csv() -> String {
    "companies_data_1_enriched.csv".into()
}
fn default_domain_column() -> String {
    DEFAULT_DOMAIN_COLUMN.into()
}
fn default_concurrency() -> u32 {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_checkpoint_every() -> u32 {
    5
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Wall-clock limit for one enrichment call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Base delay of the exponential retry backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Delay between row submissions.
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,

    /// Root for run directories and logs. `CONTACT_DATA_PATH` wins over this.
    #[serde(default = "default_contact_data_dir")]
    pub contact_data_dir: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            stagger_ms: default_stagger_ms(),
            contact_data_dir: default_contact_data_dir(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    120
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_stagger_ms() -> u64 {
    100
}
fn default_contact_data_dir() -> String {
    "contact_data".into()
}

/// `[enricher]` section: the collaborator invoked once per domain as
/// `<command> <args...> <domain>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnricherConfig {
    #[serde(default = "default_enricher_command")]
    pub command: String,

    #[serde(default = "default_enricher_args")]
    pub args: Vec<String>,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            command: default_enricher_command(),
            args: default_enricher_args(),
        }
    }
}

fn default_enricher_command() -> String {
    "python3".into()
}
fn default_enricher_args() -> Vec<String> {
    vec!["run_contact_agent.py".into()]
}

// ---------------------------------------------------------------------------
// Batch config (runtime, merged from config + env + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime batch configuration, merged from config file, environment and
/// CLI flags.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub input_csv: PathBuf,
    pub output_csv: PathBuf,
    pub domain_column: String,
    /// Worker pool size.
    pub concurrency: usize,
    /// Total attempt budget per row.
    pub max_retries: u32,
    pub checkpoint_every: usize,
    /// Per-call deadline.
    pub timeout: Duration,
    pub backoff_base: Duration,
    /// Delay between submissions, only to keep log output readable.
    pub stagger: Duration,
    /// Root for run directories and logs.
    pub contact_data_dir: PathBuf,
}

impl BatchConfig {
    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(LeadEnrichError::config("concurrency must be at least 1"));
        }
        if self.max_retries == 0 {
            return Err(LeadEnrichError::config("max_retries must be at least 1"));
        }
        if self.checkpoint_every == 0 {
            return Err(LeadEnrichError::config(
                "checkpoint_every must be at least 1",
            ));
        }
        if self.domain_column.trim().is_empty() {
            return Err(LeadEnrichError::config("domain column name is empty"));
        }
        if self.timeout.is_zero() {
            return Err(LeadEnrichError::config("timeout must be non-zero"));
        }
        Ok(())
    }
}

impl From<&AppConfig> for BatchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            input_csv: PathBuf::from(&config.defaults.input_csv),
            output_csv: PathBuf::from(&config.defaults.output_csv),
            domain_column: config.defaults.domain_column.clone(),
            concurrency: config.defaults.concurrency as usize,
            max_retries: config.defaults.max_retries,
            checkpoint_every: config.defaults.checkpoint_every as usize,
            timeout: Duration::from_secs(config.worker.timeout_secs),
            backoff_base: Duration::from_millis(config.worker.backoff_base_ms),
            stagger: Duration::from_millis(config.worker.stagger_ms),
            contact_data_dir: resolve_contact_data_dir(
                &config.worker,
                std::env::var(CONTACT_DATA_ENV).ok(),
            ),
        }
    }
}

/// Pick the contact data root: a non-empty env override wins over the
/// configured directory.
pub fn resolve_contact_data_dir(worker: &WorkerConfig, env_value: Option<String>) -> PathBuf {
    match env_value {
        Some(v) if !v.trim().is_empty() => PathBuf::from(v),
        _ => PathBuf::from(&worker.contact_data_dir),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.leadenrich/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LeadEnrichError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.leadenrich/leadenrich.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
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
    let content = std::fs::read_to_string(path).map_err(|e| LeadEnrichError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        LeadEnrichError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LeadEnrichError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LeadEnrichError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LeadEnrichError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("input_csv"));
        assert!(toml_str.contains("Company Domain (website url)"));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
concurrency = 8

[enricher]
command = "/usr/local/bin/find-contact"
args = []
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.concurrency, 8);
        assert_eq!(config.defaults.max_retries, 3);
        assert_eq!(config.worker.timeout_secs, 120);
        assert_eq!(config.enricher.command, "/usr/local/bin/find-contact");
        assert!(config.enricher.args.is_empty());
    }

    #[test]
    fn batch_config_from_app_config() {
        let app = AppConfig::default();
        let batch = BatchConfig::from(&app);
        assert_eq!(batch.concurrency, 2);
        assert_eq!(batch.max_retries, 3);
        assert_eq!(batch.checkpoint_every, 5);
        assert_eq!(batch.timeout, Duration::from_secs(120));
        assert_eq!(batch.stagger, Duration::from_millis(100));
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn contact_data_env_override() {
        let worker = WorkerConfig::default();
        assert_eq!(
            resolve_contact_data_dir(&worker, None),
            PathBuf::from("contact_data")
        );
        assert_eq!(
            resolve_contact_data_dir(&worker, Some("  ".into())),
            PathBuf::from("contact_data")
        );
        assert_eq!(
            resolve_contact_data_dir(&worker, Some("/data/contacts".into())),
            PathBuf::from("/data/contacts")
        );
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let mut batch = BatchConfig::from(&AppConfig::default());
        batch.concurrency = 0;
        let err = batch.validate().unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }
}
