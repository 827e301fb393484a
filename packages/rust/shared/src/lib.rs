//! Shared types, error model, and configuration for LeadEnrich.
//!
//! This crate is the foundation depended on by all other LeadEnrich crates.
//! It provides:
//! - [`LeadEnrichError`]: the unified error type
//! - Table and contact types ([`Table`], [`Row`], [`Contact`])
//! - Configuration ([`AppConfig`], [`BatchConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BatchConfig, CONTACT_DATA_ENV, DefaultsConfig, EnricherConfig, WorkerConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from,
    resolve_contact_data_dir,
};
pub use error::{LeadEnrichError, Result};
pub use types::{
    Contact, DEFAULT_DOMAIN_COLUMN, Row, Table, columns, notes, row_key,
};
