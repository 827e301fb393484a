//! Core orchestration for LeadEnrich.
//!
//! Ties together the enrichment collaborator, per-domain workers, the retry
//! policy and the batch scheduler that drives them over an input table.

pub mod enricher;
pub mod retry;
pub mod run_dir;
pub mod scheduler;
pub mod worker;

pub use enricher::{CommandEnricher, Enricher, EnricherError};
pub use retry::{RetryOutcome, RetryPolicy};
pub use run_dir::{LogContext, RunDirectory, RunLog, RunManifest};
pub use scheduler::{BatchProgress, BatchReport, BatchScheduler, RowStatus, SilentProgress};
pub use worker::{EnrichmentWorker, WorkerFailure};
