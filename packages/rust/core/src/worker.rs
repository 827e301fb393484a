//! One enrichment attempt for one domain.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, instrument, warn};

use leadenrich_shared::{Contact, Result};

use crate::enricher::Enricher;
use crate::run_dir::{LogContext, RunDirectory, RunManifest};

/// Why an attempt produced no contact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerFailure {
    /// The enrichment call exceeded its deadline and was abandoned.
    #[error("enrichment timed out after {:.1}s", .after.as_secs_f64())]
    Timeout { after: Duration },

    /// The collaborator failed to start, exited non-zero, or left an
    /// unreadable contacts file.
    #[error("{0}")]
    ProcessFailure(String),

    /// The collaborator ran cleanly but found nobody.
    #[error("no contacts found")]
    NoResultsFound,
}

impl WorkerFailure {
    /// Timeouts and process failures are worth another attempt; an empty
    /// result is an answer.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NoResultsFound)
    }

    fn status(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::ProcessFailure(_) => "process_failure",
            Self::NoResultsFound => "no_contact",
        }
    }
}

/// Runs the enricher for a single domain inside a fresh run directory.
#[derive(Clone)]
pub struct EnrichmentWorker {
    enricher: Arc<dyn Enricher>,
    logs: LogContext,
    timeout: Duration,
}

impl EnrichmentWorker {
    pub fn new(enricher: Arc<dyn Enricher>, logs: LogContext, timeout: Duration) -> Self {
        Self {
            enricher,
            logs,
            timeout,
        }
    }

    /// Enrich `domain`. Returns the contacts in the order the collaborator
    /// wrote them; the first one is the best match.
    #[instrument(skip_all, fields(domain, attempt, enricher = self.enricher.name()))]
    pub async fn run(
        &self,
        domain: &str,
        attempt: u32,
    ) -> std::result::Result<Vec<Contact>, WorkerFailure> {
        let run_dir = RunDirectory::create(self.logs.root(), domain).map_err(|e| {
            WorkerFailure::ProcessFailure(format!("could not create run directory: {e}"))
        })?;
        let mut log = self.logs.open_run_log(&run_dir, attempt);

        let started_at = Utc::now();
        let started = Instant::now();

        let call = self.enricher.enrich(domain, &run_dir, &mut log);
        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => Err(WorkerFailure::Timeout {
                after: self.timeout,
            }),
            Ok(Err(e)) => Err(WorkerFailure::ProcessFailure(e.to_string())),
            Ok(Ok(())) => read_contacts(&run_dir.contacts_file())
                .map_err(|e| {
                    WorkerFailure::ProcessFailure(format!("unreadable contacts file: {e}"))
                })
                .and_then(|contacts| {
                    if contacts.is_empty() {
                        Err(WorkerFailure::NoResultsFound)
                    } else {
                        Ok(contacts)
                    }
                }),
        };

        match &outcome {
            Ok(contacts) => {
                log.info(format!("Found {} contacts", contacts.len()));
                for contact in contacts {
                    log.debug(format!(
                        "Contact: {} <{}>",
                        contact.display_name(),
                        contact.email.as_deref().unwrap_or("")
                    ));
                }
            }
            Err(WorkerFailure::NoResultsFound) => log.info("No contacts found"),
            Err(failure) => log.error(format!("Attempt failed: {failure}")),
        }

        let manifest = RunManifest {
            domain: domain.to_string(),
            attempt,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            status: match &outcome {
                Ok(_) => "succeeded".to_string(),
                Err(f) => f.status().to_string(),
            },
            error: outcome
                .as_ref()
                .err()
                .filter(|f| f.is_retryable())
                .map(ToString::to_string),
            contacts: outcome.as_ref().cloned().unwrap_or_default(),
        };
        if let Err(e) = run_dir.write_manifest(&manifest) {
            warn!(domain, error = %e, "could not write run manifest");
        }

        debug!(
            domain,
            attempt,
            status = %manifest.status,
            duration_ms = manifest.duration_ms,
            "attempt finished"
        );
        log.close();
        outcome
    }
}

/// Read the collaborator's contacts file. A missing file means no contacts;
/// fully blank rows are ignored.
pub fn read_contacts(path: &Path) -> Result<Vec<Contact>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let table = leadenrich_storage::read_table(path)?;
    Ok(table
        .rows
        .iter()
        .filter(|row| row.cells().iter().any(|(_, v)| !v.trim().is_empty()))
        .map(Contact::from_row)
        .collect())
}
