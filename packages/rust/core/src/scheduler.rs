//! Batch driver: input table → unprocessed subset → bounded worker pool →
//! checkpoints → merged output table.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use leadenrich_shared::{
    BatchConfig, LeadEnrichError, Result, Row, Table, columns, notes, row_key,
};
use leadenrich_storage::{ContactStore, processed_in, read_table, write_table_atomic};

use crate::enricher::Enricher;
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::run_dir::LogContext;
use crate::worker::{EnrichmentWorker, WorkerFailure};

/// Terminal state of a row in one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Succeeded,
    NoContact,
    Failed,
    /// Never dispatched: the row has no company domain.
    Skipped,
}

/// Aggregate result of [`BatchScheduler::run`].
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub input_rows: usize,
    /// Rows already present in the output table with a usable contact.
    pub already_processed: usize,
    /// Later input rows repeating an earlier row's domain.
    pub duplicates: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub no_contact: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Rows in the output table after the final write.
    pub output_rows: usize,
    pub elapsed: Duration,
    pub output_path: PathBuf,
    /// True when every input row was already handled. The output is left
    /// untouched unless it held duplicate rows, which are collapsed.
    pub nothing_to_do: bool,
}

/// Progress callback for batch status.
pub trait BatchProgress: Send + Sync {
    /// Called once the work list is known.
    fn started(&self, to_process: usize, already_processed: usize);
    /// Called when a row is handed to the pool.
    fn row_dispatched(&self, domain: &str);
    /// Called when a row reaches a terminal state.
    fn row_finished(&self, domain: &str, status: RowStatus, done: usize, total: usize);
    /// Called after a checkpoint write.
    fn checkpoint(&self, rows_written: usize);
    /// Called when the batch completes.
    fn done(&self, report: &BatchReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl BatchProgress for SilentProgress {
    fn started(&self, _to_process: usize, _already_processed: usize) {}
    fn row_dispatched(&self, _domain: &str) {}
    fn row_finished(&self, _domain: &str, _status: RowStatus, _done: usize, _total: usize) {}
    fn checkpoint(&self, _rows_written: usize) {}
    fn done(&self, _report: &BatchReport) {}
}

/// A row selected for enrichment.
#[derive(Debug, Clone)]
struct PendingRow {
    domain: String,
    row: Row,
}

/// Input rows sorted by what the batch will do with them.
#[derive(Debug, Default)]
struct WorkPlan {
    pending: Vec<PendingRow>,
    skipped: Vec<Row>,
    already_processed: usize,
    duplicates: usize,
}

/// What a pool task hands back to the collection point.
type TaskResult = (PendingRow, std::result::Result<RetryOutcome, String>);

// ---------------------------------------------------------------------------
// BatchScheduler
// ---------------------------------------------------------------------------

pub struct BatchScheduler {
    config: BatchConfig,
    store: ContactStore,
    worker: EnrichmentWorker,
    retry: RetryPolicy,
    logs: LogContext,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig, enricher: Arc<dyn Enricher>) -> Result<Self> {
        config.validate()?;

        let logs = LogContext::new(&config.contact_data_dir);
        let store = ContactStore::new(&config.output_csv, &config.domain_column);
        let worker = EnrichmentWorker::new(enricher, logs.clone(), config.timeout);
        let retry = RetryPolicy::new(config.max_retries, config.backoff_base);

        Ok(Self {
            config,
            store,
            worker,
            retry,
            logs,
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn log_context(&self) -> &LogContext {
        &self.logs
    }

    /// Run the batch to completion.
    ///
    /// Row-level failures are recorded in the output table and never abort
    /// the batch. Errors are returned only for an unreadable input or
    /// existing output table, and for a final write that failed twice.
    ///
    /// Input rows are keyed by domain: a later row repeating an earlier row's
    /// domain is not enriched or written, only counted in
    /// [`BatchReport::duplicates`].
    #[instrument(skip_all, fields(
        input = %self.config.input_csv.display(),
        output = %self.config.output_csv.display(),
        concurrency = self.config.concurrency,
    ))]
    pub async fn run(&self, progress: &dyn BatchProgress) -> Result<BatchReport> {
        let start = Instant::now();

        let input = self.read_input()?;
        let (existing, collapsed) = self
            .store
            .load_counting_duplicates()?
            .unwrap_or_default();
        let processed = processed_in(&existing, &self.config.domain_column);
        let plan = self.plan(&input, &existing, &processed);

        info!(
            input_rows = input.len(),
            already_processed = plan.already_processed,
            duplicates = plan.duplicates,
            to_process = plan.pending.len(),
            skipped = plan.skipped.len(),
            "batch planned"
        );

        let mut report = BatchReport {
            input_rows: input.len(),
            already_processed: plan.already_processed,
            duplicates: plan.duplicates,
            dispatched: 0,
            succeeded: 0,
            no_contact: 0,
            failed: 0,
            skipped: plan.skipped.len(),
            output_rows: existing.len(),
            elapsed: Duration::ZERO,
            output_path: self.config.output_csv.clone(),
            nothing_to_do: false,
        };

        if plan.pending.is_empty() && plan.skipped.is_empty() {
            info!("all companies have already been processed, nothing to do");
            if collapsed > 0 {
                let repaired = self.final_write(&existing, &[])?;
                report.output_rows = repaired.len();
            }
            report.nothing_to_do = true;
            report.elapsed = start.elapsed();
            progress.done(&report);
            return Ok(report);
        }

        progress.started(plan.pending.len(), plan.already_processed);

        let total = plan.pending.len();
        let mut completed: Vec<Row> = Vec::with_capacity(total + plan.skipped.len());
        for row in plan.skipped {
            progress.row_finished(
                row.get(&self.config.domain_column),
                RowStatus::Skipped,
                0,
                total,
            );
            completed.push(row);
        }
        let mut checkpoint_cursor = 0;
        let mut finished = 0;
        let mut in_flight: HashMap<String, PendingRow> = HashMap::new();
        let mut lost_reason: Option<String> = None;

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut queue = plan.pending.into_iter().peekable();
        let mut next_dispatch = tokio::time::Instant::now();

        loop {
            tokio::select! {
                biased;

                Some(joined) = tasks.join_next() => {
                    let (item, outcome) = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            // Pool tasks catch their own panics, so this is a
                            // cancellation. The row is recovered from
                            // `in_flight` after the loop.
                            error!(error = %e, "pool task ended unexpectedly");
                            lost_reason = Some(e.to_string());
                            continue;
                        }
                    };
                    in_flight.remove(&item.domain);

                    let (row, status) = match outcome {
                        Ok(outcome) => result_row(&item, &outcome, self.config.timeout),
                        Err(panic) => {
                            error!(domain = %item.domain, panic = %panic, "worker task panicked");
                            panicked_row(&item, &panic)
                        }
                    };
                    match status {
                        RowStatus::Succeeded => report.succeeded += 1,
                        RowStatus::NoContact => report.no_contact += 1,
                        RowStatus::Failed => report.failed += 1,
                        RowStatus::Skipped => report.skipped += 1,
                    }
                    completed.push(row);
                    finished += 1;
                    progress.row_finished(&item.domain, status, finished, total);

                    if finished % self.config.checkpoint_every == 0 || finished == total {
                        self.checkpoint(&completed[checkpoint_cursor..], progress);
                        checkpoint_cursor = completed.len();
                    }
                }

                _ = tokio::time::sleep_until(next_dispatch), if queue.peek().is_some() => {
                    let Some(item) = queue.next() else { continue };
                    progress.row_dispatched(&item.domain);
                    debug!(domain = %item.domain, "dispatching row");
                    in_flight.insert(item.domain.clone(), item.clone());
                    self.spawn_row(&mut tasks, &semaphore, item);
                    report.dispatched += 1;
                    next_dispatch = tokio::time::Instant::now() + self.config.stagger;
                }

                else => break,
            }
        }

        if !in_flight.is_empty() {
            let reason = lost_reason.unwrap_or_else(|| "task result missing".to_string());
            for (item, row) in lost_rows(in_flight, &reason) {
                error!(domain = %item.domain, reason = %reason, "row lost by the pool, recording failure");
                report.failed += 1;
                finished += 1;
                completed.push(row);
                progress.row_finished(&item.domain, RowStatus::Failed, finished, total);
            }
            self.checkpoint(&completed[checkpoint_cursor..], progress);
        }

        let merged = self.final_write(&existing, &completed)?;
        report.output_rows = merged.len();
        report.elapsed = start.elapsed();

        info!(
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            no_contact = report.no_contact,
            failed = report.failed,
            skipped = report.skipped,
            output_rows = report.output_rows,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch complete"
        );
        progress.done(&report);
        Ok(report)
    }

    fn read_input(&self) -> Result<Table> {
        let path = &self.config.input_csv;
        let table = read_table(path).map_err(|e| LeadEnrichError::input(path, e.to_string()))?;
        if !table.has_column(&self.config.domain_column) {
            return Err(LeadEnrichError::input(
                path,
                format!("missing domain column `{}`", self.config.domain_column),
            ));
        }
        Ok(table)
    }

    fn plan(&self, input: &Table, existing: &Table, processed: &HashSet<String>) -> WorkPlan {
        let column = self.config.domain_column.as_str();

        // Skip markers from earlier runs, so blank-domain rows are not
        // re-recorded on every run.
        let recorded_skips: HashSet<String> = existing
            .rows
            .iter()
            .filter(|r| r.get(columns::ENRICHMENT_NOTE) == notes::ROW_SKIPPED)
            .map(|r| row_key(r, column))
            .collect();

        let mut plan = WorkPlan::default();
        let mut seen: HashSet<String> = HashSet::new();

        for row in &input.rows {
            let domain = row.get(column).trim();
            if domain.is_empty() {
                if recorded_skips.contains(&row_key(row, column)) {
                    plan.already_processed += 1;
                } else {
                    warn!("row has no company domain, skipping");
                    plan.skipped.push(skipped_row(row));
                }
                continue;
            }
            if processed.contains(domain) {
                plan.already_processed += 1;
                continue;
            }
            if !seen.insert(domain.to_string()) {
                warn!(domain, "duplicate domain in input, keeping the first row");
                plan.duplicates += 1;
                continue;
            }
            plan.pending.push(PendingRow {
                domain: domain.to_string(),
                row: row.clone(),
            });
        }

        plan
    }

    fn spawn_row(
        &self,
        tasks: &mut JoinSet<TaskResult>,
        semaphore: &Arc<Semaphore>,
        item: PendingRow,
    ) {
        let semaphore = semaphore.clone();
        let worker = self.worker.clone();
        let retry = self.retry;

        tasks.spawn(async move {
            // A closed semaphore only happens on shutdown; run unthrottled.
            let _permit = semaphore.acquire_owned().await.ok();

            let domain = item.domain.clone();
            let inner = tokio::spawn(async move {
                retry
                    .run(&domain, |attempt| worker.run(&domain, attempt))
                    .await
            });

            let outcome = match inner.await {
                Ok(outcome) => Ok(outcome),
                Err(e) if e.is_panic() => Err(panic_message(e.into_panic())),
                Err(e) => Err(e.to_string()),
            };
            (item, outcome)
        });
    }

    fn checkpoint(&self, rows: &[Row], progress: &dyn BatchProgress) {
        if rows.is_empty() {
            return;
        }
        match self.store.append_rows(rows) {
            Ok(()) => {
                info!(rows = rows.len(), "checkpoint written");
                progress.checkpoint(rows.len());
            }
            Err(e) => warn!(rows = rows.len(), error = %e, "checkpoint failed, continuing"),
        }
    }

    /// Merge with the table loaded at start and rewrite once. Retries once;
    /// if that fails too, the rows are saved to a recovery file.
    fn final_write(&self, existing: &Table, completed: &[Row]) -> Result<Table> {
        match self.store.rewrite_merged(existing, completed) {
            Ok(merged) => return Ok(merged),
            Err(e) => warn!(error = %e, "final write failed, retrying once"),
        }

        match self.store.rewrite_merged(existing, completed) {
            Ok(merged) => Ok(merged),
            Err(e) => {
                let mut table = existing.clone();
                for row in completed {
                    table.push(row.clone());
                }
                let saved = match self.write_recovery(&table) {
                    Some(path) => format!("recovery file {}", path.display()),
                    None => "no recovery file could be written".to_string(),
                };
                Err(LeadEnrichError::output(
                    &self.config.output_csv,
                    format!("final write failed: {e}; {saved}"),
                ))
            }
        }
    }

    /// Save `table` next to the output, or under the contact data directory
    /// when the output's directory is the thing that is broken.
    fn write_recovery(&self, table: &Table) -> Option<PathBuf> {
        let name = self.recovery_file_name();
        let candidates = [
            self.config.output_csv.with_file_name(&name),
            self.config.contact_data_dir.join(&name),
        ];
        for path in candidates {
            match write_table_atomic(&path, table) {
                Ok(()) => {
                    error!(
                        path = %path.display(),
                        rows = table.len(),
                        "final write failed, results saved to recovery file"
                    );
                    return Some(path);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "recovery write failed"),
            }
        }
        error!(rows = table.len(), "could not save results anywhere");
        None
    }

    fn recovery_file_name(&self) -> String {
        let stem = self
            .config
            .output_csv
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "enriched".to_string());
        let ts = Local::now().format("%Y%m%d_%H%M%S");
        format!("{stem}.recovery-{ts}.csv")
    }
}

// ---------------------------------------------------------------------------
// Result rows
// ---------------------------------------------------------------------------

/// Input row plus every enrichment column, blank. Setting all of them up
/// front keeps the output column order stable regardless of outcome.
fn base_row(input: &Row, domain: &str) -> Row {
    let mut row = input.clone();
    for column in columns::CONTACT {
        row.set(column, "");
    }
    row.set(columns::COMPANY_DOMAIN, domain);
    row.set(columns::ENRICHMENT_ERROR, "");
    row.set(columns::ENRICHMENT_NOTE, "");
    row.set(columns::ADDITIONAL_CONTACTS_COUNT, "");
    row
}

fn result_row(item: &PendingRow, outcome: &RetryOutcome, timeout: Duration) -> (Row, RowStatus) {
    let mut row = base_row(&item.row, &item.domain);

    let status = match outcome {
        RetryOutcome::Contacts { contacts, .. } => {
            // The collaborator orders by relevance; keep its first pick.
            if let Some(best) = contacts.first() {
                row.merge(&best.to_row());
            }
            if contacts.len() > 1 {
                row.set(
                    columns::ENRICHMENT_NOTE,
                    notes::multiple_contacts(contacts.len()),
                );
                row.set(
                    columns::ADDITIONAL_CONTACTS_COUNT,
                    (contacts.len() - 1).to_string(),
                );
            }
            RowStatus::Succeeded
        }
        RetryOutcome::NoContact { .. } => {
            row.set(columns::ENRICHMENT_NOTE, notes::NO_CONTACTS_FOUND);
            RowStatus::NoContact
        }
        RetryOutcome::Exhausted { last, attempts } => {
            row.set(
                columns::ENRICHMENT_ERROR,
                format!("{last} (gave up after {attempts} attempts)"),
            );
            let note = match last {
                WorkerFailure::Timeout { .. } => notes::timed_out(timeout.as_secs()),
                _ => notes::PROCESSING_FAILED.to_string(),
            };
            row.set(columns::ENRICHMENT_NOTE, note);
            RowStatus::Failed
        }
    };

    (row, status)
}

fn panicked_row(item: &PendingRow, panic: &str) -> (Row, RowStatus) {
    failed_row(item, format!("worker task panicked: {panic}"))
}

fn failed_row(item: &PendingRow, error: String) -> (Row, RowStatus) {
    let mut row = base_row(&item.row, &item.domain);
    row.set(columns::ENRICHMENT_ERROR, error);
    row.set(columns::ENRICHMENT_NOTE, notes::PROCESSING_FAILED);
    (row, RowStatus::Failed)
}

/// Failure rows for tasks whose result never came back, in domain order.
fn lost_rows(in_flight: HashMap<String, PendingRow>, reason: &str) -> Vec<(PendingRow, Row)> {
    let mut items: Vec<PendingRow> = in_flight.into_values().collect();
    items.sort_by(|a, b| a.domain.cmp(&b.domain));
    items
        .into_iter()
        .map(|item| {
            let (row, _) = failed_row(&item, format!("worker task ended: {reason}"));
            (item, row)
        })
        .collect()
}

fn skipped_row(input: &Row) -> Row {
    let mut row = base_row(input, "");
    row.set(columns::ENRICHMENT_ERROR, "missing company domain");
    row.set(columns::ENRICHMENT_NOTE, notes::ROW_SKIPPED);
    row
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
