//! Isolated per-call run directories and the explicit logging context.
//!
//! Every enrichment attempt gets a fresh directory under the contact data
//! root. The collaborator writes its `contacts.csv` there, the attempt's log
//! file lives in its `logs/` subdirectory, and a `run.json` manifest records
//! how the attempt ended. Directories are never reused.

use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use leadenrich_shared::{Contact, LeadEnrichError, Result};

/// File the collaborator writes its contacts to.
pub const CONTACTS_FILE: &str = "contacts.csv";

const MANIFEST_FILE: &str = "run.json";

// ---------------------------------------------------------------------------
// RunDirectory
// ---------------------------------------------------------------------------

/// A uniquely named directory owned by a single enrichment attempt.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    path: PathBuf,
    domain: String,
}

impl RunDirectory {
    /// Create `<root>/<sanitized-domain>_<timestamp>_<suffix>`.
    ///
    /// The leaf is created with `create_dir`, so an existing directory is an
    /// error rather than silently shared.
    pub fn create(root: &Path, domain: &str) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| LeadEnrichError::io(root, e))?;

        let ts = Local::now().format("%Y%m%d_%H%M%S_%6f");
        let id = Uuid::now_v7().simple().to_string();
        // The leading bits of a v7 id are the timestamp; take the random tail.
        let suffix = &id[id.len() - 8..];
        let name = format!("{}_{ts}_{suffix}", sanitize_domain(domain));

        let path = root.join(name);
        std::fs::create_dir(&path).map_err(|e| LeadEnrichError::io(&path, e))?;
        let path = std::path::absolute(&path).unwrap_or(path);

        debug!(domain, path = %path.display(), "run directory created");
        Ok(Self {
            path,
            domain: domain.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Where the collaborator is expected to write contacts.
    pub fn contacts_file(&self) -> PathBuf {
        self.path.join(CONTACTS_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.path.join("logs")
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Record how the attempt ended.
    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<()> {
        let path = self.manifest_file();
        let json = serde_json::to_string_pretty(manifest)
            .map_err(|e| LeadEnrichError::validation(format!("run manifest: {e}")))?;
        std::fs::write(&path, json).map_err(|e| LeadEnrichError::io(&path, e))
    }
}

/// Summary of one attempt, stored as `run.json` in its run directory.
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub domain: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// `succeeded`, `no_contact`, `timeout` or `process_failure`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<Contact>,
}

/// Make a domain safe to use as a directory name component.
pub fn sanitize_domain(domain: &str) -> String {
    static UNSAFE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^A-Za-z0-9-]+").expect("valid regex"));

    let cleaned = UNSAFE_RE.replace_all(domain.trim(), "_");
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        return "unknown".to_string();
    }
    cleaned.chars().take(64).collect()
}

// ---------------------------------------------------------------------------
// Logging context
// ---------------------------------------------------------------------------

/// Logging context passed explicitly to the scheduler and workers.
///
/// It owns no global state: it knows where logs belong and hands out
/// [`RunLog`] handles whose lifetime is one attempt.
#[derive(Debug, Clone)]
pub struct LogContext {
    root: PathBuf,
}

impl LogContext {
    pub fn new(contact_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: contact_data_dir.into(),
        }
    }

    /// Contact data root; run directories are created under it.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pipeline_log_dir(&self) -> PathBuf {
        self.root.join("logs").join("pipeline")
    }

    /// Create the pipeline log directory and return a fresh log file path
    /// `logs/pipeline/<name>_<timestamp>.log`.
    pub fn pipeline_log_path(&self, name: &str) -> Result<PathBuf> {
        let dir = self.pipeline_log_dir();
        std::fs::create_dir_all(&dir).map_err(|e| LeadEnrichError::io(&dir, e))?;
        let ts = Local::now().format("%Y%m%d_%H%M%S");
        Ok(dir.join(format!("{name}_{ts}.log")))
    }

    /// Open the log for one attempt inside its run directory.
    ///
    /// A log that cannot be opened degrades to tracing-only output; it never
    /// fails the attempt.
    pub fn open_run_log(&self, run_dir: &RunDirectory, attempt: u32) -> RunLog {
        let dir = run_dir.logs_dir();
        let ts = Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("enrichment_{ts}.log"));

        let writer = std::fs::create_dir_all(&dir)
            .and_then(|_| File::create(&path))
            .map(BufWriter::new);
        let writer = match writer {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "run log unavailable");
                None
            }
        };

        let mut log = RunLog {
            domain: run_dir.domain().to_string(),
            attempt,
            path,
            writer,
        };
        log.info(format_args!(
            "run log opened for {} (attempt {attempt}) in {}",
            run_dir.domain(),
            run_dir.path().display()
        ));
        log
    }
}

/// Scoped log handle for one attempt. Lines go to the run's log file and are
/// mirrored to `tracing` at debug level. Flushed and closed on drop.
pub struct RunLog {
    domain: String,
    attempt: u32,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl RunLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn debug(&mut self, msg: impl Display) {
        self.write("DEBUG", msg);
    }

    pub fn info(&mut self, msg: impl Display) {
        self.write("INFO", msg);
    }

    pub fn warn(&mut self, msg: impl Display) {
        self.write("WARNING", msg);
    }

    pub fn error(&mut self, msg: impl Display) {
        self.write("ERROR", msg);
    }

    fn write(&mut self, level: &str, msg: impl Display) {
        let line = msg.to_string();
        debug!(domain = %self.domain, attempt = self.attempt, log_level = level, "{line}");
        if let Some(w) = self.writer.as_mut() {
            let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
            if writeln!(w, "{ts} - {level} - {line}").is_err() {
                self.writer = None;
            }
        }
    }

    /// Flush and release the file handle.
    pub fn close(mut self) {
        if let Some(mut w) = self.writer.take() {
            let _ = w.flush();
        }
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_domain("fundraiseup.com"), "fundraiseup_com");
        assert_eq!(sanitize_domain("https://acme.io/about"), "https_acme_io_about");
        assert_eq!(sanitize_domain("  "), "unknown");
        assert_eq!(sanitize_domain("../.."), "unknown");
    }

    #[test]
    fn run_directories_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let a = RunDirectory::create(root.path(), "acme.io").unwrap();
        let b = RunDirectory::create(root.path(), "acme.io").unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        assert!(a.path().is_absolute());
        assert!(
            a.path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("acme_io_")
        );
        assert_eq!(a.contacts_file(), a.path().join(CONTACTS_FILE));
    }

    #[test]
    fn run_log_writes_into_run_directory() {
        let root = tempfile::tempdir().unwrap();
        let ctx = LogContext::new(root.path());
        let run_dir = RunDirectory::create(ctx.root(), "acme.io").unwrap();

        let mut log = ctx.open_run_log(&run_dir, 2);
        log.info("calling collaborator");
        log.error("it broke");
        let path = log.path().to_path_buf();
        log.close();

        assert!(path.starts_with(run_dir.logs_dir()));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("(attempt 2)"));
        assert!(text.contains("INFO - calling collaborator"));
        assert!(text.contains("ERROR - it broke"));
    }

    #[test]
    fn manifest_is_written() {
        let root = tempfile::tempdir().unwrap();
        let run_dir = RunDirectory::create(root.path(), "acme.io").unwrap();
        let manifest = RunManifest {
            domain: "acme.io".into(),
            attempt: 1,
            started_at: Utc::now(),
            duration_ms: 12,
            status: "no_contact".into(),
            error: None,
            contacts: vec![],
        };
        run_dir.write_manifest(&manifest).unwrap();

        let json = std::fs::read_to_string(run_dir.manifest_file()).unwrap();
        assert!(json.contains(r#""status": "no_contact""#));
        assert!(!json.contains("contacts"));
    }

    #[test]
    fn pipeline_log_path_creates_directory() {
        let root = tempfile::tempdir().unwrap();
        let ctx = LogContext::new(root.path());
        let path = ctx.pipeline_log_path("enrichment").unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("enrichment_")
        );
    }
}
