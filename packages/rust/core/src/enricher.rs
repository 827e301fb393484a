//! The external enrichment collaborator.
//!
//! Whatever actually finds contacts (an LLM agent with people-search tools,
//! a script, an HTTP service) sits behind [`Enricher`]. It is handed a domain
//! and a private run directory and is expected to leave its results in
//! `contacts.csv` inside that directory.
//!
//! [`CommandEnricher`] runs one subprocess per call. The child is acquired
//! when the call starts and reaped before it returns; if the call is
//! abandoned (timeout), dropping its future kills the child. On unix the
//! child leads its own process group and the whole group is killed, so
//! helpers it started (a browser, a script's subshell) go with it. Elsewhere
//! only the direct child is killed.

use std::process::Stdio;

use async_trait::async_trait;
use tracing::instrument;

use leadenrich_shared::{CONTACT_DATA_ENV, EnricherConfig};

use crate::run_dir::{RunDirectory, RunLog};

/// Bytes of collaborator stdout echoed into the run log at debug level.
const STDOUT_PREVIEW_BYTES: usize = 500;

/// Failure reported by an enricher. Every variant is retryable.
#[derive(Debug, thiserror::Error)]
pub enum EnricherError {
    /// The collaborator could not be started.
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// The collaborator exited unsuccessfully.
    #[error("`{command}` exited with status {status}")]
    Exit { command: String, status: String },

    /// Any other failure inside the collaborator.
    #[error("{0}")]
    Failed(String),
}

/// Capability interface for "find contacts for this domain".
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run the collaborator for `domain`, writing results to
    /// `run_dir.contacts_file()`. Must not write outside `run_dir`.
    async fn enrich(
        &self,
        domain: &str,
        run_dir: &RunDirectory,
        log: &mut RunLog,
    ) -> Result<(), EnricherError>;
}

// ---------------------------------------------------------------------------
// CommandEnricher
// ---------------------------------------------------------------------------

/// Runs `<program> <args...> <domain>` with `CONTACT_DATA_PATH` pointing at
/// the run directory.
#[derive(Debug, Clone)]
pub struct CommandEnricher {
    program: String,
    args: Vec<String>,
}

impl CommandEnricher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &EnricherConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }

    fn command_line(&self, domain: &str) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 2);
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        parts.push(domain);
        parts.join(" ")
    }
}

#[async_trait]
impl Enricher for CommandEnricher {
    fn name(&self) -> &str {
        &self.program
    }

    #[instrument(skip_all, fields(domain))]
    async fn enrich(
        &self,
        domain: &str,
        run_dir: &RunDirectory,
        log: &mut RunLog,
    ) -> Result<(), EnricherError> {
        log.info(format!("Executing: {}", self.command_line(domain)));
        let started = std::time::Instant::now();

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg(domain)
            .env(CONTACT_DATA_ENV, run_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| EnricherError::Spawn {
            command: self.program.clone(),
            source,
        })?;
        #[cfg(unix)]
        let group = process_group::KillOnDrop::new(child.id());

        let output = child.wait_with_output().await.map_err(|e| {
            EnricherError::Failed(format!("waiting for `{}` failed: {e}", self.program))
        })?;
        #[cfg(unix)]
        group.disarm();

        log.info(format!(
            "Command completed in {:.2} seconds",
            started.elapsed().as_secs_f64()
        ));

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            log.debug(format!(
                "Command stdout: {}",
                truncate_utf8(&stdout, STDOUT_PREVIEW_BYTES)
            ));
        }

        if !output.status.success() {
            let status = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            log.error(format!("Command failed with code {status}"));
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                log.error(format!("Error output: {}", stderr.trim_end()));
            }
            return Err(EnricherError::Exit {
                command: self.program.clone(),
                status,
            });
        }

        Ok(())
    }
}

#[cfg(unix)]
mod process_group {
    /// Kills a process group when dropped, unless disarmed first.
    pub(super) struct KillOnDrop {
        pgid: Option<libc::pid_t>,
    }

    impl KillOnDrop {
        /// `pid` is the group leader, spawned with `process_group(0)`.
        pub(super) fn new(pid: Option<u32>) -> Self {
            Self {
                pgid: pid.and_then(|p| libc::pid_t::try_from(p).ok()),
            }
        }

        /// The leader exited on its own; leave the group alone.
        pub(super) fn disarm(mut self) {
            self.pgid = None;
        }
    }

    impl Drop for KillOnDrop {
        fn drop(&mut self) {
            if let Some(pgid) = self.pgid.take() {
                // SAFETY: killpg only sends a signal. A group that is already
                // gone yields ESRCH, which is ignored.
                let _ = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            }
        }
    }
}

/// Cut `s` to at most `max` bytes without splitting a character.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
