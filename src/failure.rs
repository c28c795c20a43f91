use crate::error::{AgentError, Result};
use crate::Oid;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide cancellation flag. The signal watcher trips it; the engines
/// poll it between tables and between chunks and unwind on their own.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AgentError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorPolicy {
    /// Any table failure ends the run.
    Abort,
    /// A table failure is logged, flagged in the sentinel, and the run moves
    /// on to the next table.
    Continue,
}

/// Decides what a failure means for the run and keeps the error sentinel.
pub struct FailureController {
    policy: ErrorPolicy,
    sentinel: PathBuf,
    token: CancelToken,
    skipped: Vec<Oid>,
}

impl FailureController {
    pub fn new(policy: ErrorPolicy, sentinel: PathBuf, token: CancelToken) -> Self {
        Self {
            policy,
            sentinel,
            token,
            skipped: Vec::new(),
        }
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn sentinel(&self) -> &Path {
        &self.sentinel
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.token.check()
    }

    /// A table's transfer failed. `Ok(())` means the run goes on without it;
    /// an error means the run is over.
    pub fn table_failed(&mut self, oid: Oid, err: AgentError) -> Result<()> {
        if self.token.is_cancelled() {
            // a broken pipe right after a signal is the signal's doing
            return Err(AgentError::Interrupted);
        }
        if self.policy == ErrorPolicy::Abort || !err.is_table_local() {
            return Err(err);
        }

        tracing::error!(oid, error = %err.report(), "table failed, continuing with the next one");
        self.write_sentinel(&format!("oid {oid}: {}", err.report()))?;
        self.skipped.push(oid);
        Ok(())
    }

    /// The run is ending on `err`. Best effort: a failure to write the
    /// sentinel is logged, `err` is still what gets reported.
    pub fn run_aborted(&mut self, err: &AgentError) {
        match err {
            AgentError::Interrupted => tracing::warn!("run interrupted"),
            _ => tracing::error!(error = %err.report(), "run aborted"),
        }
        if let Err(e) = self.write_sentinel(&err.report()) {
            tracing::error!(error = %e.report(), "could not write error file");
        }
    }

    /// Tables given up on under `ErrorPolicy::Continue`.
    pub fn skipped(&self) -> &[Oid] {
        &self.skipped
    }

    /// Create (or append to) the sentinel file. Its existence is what the
    /// orchestrator checks; the lines are for humans.
    pub fn write_sentinel(&self, reason: &str) -> Result<()> {
        let ctx = || format!("Failed to write error file {}", self.sentinel.display());
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.sentinel)
            .map_err(|e| AgentError::io(ctx(), e))?;
        writeln!(f, "{reason}").map_err(|e| AgentError::io(ctx(), e))?;
        Ok(())
    }
}
