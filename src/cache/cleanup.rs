//! Best-effort cleanup results
//!
//! Deleting a rolled-back or evicted entry must never mask the error that
//! caused it. Cleanup steps report failures here instead of returning them,
//! and callers decide whether to log, attach, or drop them.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One cleanup step that didn't succeed
#[derive(Debug)]
pub struct CleanupFailure {
    /// What was being removed
    pub path: PathBuf,
    /// Step name, e.g. "remove entry directory"
    pub step: &'static str,
    /// Underlying error
    pub source: io::Error,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.step, self.path.display(), self.source)
    }
}

/// Outcome of a multi-step cleanup
#[derive(Debug, Default)]
pub struct CleanupReport {
    failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a directory tree; a missing directory counts as removed
    pub fn remove_dir_all(&mut self, path: &Path, step: &'static str) -> bool {
        match std::fs::remove_dir_all(path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                self.push(path, step, e);
                false
            }
        }
    }

    /// Remove a file; a missing file counts as removed
    pub fn remove_file(&mut self, path: &Path, step: &'static str) -> bool {
        match std::fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                self.push(path, step, e);
                false
            }
        }
    }

    /// Record a failure
    pub fn push(&mut self, path: &Path, step: &'static str, source: io::Error) {
        self.failures.push(CleanupFailure {
            path: path.to_path_buf(),
            step,
            source,
        });
    }

    /// Whether every step succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Recorded failures, in order
    pub fn failures(&self) -> &[CleanupFailure] {
        &self.failures
    }

    /// Log every failure as a warning; the report is consumed
    pub fn log(self, context: &str) {
        for failure in &self.failures {
            warn!("{}: {}", context, failure);
        }
    }

    /// Consume the report, keeping the first underlying error
    pub fn into_first_error(self) -> Option<io::Error> {
        self.failures.into_iter().next().map(|f| f.source)
    }
}
