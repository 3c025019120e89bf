//! Expired entry eviction
//!
//! A sweep walks the lock files directly under the cache root and removes
//! entries that have been idle longer than the expiration and that nobody
//! currently holds. Every per-entry failure is recorded in the report and
//! the sweep moves on; nothing here returns an error to the caller.

use crate::cache::key::{EntryPaths, LOCK_EXTENSION};
use crate::cache::lockfile::{self, claim_existing, Attempt, CLAIM_EXTENSION};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Default bound on evictions in one sweep
pub const DEFAULT_MAX_EVICTIONS: usize = 10;

/// Summary of one sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Lock files examined
    pub scanned: usize,
    /// Entries removed
    pub evicted: usize,
    /// Entries left alone: recently used, in use, or vanished
    pub skipped: usize,
    /// Leftover claim files removed
    pub stale_claims: usize,
    /// Whether the sweep looked at every lock file
    pub complete: bool,
    /// Per-entry failures, in order
    pub errors: Vec<String>,
}

/// Bounded sweeper for one cache root
#[derive(Debug, Clone)]
pub struct Evictor {
    expiration: Option<Duration>,
    max_per_sweep: usize,
}

impl Evictor {
    /// Evictor removing entries idle longer than `expiration`
    ///
    /// `None` disables eviction. A `max_per_sweep` of zero removes the bound.
    pub fn new(expiration: Option<Duration>, max_per_sweep: usize) -> Self {
        Self {
            expiration,
            max_per_sweep,
        }
    }

    pub fn expiration(&self) -> Option<Duration> {
        self.expiration
    }

    /// Sweep `root` once
    pub fn sweep(&self, root: &Path) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(expiration) = self.expiration else {
            debug!("No expiration configured, skipping sweep of {}", root.display());
            report.complete = true;
            return report;
        };

        let (locks, claims) = match scan_root(root) {
            Ok(found) => found,
            Err(message) => {
                warn!("Cannot sweep {}: {}", root.display(), message);
                report.errors.push(message);
                return report;
            }
        };

        let now = SystemTime::now();
        for claim in &claims {
            remove_stale_claim(claim, expiration, now, &mut report);
        }

        report.complete = true;
        for lock in &locks {
            if self.max_per_sweep > 0 && report.evicted >= self.max_per_sweep {
                report.complete = false;
                break;
            }
            report.scanned += 1;
            self.visit(lock, expiration, &mut report);
        }

        if report.evicted > 0 || !report.errors.is_empty() {
            info!(
                "Swept {}: {} evicted, {} skipped, {} errors",
                root.display(),
                report.evicted,
                report.skipped,
                report.errors.len()
            );
        }
        report
    }

    fn visit(&self, lock: &Path, expiration: Duration, report: &mut SweepReport) {
        let Some(paths) = EntryPaths::from_lock(lock) else {
            report.skipped += 1;
            return;
        };

        match is_expired(&paths, expiration) {
            Ok(true) => {}
            Ok(false) => {
                report.skipped += 1;
                return;
            }
            Err(e) => {
                report.skipped += 1;
                if e.kind() != std::io::ErrorKind::NotFound {
                    report.errors.push(format!("{}: {}", lock.display(), e));
                }
                return;
            }
        }

        let claim = match claim_existing(&paths) {
            Ok(Attempt::Acquired(claim)) => claim,
            Ok(Attempt::Busy) => {
                debug!("{} is in use, not evicting", paths.name());
                report.skipped += 1;
                return;
            }
            Err(e) => {
                report.skipped += 1;
                report.errors.push(e.to_string());
                return;
            }
        };

        // A reader may have released and stamped the entry after the first check
        if !matches!(is_expired(&paths, expiration), Ok(true)) {
            claim.release();
            report.skipped += 1;
            return;
        }

        let cleanup = claim.remove_entry();
        if cleanup.is_clean() {
            info!("Evicted {}", paths.name());
            report.evicted += 1;
        } else {
            report
                .errors
                .extend(cleanup.failures().iter().map(|f| f.to_string()));
            cleanup.log("eviction");
        }
    }
}

fn is_expired(paths: &EntryPaths, expiration: Duration) -> std::io::Result<bool> {
    let accessed = lockfile::last_access_time(paths)?;
    Ok(match SystemTime::now().duration_since(accessed) {
        Ok(idle) => idle > expiration,
        Err(_) => false,
    })
}

/// Lock files and leftover claim files directly under `root`, sorted
fn scan_root(root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), String> {
    let mut locks = Vec::new();
    let mut claims = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| e.to_string())?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        match path.extension().and_then(|x| x.to_str()) {
            Some(LOCK_EXTENSION) => locks.push(path),
            Some(CLAIM_EXTENSION) => claims.push(path),
            _ => {}
        }
    }

    locks.sort();
    Ok((locks, claims))
}

fn remove_stale_claim(path: &Path, expiration: Duration, now: SystemTime, report: &mut SweepReport) {
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return,
    };
    let stale = now
        .duration_since(modified)
        .map(|age| age > expiration)
        .unwrap_or(false);
    if !stale {
        return;
    }

    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale claim file {}", path.display());
            report.stale_claims += 1;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => report.errors.push(format!("{}: {}", path.display(), e)),
    }
}
