//! Reuse-or-rebuild decisions for existing entries
//!
//! Rules run in order and the first failing one forces a rebuild:
//!
//! 1. the record's schema tag matches
//! 2. the record has exactly four fields
//! 3. the stored format serves the requested one
//! 4. the source still reports the same last-modified time and length,
//!    unless the entry was accessed within the freshness window
//!
//! Rule 4 may call the source, which can be expensive, so the window
//! suppresses it while an entry is being used heavily.

use crate::cache::record::{LockRecord, RecordDefect, RequestedFormat, SourceMetadata, StorageFormat};
use crate::error::CacheResult;
use std::fmt;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Default span during which a recently accessed entry skips the source check
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(120);

/// Why an existing entry can't be reused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    /// Record is empty or malformed
    Corrupt(RecordDefect),
    /// Entry is stored in a representation the caller didn't ask for
    FormatMismatch {
        stored: StorageFormat,
        requested: RequestedFormat,
    },
    /// Source length or last-modified time changed
    SourceChanged,
    /// Lock file exists but the entry directory is gone
    MissingEntry,
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt(defect) => write!(f, "{}", defect),
            Self::FormatMismatch { stored, requested } => {
                write!(f, "stored as {}, requested as {}", stored, requested)
            }
            Self::SourceChanged => write!(f, "source changed"),
            Self::MissingEntry => write!(f, "entry directory missing"),
        }
    }
}

/// Outcome of validating an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Use the entry as is
    Reuse(LockRecord),
    /// Tear the entry down and build it again
    Rebuild(RebuildReason),
}

/// Decides whether an existing entry may be reused
#[derive(Debug, Clone, Copy)]
pub struct StalenessValidator {
    freshness_window: Duration,
}

impl Default for StalenessValidator {
    fn default() -> Self {
        Self::new(DEFAULT_FRESHNESS_WINDOW)
    }
}

impl StalenessValidator {
    pub fn new(freshness_window: Duration) -> Self {
        Self { freshness_window }
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Evaluate an entry's record
    ///
    /// `current` is only called when the freshness check actually runs.
    /// Its errors are returned as is: a source that can't be reached is not
    /// a reason to discard a good entry, nor to keep a possibly stale one.
    pub fn evaluate<F>(
        &self,
        record: Result<LockRecord, RecordDefect>,
        last_access: Option<SystemTime>,
        requested: RequestedFormat,
        current: F,
    ) -> CacheResult<Verdict>
    where
        F: FnOnce() -> CacheResult<SourceMetadata>,
    {
        let record = match record {
            Ok(record) => record,
            Err(defect) => return Ok(Verdict::Rebuild(RebuildReason::Corrupt(defect))),
        };

        if !requested.is_served_by(record.format) {
            return Ok(Verdict::Rebuild(RebuildReason::FormatMismatch {
                stored: record.format,
                requested,
            }));
        }

        if self.recently_accessed(last_access, SystemTime::now()) {
            debug!("Entry accessed within {:?}, skipping source check", self.freshness_window);
            return Ok(Verdict::Reuse(record));
        }

        let metadata = current()?;
        if record.matches_source(&metadata) {
            Ok(Verdict::Reuse(record))
        } else {
            debug!(
                "Source changed: recorded {} bytes at tick {}, now {} bytes at tick {}",
                record.length,
                record.last_modified_ticks,
                metadata.length,
                metadata.ticks()
            );
            Ok(Verdict::Rebuild(RebuildReason::SourceChanged))
        }
    }

    /// Format and freshness check without the access window
    pub fn is_reusable(
        &self,
        existing: &LockRecord,
        current: &SourceMetadata,
        requested: RequestedFormat,
    ) -> bool {
        requested.is_served_by(existing.format) && existing.matches_source(current)
    }

    /// Whether `last_access` falls inside the freshness window ending at `now`
    pub fn recently_accessed(&self, last_access: Option<SystemTime>, now: SystemTime) -> bool {
        match last_access {
            Some(at) => match now.duration_since(at) {
                Ok(idle) => idle < self.freshness_window,
                // Stamped in the future by a skewed clock
                Err(_) => true,
            },
            None => false,
        }
    }
}
