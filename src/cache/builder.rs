//! Entry construction
//!
//! Runs only while holding an exclusive claim on a lock file whose entry
//! directory doesn't exist yet. Either the entry and its record are fully
//! written, or both are removed again and the first error is returned.

use crate::cache::cleanup::CleanupReport;
use crate::cache::key::{CacheKey, EntryPaths};
use crate::cache::lockfile::ExclusiveClaim;
use crate::cache::record::{LockRecord, RequestedFormat, StorageFormat};
use crate::error::{CacheError, CacheResult};
use crate::source::{sanitize_filename, FetchContext, PackageFormat, ResourceSource};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// What a build attempt produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Entry written and claim released
    Built(LockRecord),
    /// The entry directory already existed; it was cleared and the caller
    /// should start over
    RaceLost,
}

/// Builds one cache entry from a resource source
pub struct EntryBuilder<'a> {
    source: &'a dyn ResourceSource,
    package: &'a dyn PackageFormat,
    ctx: &'a FetchContext,
    cache_invalid_package_as_file: bool,
}

impl<'a> EntryBuilder<'a> {
    /// Create a builder
    pub fn new(
        source: &'a dyn ResourceSource,
        package: &'a dyn PackageFormat,
        ctx: &'a FetchContext,
    ) -> Self {
        Self {
            source,
            package,
            ctx,
            cache_invalid_package_as_file: true,
        }
    }

    /// Store content that fails validation as a single file instead of failing
    pub fn cache_invalid_package_as_file(mut self, enabled: bool) -> Self {
        self.cache_invalid_package_as_file = enabled;
        self
    }

    /// Build the entry for `key` under `claim`
    ///
    /// The claim is always consumed: released after a successful build,
    /// or used to remove the partial entry on failure.
    pub fn build(
        &self,
        mut claim: ExclusiveClaim,
        key: &CacheKey,
        requested: RequestedFormat,
    ) -> CacheResult<BuildOutcome> {
        let paths = claim.paths().clone();

        if paths.dir.exists() {
            debug!("Entry directory {} already exists", paths.dir.display());
            claim.remove_entry().log("clearing leftover entry");
            return Ok(BuildOutcome::RaceLost);
        }

        let built = self.materialize(&paths, key, requested).and_then(|record| {
            claim
                .write_record(&record)
                .map(|()| record)
                .map_err(|source| CacheError::LockRecordWrite {
                    path: paths.lock.clone(),
                    source,
                })
        });

        match built {
            Ok(record) => {
                claim.release();
                info!("Cached {} as {} in {}", key, record.format, paths.dir.display());
                Ok(BuildOutcome::Built(record))
            }
            Err(first) => Err(rollback(claim, first)),
        }
    }

    fn materialize(
        &self,
        paths: &EntryPaths,
        key: &CacheKey,
        requested: RequestedFormat,
    ) -> CacheResult<LockRecord> {
        let fetched = self.source.fetch(key, self.ctx)?;
        let metadata = fetched.metadata;
        let mut reader = fetched.reader;

        if requested == RequestedFormat::AsFile {
            write_single_file(&paths.dir, &fetched.filename, &mut reader)?;
            return Ok(LockRecord::new(&metadata, StorageFormat::WrittenAsFile));
        }

        let mut bytes = Vec::with_capacity(usize::try_from(metadata.length).unwrap_or(0));
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| CacheError::io(format!("reading content of {}", key), e))?;

        let report = self.package.validate(&bytes);
        let extracted = if report.has_errors() {
            Err(CacheError::InvalidPackage {
                messages: report.error_messages(),
            })
        } else {
            create_entry_dir(&paths.dir)?;
            self.package.extract(&bytes, &paths.dir)
        };

        match extracted {
            Ok(()) => Ok(LockRecord::new(&metadata, StorageFormat::WrittenAsPackage)),
            Err(CacheError::InvalidPackage { messages }) if self.cache_invalid_package_as_file => {
                warn!(
                    "{} is not a valid package, caching as file: {}",
                    key,
                    messages.join("; ")
                );
                let mut cleared = CleanupReport::new();
                if !cleared.remove_dir_all(&paths.dir, "clear partial extraction") {
                    return Err(cleared
                        .into_first_error()
                        .map(|e| CacheError::io("clearing partial extraction", e))
                        .unwrap_or(CacheError::InvalidPackage { messages }));
                }
                write_single_file(&paths.dir, &fetched.filename, &mut bytes.as_slice())?;
                Ok(LockRecord::new(
                    &metadata,
                    StorageFormat::InvalidPackageWrittenAsFile,
                ))
            }
            Err(e) => Err(e),
        }
    }
}

/// Remove the partial entry and return the error that caused the rollback
///
/// Cleanup failures are logged, never returned in place of `first`.
fn rollback(claim: ExclusiveClaim, first: CacheError) -> CacheError {
    let lock = claim.paths().lock.clone();
    warn!("Building {} failed, rolling back: {}", lock.display(), first);
    claim.remove_entry().log("rollback");
    first
}

fn create_entry_dir(dir: &Path) -> CacheResult<()> {
    fs::create_dir(dir).map_err(|e| CacheError::io(format!("creating {}", dir.display()), e))
}

/// Write `reader` as the only file in a new `dir`
///
/// `filename` comes from the source and is reduced to one path component.
fn write_single_file(dir: &Path, filename: &str, reader: &mut dyn Read) -> CacheResult<()> {
    create_entry_dir(dir)?;
    let path = dir.join(sanitize_filename(filename));
    let mut file =
        File::create(&path).map_err(|e| CacheError::io(format!("creating {}", path.display()), e))?;
    io::copy(reader, &mut file)
        .and_then(|_| file.flush())
        .map_err(|e| CacheError::io(format!("writing {}", path.display()), e))?;
    Ok(())
}
