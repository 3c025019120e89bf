//! Cache facade and acquisition state machine
//!
//! [`PackageCache`] owns the settings for one cache root. Acquiring a key
//! runs an [`Acquisition`] through these states:
//!
//! | State | Leaves on |
//! |-------|-----------|
//! | `Unacquired` | first attempt |
//! | `Acquiring` | an attempt holds the entry, fails fatally, or the timeout passes |
//! | `Held` | the [`CacheHandle`] is released or dropped |
//! | `Released` | terminal |
//! | `Failed` | terminal |
//!
//! Each attempt first tries to claim a new lock file. If it exists, the entry
//! is opened shared and validated; a stale entry is torn down and the next
//! attempt races to build it again.

use crate::cache::builder::{BuildOutcome, EntryBuilder};
use crate::cache::evict::{Evictor, SweepReport, DEFAULT_MAX_EVICTIONS};
use crate::cache::key::{CacheKey, EntryPaths};
use crate::cache::lockfile::{
    claim_existing, open_shared, touch_access_time, try_claim_exclusive, Attempt, ExclusiveClaim,
    LockError, SharedLock,
};
use crate::cache::record::{LockRecord, RequestedFormat, StorageFormat};
use crate::cache::staleness::{RebuildReason, StalenessValidator, Verdict, DEFAULT_FRESHNESS_WINDOW};
use crate::error::{CacheError, CacheResult};
use crate::source::{FetchContext, PackageFormat, ResourceSource, TarPackage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default acquisition budget
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default sleep between contended attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(750);

/// Runtime settings for a cache root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Existing, writable cache root
    pub cache_path: PathBuf,
    /// Idle time after which entries are evicted; `None` never evicts
    pub expiration: Option<Duration>,
    /// Identity handed to the resource source
    pub identity: Option<String>,
    /// Store invalid packages as a single file instead of failing
    pub cache_invalid_package_as_file: bool,
    /// Never attempt extraction
    pub always_cache_as_file: bool,
    pub acquire_timeout: Duration,
    pub poll_interval: Duration,
    /// Access window during which the source isn't re-checked
    pub freshness_window: Duration,
    /// Bound on evictions per sweep; zero removes it
    pub max_evictions_per_sweep: usize,
}

impl CacheSettings {
    /// Settings with defaults for everything but the root
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
            expiration: None,
            identity: None,
            cache_invalid_package_as_file: true,
            always_cache_as_file: false,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            max_evictions_per_sweep: DEFAULT_MAX_EVICTIONS,
        }
    }
}

/// Where an acquisition stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireState {
    Unacquired,
    /// Attempts made so far, including the current one
    Acquiring { attempt: u32 },
    Held,
    Released,
    Failed,
}

/// Why an attempt didn't end with a held entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Existing lock file is claimed by someone else
    ClaimBusy,
    /// Entry is being built or torn down
    SharedBusy,
    /// Entry was torn down and must be built again
    Rebuild(RebuildReason),
    /// Entry directory appeared under a fresh claim
    RaceLost,
    /// Unexpected I/O error on a lock file
    Transient,
}

impl RetryReason {
    /// Whether the next attempt should wait for someone else first
    pub fn backs_off(&self) -> bool {
        !matches!(self, Self::Rebuild(_) | Self::RaceLost)
    }
}

/// Result of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Held,
    Retry(RetryReason),
}

/// Disk cache rooted at one directory
pub struct PackageCache {
    settings: CacheSettings,
    package: Box<dyn PackageFormat>,
    validator: StalenessValidator,
    evictor: Evictor,
}

impl PackageCache {
    /// Create a cache using tar packages
    ///
    /// The root itself is neither created nor checked here; an unusable root
    /// surfaces on the first acquisition.
    pub fn new(settings: CacheSettings) -> CacheResult<Self> {
        if settings.cache_path.as_os_str().is_empty() {
            return Err(CacheError::CachePathNotConfigured);
        }
        Ok(Self {
            validator: StalenessValidator::new(settings.freshness_window),
            evictor: Evictor::new(settings.expiration, settings.max_evictions_per_sweep),
            package: Box::new(TarPackage::default()),
            settings,
        })
    }

    /// Use a different package format
    pub fn with_package_format(mut self, package: impl PackageFormat + 'static) -> Self {
        self.package = Box::new(package);
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn root(&self) -> &Path {
        &self.settings.cache_path
    }

    /// Format requested when the caller doesn't choose one
    pub fn default_format(&self) -> RequestedFormat {
        if self.settings.always_cache_as_file {
            RequestedFormat::AsFile
        } else {
            RequestedFormat::AsPackage
        }
    }

    /// Acquire `key` in the configured format
    pub fn acquire<'a>(
        &'a self,
        key: &CacheKey,
        source: &'a dyn ResourceSource,
    ) -> CacheResult<CacheHandle<'a>> {
        self.acquire_with(key, source, self.default_format())
    }

    /// Acquire `key` in an explicit format
    pub fn acquire_with<'a>(
        &'a self,
        key: &CacheKey,
        source: &'a dyn ResourceSource,
        requested: RequestedFormat,
    ) -> CacheResult<CacheHandle<'a>> {
        self.begin(key, source, requested).run()
    }

    /// Start an acquisition without running it
    pub fn begin<'a>(
        &'a self,
        key: &CacheKey,
        source: &'a dyn ResourceSource,
        requested: RequestedFormat,
    ) -> Acquisition<'a> {
        Acquisition {
            cache: self,
            source,
            key: *key,
            paths: key.paths(self.root()),
            requested,
            ctx: FetchContext {
                identity: self.settings.identity.clone(),
            },
            state: AcquireState::Unacquired,
            held: None,
            first_error: None,
            started: None,
        }
    }

    /// Run one bounded eviction sweep over the root
    ///
    /// Every handle release runs one of these.
    pub fn sweep(&self) -> SweepReport {
        self.evictor.sweep(self.root())
    }
}

/// One key's path from `Unacquired` to a held entry
pub struct Acquisition<'a> {
    cache: &'a PackageCache,
    source: &'a dyn ResourceSource,
    key: CacheKey,
    paths: EntryPaths,
    requested: RequestedFormat,
    ctx: FetchContext,
    state: AcquireState,
    held: Option<(SharedLock, LockRecord)>,
    first_error: Option<io::Error>,
    started: Option<Instant>,
}

impl<'a> Acquisition<'a> {
    pub fn state(&self) -> AcquireState {
        self.state
    }

    pub fn paths(&self) -> &EntryPaths {
        &self.paths
    }

    /// Make one attempt
    ///
    /// Errors are fatal and move the acquisition to `Failed`.
    pub fn attempt(&mut self) -> CacheResult<AttemptOutcome> {
        self.state = match self.state {
            AcquireState::Held => return Ok(AttemptOutcome::Held),
            AcquireState::Released | AcquireState::Failed => {
                return Err(CacheError::User(format!(
                    "acquisition of {} already finished",
                    self.key
                )))
            }
            AcquireState::Unacquired => {
                self.started = Some(Instant::now());
                AcquireState::Acquiring { attempt: 1 }
            }
            AcquireState::Acquiring { attempt } => AcquireState::Acquiring {
                attempt: attempt + 1,
            },
        };

        match self.try_once() {
            Ok(AttemptOutcome::Held) => {
                self.state = AcquireState::Held;
                Ok(AttemptOutcome::Held)
            }
            Ok(retry) => Ok(retry),
            Err(e) => {
                self.state = AcquireState::Failed;
                Err(e)
            }
        }
    }

    /// Attempt until the entry is held, a fatal error occurs, or the
    /// timeout passes
    pub fn run(mut self) -> CacheResult<CacheHandle<'a>> {
        let timeout = self.cache.settings.acquire_timeout;
        let poll = self.cache.settings.poll_interval;

        loop {
            let reason = match self.attempt()? {
                AttemptOutcome::Held => break,
                AttemptOutcome::Retry(reason) => reason,
            };

            let waited = self.started.map(|s| s.elapsed()).unwrap_or_default();
            if waited >= timeout {
                self.state = AcquireState::Failed;
                warn!("Gave up on {} after {:?}", self.key, waited);
                return Err(CacheError::LockTimeout {
                    lock_path: self.paths.lock.clone(),
                    waited,
                    source: self.first_error.take(),
                });
            }

            debug!("Retrying {} ({:?})", self.key, reason);
            if reason.backs_off() {
                std::thread::sleep(poll.min(timeout - waited));
            }
        }

        self.into_handle().ok_or_else(|| {
            CacheError::User("acquisition reported held without a lock".to_string())
        })
    }

    /// Turn a held acquisition into a handle
    pub fn into_handle(mut self) -> Option<CacheHandle<'a>> {
        let (lock, record) = self.held.take()?;
        Some(CacheHandle {
            cache: self.cache,
            key: self.key,
            paths: self.paths,
            record,
            lock: Some(lock),
            state: AcquireState::Held,
        })
    }

    fn try_once(&mut self) -> CacheResult<AttemptOutcome> {
        match try_claim_exclusive(&self.paths) {
            Ok(Attempt::Acquired(claim)) => self.build(claim),
            Ok(Attempt::Busy) => self.open_existing(),
            Err(e) => self.lock_error(e),
        }
    }

    fn build(&mut self, claim: ExclusiveClaim) -> CacheResult<AttemptOutcome> {
        let outcome = EntryBuilder::new(self.source, self.cache.package.as_ref(), &self.ctx)
            .cache_invalid_package_as_file(self.cache.settings.cache_invalid_package_as_file)
            .build(claim, &self.key, self.requested)?;

        match outcome {
            BuildOutcome::Built(_) => self.open_existing(),
            BuildOutcome::RaceLost => Ok(AttemptOutcome::Retry(RetryReason::RaceLost)),
        }
    }

    fn open_existing(&mut self) -> CacheResult<AttemptOutcome> {
        let shared = match open_shared(&self.paths) {
            Ok(Attempt::Acquired(shared)) => shared,
            Ok(Attempt::Busy) => return Ok(AttemptOutcome::Retry(RetryReason::SharedBusy)),
            Err(e) => return self.lock_error(e),
        };

        let verdict = if self.paths.dir.exists() {
            let (source, key, ctx) = (self.source, &self.key, &self.ctx);
            self.cache.validator.evaluate(
                shared.read_record(),
                shared.last_access(),
                self.requested,
                || source.metadata(key, ctx),
            )?
        } else {
            Verdict::Rebuild(RebuildReason::MissingEntry)
        };

        match verdict {
            Verdict::Reuse(record) => {
                debug!("Holding {} ({})", self.key, record.format);
                self.held = Some((shared, record));
                Ok(AttemptOutcome::Held)
            }
            Verdict::Rebuild(reason) => {
                drop(shared);
                self.reclaim(reason)
            }
        }
    }

    /// Tear down a stale entry so the next attempt can build it
    fn reclaim(&mut self, reason: RebuildReason) -> CacheResult<AttemptOutcome> {
        let claim = match claim_existing(&self.paths) {
            Ok(Attempt::Acquired(claim)) => claim,
            Ok(Attempt::Busy) => return Ok(AttemptOutcome::Retry(RetryReason::ClaimBusy)),
            Err(e) => return self.lock_error(e),
        };

        info!("Rebuilding {}: {}", self.key, reason);
        let cleanup = claim.remove_entry();
        if cleanup.is_clean() {
            return Ok(AttemptOutcome::Retry(RetryReason::Rebuild(reason)));
        }

        for failure in cleanup.failures() {
            warn!("Tearing down {}: {}", self.key, failure);
        }
        if let Some(e) = cleanup.into_first_error() {
            self.note(e);
        }
        Ok(AttemptOutcome::Retry(RetryReason::Transient))
    }

    fn lock_error(&mut self, err: LockError) -> CacheResult<AttemptOutcome> {
        match err {
            LockError::RootInaccessible { path, source } => {
                Err(CacheError::CachePathInaccessible { path, source })
            }
            LockError::Io { path, source } => {
                debug!("Transient error on {}: {}", path.display(), source);
                self.note(source);
                Ok(AttemptOutcome::Retry(RetryReason::Transient))
            }
        }
    }

    fn note(&mut self, err: io::Error) {
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }
}

/// Shared hold on a built entry
///
/// Releasing, explicitly or by drop, stamps the access time and runs an
/// eviction sweep.
pub struct CacheHandle<'a> {
    cache: &'a PackageCache,
    key: CacheKey,
    paths: EntryPaths,
    record: LockRecord,
    lock: Option<SharedLock>,
    state: AcquireState,
}

impl CacheHandle<'_> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Entry directory
    pub fn path(&self) -> &Path {
        &self.paths.dir
    }

    pub fn lock_path(&self) -> &Path {
        &self.paths.lock
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn format(&self) -> StorageFormat {
        self.record.format
    }

    /// Content failed package validation and was stored as a file
    pub fn is_invalid_package(&self) -> bool {
        self.record.format == StorageFormat::InvalidPackageWrittenAsFile
    }

    /// The single stored file, for entries not stored as an extracted package
    pub fn content_file(&self) -> CacheResult<Option<PathBuf>> {
        if !self.record.format.is_single_file() {
            return Ok(None);
        }
        let entries = fs::read_dir(&self.paths.dir)
            .map_err(|e| CacheError::io(format!("listing {}", self.paths.dir.display()), e))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| CacheError::io(format!("listing {}", self.paths.dir.display()), e))?;
            if entry.path().is_file() {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    pub fn state(&self) -> AcquireState {
        self.state
    }

    /// Release now instead of at drop
    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        if let Err(e) = touch_access_time(&self.paths) {
            debug!("Cannot stamp access time of {}: {}", self.key, e);
        }
        drop(lock);
        self.state = AcquireState::Released;
        debug!("Released {}", self.key);
        self.cache.sweep();
    }
}

impl Drop for CacheHandle<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
