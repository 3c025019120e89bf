//! Lock file protocol
//!
//! Every entry directory has a sibling `<name>.lock` file that serves as both
//! the mutual-exclusion token and the metadata record.
//!
//! - A *new* lock file is claimed by creating a uniquely named claim file,
//!   locking it exclusively, then hard-linking it into place. The link is the
//!   atomic create-if-absent step; the file is therefore already locked the
//!   moment it becomes visible, and no reader can observe it half-written.
//! - An *existing* lock file is claimed (for rebuild or eviction) by taking a
//!   non-blocking exclusive OS lock on it.
//! - Readers hold a non-blocking shared OS lock for as long as they use the
//!   entry. The OS locks are per open file, so they exclude threads of the
//!   same process as well as other processes.

use crate::cache::cleanup::CleanupReport;
use crate::cache::key::EntryPaths;
use crate::cache::record::{LockRecord, RecordDefect};
use filetime::FileTime;
use fs2::FileExt;
use same_file::Handle;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Extension of in-flight claim files
pub const CLAIM_EXTENSION: &str = "claim";

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    /// The cache root can't be used at all; retrying won't help
    #[error("cache root {path} is not accessible: {source}")]
    RootInaccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Unexpected I/O failure on a lock file
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the error can't be cured by retrying
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RootInaccessible { .. })
    }
}

/// Result of a non-blocking lock attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// The lock is ours
    Acquired(T),
    /// Someone else holds it, or the file vanished underneath us
    Busy,
}

/// Exclusive hold on a lock file
///
/// Dropping the claim releases the OS lock without touching the files.
#[derive(Debug)]
pub struct ExclusiveClaim {
    file: File,
    paths: EntryPaths,
}

impl ExclusiveClaim {
    /// Paths of the claimed entry
    pub fn paths(&self) -> &EntryPaths {
        &self.paths
    }

    /// Write the record and flush it to disk
    ///
    /// The claim stays held; call [`release`](Self::release) afterwards so
    /// readers can open the entry.
    pub fn write_record(&mut self, record: &LockRecord) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.write_all(record.to_line().as_bytes())?;
        self.file.sync_all()?;
        debug!("Wrote lock record {}", self.paths.lock.display());
        Ok(())
    }

    /// Release the claim, leaving the files in place
    pub fn release(self) {
        drop(self);
    }

    /// Delete the entry directory, then the lock file and its time file,
    /// then release the claim
    pub fn remove_entry(self) -> CleanupReport {
        let mut report = CleanupReport::new();
        report.remove_dir_all(&self.paths.dir, "remove entry directory");
        report.remove_file(&self.paths.lock, "remove lock file");
        report.remove_file(&self.paths.time_file(), "remove time file");
        report
    }
}

impl Drop for ExclusiveClaim {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Shared hold on a built entry
#[derive(Debug)]
pub struct SharedLock {
    file: File,
    paths: EntryPaths,
    contents: String,
    last_access: Option<SystemTime>,
}

impl SharedLock {
    /// Paths of the locked entry
    pub fn paths(&self) -> &EntryPaths {
        &self.paths
    }

    /// Parse the record read when the lock was opened
    pub fn read_record(&self) -> Result<LockRecord, RecordDefect> {
        LockRecord::parse(&self.contents)
    }

    /// Last access time captured before the record was read
    pub fn last_access(&self) -> Option<SystemTime> {
        self.last_access
    }
}

impl Drop for SharedLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn cache_root(paths: &EntryPaths) -> &Path {
    paths.lock.parent().unwrap_or_else(|| Path::new("."))
}

/// Claim a lock file that doesn't exist yet
///
/// Returns `Busy` if the lock file already exists. Failing to create the
/// claim file is fatal: its name is unique, so nothing can contend for it.
pub fn try_claim_exclusive(paths: &EntryPaths) -> LockResult<Attempt<ExclusiveClaim>> {
    let root = cache_root(paths);
    let claim_path = root.join(format!(
        ".{}.{}.{}",
        paths.name(),
        Uuid::new_v4().simple(),
        CLAIM_EXTENSION
    ));

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&claim_path)
        .map_err(|source| LockError::RootInaccessible {
            path: root.to_path_buf(),
            source,
        })?;

    if let Err(e) = file.lock_exclusive() {
        let _ = fs::remove_file(&claim_path);
        return Err(LockError::io(&claim_path, e));
    }

    let linked = fs::hard_link(&claim_path, &paths.lock);
    if let Err(e) = fs::remove_file(&claim_path) {
        warn!("Failed to remove claim file {}: {}", claim_path.display(), e);
    }

    match linked {
        Ok(()) => {
            debug!("Claimed {}", paths.lock.display());
            Ok(Attempt::Acquired(ExclusiveClaim {
                file,
                paths: paths.clone(),
            }))
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Attempt::Busy),
        Err(e) => {
            probe_root(root)?;
            Err(LockError::io(&paths.lock, e))
        }
    }
}

/// Claim an existing lock file exclusively, for rebuild or eviction
pub fn claim_existing(paths: &EntryPaths) -> LockResult<Attempt<ExclusiveClaim>> {
    let file = match OpenOptions::new().read(true).write(true).open(&paths.lock) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Attempt::Busy),
        Err(e) => return Err(LockError::io(&paths.lock, e)),
    };

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(Attempt::Busy),
        Err(e) => return Err(LockError::io(&paths.lock, e)),
    }

    // The file may have been torn down and replaced between our open and lock
    if !still_linked(&file, &paths.lock).map_err(|e| LockError::io(&paths.lock, e))? {
        return Ok(Attempt::Busy);
    }

    Ok(Attempt::Acquired(ExclusiveClaim {
        file,
        paths: paths.clone(),
    }))
}

/// Open an existing lock file for shared reading
///
/// Returns `Busy` while a builder holds the file or if it has vanished.
pub fn open_shared(paths: &EntryPaths) -> LockResult<Attempt<SharedLock>> {
    let mut file = match File::open(&paths.lock) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Attempt::Busy),
        Err(e) => return Err(LockError::io(&paths.lock, e)),
    };

    match FileExt::try_lock_shared(&file) {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(Attempt::Busy),
        Err(e) => return Err(LockError::io(&paths.lock, e)),
    }

    if !still_linked(&file, &paths.lock).map_err(|e| LockError::io(&paths.lock, e))? {
        return Ok(Attempt::Busy);
    }

    // Reading may bump atime on some mounts, so capture it first
    let last_access = last_access_time(paths).ok();

    let mut raw = Vec::new();
    file.read_to_end(&mut raw)
        .map_err(|e| LockError::io(&paths.lock, e))?;

    Ok(Attempt::Acquired(SharedLock {
        file,
        paths: paths.clone(),
        contents: String::from_utf8_lossy(&raw).into_owned(),
        last_access,
    }))
}

/// Read the raw record without taking a lock or counting as a use
///
/// On Linux the file is opened with `O_NOATIME` so that inspecting an entry
/// never refreshes its access time. Where that flag is refused, the plain
/// read may bump atime, which only ever delays eviction.
pub fn peek_record(paths: &EntryPaths) -> io::Result<String> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NOATIME);
    }

    let mut file = match options.open(&paths.lock) {
        Ok(file) => file,
        // O_NOATIME requires owning the file
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => File::open(&paths.lock)?,
        Err(e) => return Err(e),
    };
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;
    Ok(raw)
}

/// Whether `file` is still the file found at `path`
///
/// A lock taken on an unlinked or replaced lock file protects nothing.
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    let held = Handle::from_file(file.try_clone()?)?;
    match Handle::from_path(path) {
        Ok(current) => Ok(held == current),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Check the cache root is still listable
pub fn probe_root(root: &Path) -> LockResult<()> {
    fs::read_dir(root)
        .map(|_| ())
        .map_err(|source| LockError::RootInaccessible {
            path: root.to_path_buf(),
            source,
        })
}

/// Stamp the entry's last access time
///
/// Falls back to the side time file when the lock file can't be stamped.
pub fn touch_access_time(paths: &EntryPaths) -> io::Result<()> {
    let now = FileTime::now();
    match filetime::set_file_atime(&paths.lock, now) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(
                "Cannot stamp {} ({}), using time file",
                paths.lock.display(),
                e
            );
            let time_file = paths.time_file();
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&time_file)?;
            filetime::set_file_atime(&time_file, now)
        }
    }
}

/// Last access time of an entry: the later of the lock file's and the time
/// file's access times
pub fn last_access_time(paths: &EntryPaths) -> io::Result<SystemTime> {
    let lock_access = fs::metadata(&paths.lock)?.accessed()?;
    let time_access = fs::metadata(paths.time_file()).and_then(|m| m.accessed());

    Ok(match time_access {
        Ok(t) if t > lock_access => t,
        _ => lock_access,
    })
}
