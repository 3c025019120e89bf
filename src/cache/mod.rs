//! Multi-process safe disk cache for content packages
//!
//! Each entry lives under the cache root as a directory plus a sibling lock
//! file:
//!
//! ```text
//! <root>/<ENCODED_KEY>/         extracted package or a single raw file
//! <root>/<ENCODED_KEY>.lock     lock record, also the mutual exclusion token
//! <root>/<ENCODED_KEY>.lock.time  access stamp, only when the lock can't be stamped
//! ```
//!
//! All coordination goes through the filesystem, so unrelated processes
//! sharing a root see a consistent view without any server.
//!
//! # Entry Lifecycle
//!
//! | Step | Lock | Who |
//! |------|------|-----|
//! | Build | exclusive (new file) | first acquirer |
//! | Use | shared | any number of readers |
//! | Rebuild | exclusive (existing file) | acquirer that found it stale |
//! | Evict | exclusive (existing file) | sweep, once idle past expiration |

pub mod builder;
pub mod cleanup;
pub mod evict;
pub mod handle;
pub mod key;
pub mod lockfile;
pub mod record;
pub mod staleness;

pub use builder::{BuildOutcome, EntryBuilder};
pub use cleanup::{CleanupFailure, CleanupReport};
pub use evict::{Evictor, SweepReport};
pub use handle::{
    AcquireState, Acquisition, AttemptOutcome, CacheHandle, CacheSettings, PackageCache,
    RetryReason,
};
pub use key::{encode, is_entry_name, CacheKey, EntryPaths};
pub use record::{LockRecord, RecordDefect, RequestedFormat, SourceMetadata, StorageFormat};
pub use staleness::{RebuildReason, StalenessValidator, Verdict};
