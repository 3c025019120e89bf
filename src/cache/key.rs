//! Cache key derivation
//!
//! Maps a resource identity to a fixed-length directory name built from a
//! 32-symbol alphabet. The alphabet has no lowercase letters, so names never
//! differ only by case, and contains no path separators or reserved
//! characters on any supported filesystem.

use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Symbols used by the encoder, indexed by 5-bit value
const ENCODER_MAP: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ123456";

/// Symbols produced for a 128-bit identifier
pub const ENCODED_ID_LEN: usize = 26;

/// Symbols produced for a 32-bit version
pub const ENCODED_VERSION_LEN: usize = 7;

/// Total length of every encoded entry name
pub const ENCODED_KEY_LEN: usize = ENCODED_ID_LEN + 1 + ENCODED_VERSION_LEN;

/// Extension of the lock file that sits beside each entry directory
pub const LOCK_EXTENSION: &str = "lock";

/// Suffix of the side file used when the lock file's access time cannot be set
pub const TIME_SUFFIX: &str = ".time";

/// Identity of one cacheable resource version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Repository the resource lives in
    pub repository_id: Uuid,
    /// Sub-scope inside the repository
    pub scope_id: Uuid,
    /// Globally unique resource id
    pub resource_id: Uuid,
    /// Version number of the resource
    pub version: u32,
}

impl CacheKey {
    /// Create a key
    pub fn new(repository_id: Uuid, scope_id: Uuid, resource_id: Uuid, version: u32) -> Self {
        Self {
            repository_id,
            scope_id,
            resource_id,
            version,
        }
    }

    /// Create a key for a resource whose scopes don't matter to the source
    pub fn for_resource(resource_id: Uuid, version: u32) -> Self {
        Self::new(Uuid::nil(), Uuid::nil(), resource_id, version)
    }

    /// Directory name of the entry for this key
    ///
    /// Only the resource id and version take part: resource ids are unique
    /// across repositories, the scope ids just route the fetch.
    pub fn entry_name(&self) -> String {
        encode(self.resource_id, self.version)
    }

    /// Paths of the entry directory and its lock file under `cache_root`
    pub fn paths(&self, cache_root: &Path) -> EntryPaths {
        EntryPaths::new(cache_root, &self.entry_name())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource_id, self.version)
    }
}

/// On-disk locations belonging to one cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPaths {
    /// `<root>/<name>/`
    pub dir: PathBuf,
    /// `<root>/<name>.lock`
    pub lock: PathBuf,
}

impl EntryPaths {
    /// Build the paths for an encoded entry name
    pub fn new(cache_root: &Path, name: &str) -> Self {
        Self {
            dir: cache_root.join(name),
            lock: cache_root.join(format!("{}.{}", name, LOCK_EXTENSION)),
        }
    }

    /// Derive entry paths from a lock file path
    pub fn from_lock(lock: &Path) -> Option<Self> {
        if lock.extension()? != LOCK_EXTENSION {
            return None;
        }
        Some(Self {
            dir: lock.with_extension(""),
            lock: lock.to_path_buf(),
        })
    }

    /// Side file stamped when the lock file itself can't be touched
    pub fn time_file(&self) -> PathBuf {
        let mut name = self.lock.clone().into_os_string();
        name.push(TIME_SUFFIX);
        PathBuf::from(name)
    }

    /// Entry name (directory file name)
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Encode a resource id and version into an entry name
///
/// The result is always [`ENCODED_KEY_LEN`] characters long: the encoded id,
/// an underscore, then the encoded version.
pub fn encode(resource_id: Uuid, version: u32) -> String {
    let mut out = String::with_capacity(ENCODED_KEY_LEN);
    encode_id_into(&mut out, resource_id.as_bytes());
    out.push('_');
    encode_version_into(&mut out, version);
    out
}

/// First fifteen bytes as three 40-bit groups of eight symbols, then the
/// last byte as two symbols.
fn encode_id_into(out: &mut String, bytes: &[u8; 16]) {
    for group in bytes[..15].chunks_exact(5) {
        let mut segment = group
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
        for _ in 0..8 {
            out.push(symbol(segment));
            segment >>= 5;
        }
    }

    let last = u64::from(bytes[15]);
    out.push(symbol(last));
    out.push(symbol(last >> 5));
}

fn encode_version_into(out: &mut String, version: u32) {
    let mut value = u64::from(version);
    for _ in 0..ENCODED_VERSION_LEN {
        out.push(symbol(value));
        value >>= 5;
    }
}

fn symbol(value: u64) -> char {
    char::from(ENCODER_MAP[(value & 0x1f) as usize])
}

/// Check whether a file name looks like an encoded entry name
pub fn is_entry_name(name: &str) -> bool {
    name.len() == ENCODED_KEY_LEN
        && name.bytes().enumerate().all(|(i, b)| {
            if i == ENCODED_ID_LEN {
                b == b'_'
            } else {
                ENCODER_MAP.contains(&b)
            }
        })
}
