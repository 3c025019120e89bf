//! Filesystem-backed resource source
//!
//! Layout: `<root>/<resource-id>/<version>/<file>`, one file per version
//! directory. The file's modification time and length are its freshness data.

use super::{sanitize_filename, FetchContext, FetchedResource, ResourceSource};
use crate::cache::{CacheKey, SourceMetadata};
use crate::error::{CacheError, CacheResult};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resource source reading from a local directory tree
#[derive(Debug, Clone)]
pub struct DirectoryRepository {
    root: PathBuf,
}

impl DirectoryRepository {
    /// Create a repository rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Repository root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a given resource version
    pub fn version_dir(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(key.resource_id.hyphenated().to_string())
            .join(key.version.to_string())
    }

    /// Locate the single content file of a resource version
    fn content_file(&self, key: &CacheKey) -> CacheResult<PathBuf> {
        let dir = self.version_dir(key);
        let entries = fs::read_dir(&dir).map_err(|e| {
            CacheError::source_error(format!("resource {} not found at {}: {}", key, dir.display(), e))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(format!("listing {}", dir.display()), e))?;
            if entry.path().is_file() {
                files.push(entry.path());
            }
        }

        match files.len() {
            1 => Ok(files.remove(0)),
            0 => Err(CacheError::source_error(format!(
                "resource {} has no content in {}",
                key,
                dir.display()
            ))),
            n => Err(CacheError::source_error(format!(
                "resource {} has {} files in {}, expected one",
                key,
                n,
                dir.display()
            ))),
        }
    }
}

fn metadata_of(path: &Path) -> CacheResult<SourceMetadata> {
    let meta = fs::metadata(path)
        .map_err(|e| CacheError::io(format!("reading metadata of {}", path.display()), e))?;
    let modified = meta
        .modified()
        .map_err(|e| CacheError::io(format!("reading mtime of {}", path.display()), e))?;

    Ok(SourceMetadata::new(DateTime::<Utc>::from(modified), meta.len()))
}

impl ResourceSource for DirectoryRepository {
    fn metadata(&self, key: &CacheKey, _ctx: &FetchContext) -> CacheResult<SourceMetadata> {
        let path = self.content_file(key)?;
        metadata_of(&path)
    }

    fn fetch(&self, key: &CacheKey, _ctx: &FetchContext) -> CacheResult<FetchedResource> {
        let path = self.content_file(key)?;
        debug!("Fetching {} from {}", key, path.display());

        let metadata = metadata_of(&path)?;
        let file = File::open(&path)
            .map_err(|e| CacheError::io(format!("opening {}", path.display()), e))?;
        let filename = path
            .file_name()
            .map(|n| sanitize_filename(&n.to_string_lossy()))
            .unwrap_or_else(|| "content".to_string());

        Ok(FetchedResource {
            reader: Box::new(file),
            metadata,
            filename,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn publish(repo: &DirectoryRepository, key: &CacheKey, name: &str, bytes: &[u8]) {
        let dir = repo.version_dir(key);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn fetch_reads_single_file() {
        let temp = TempDir::new().unwrap();
        let repo = DirectoryRepository::new(temp.path());
        let key = CacheKey::for_resource(Uuid::new_v4(), 3);
        publish(&repo, &key, "notes.txt", b"hello");

        let mut fetched = repo.fetch(&key, &FetchContext::default()).unwrap();
        let mut body = Vec::new();
        fetched.reader.read_to_end(&mut body).unwrap();

        assert_eq!(body, b"hello");
        assert_eq!(fetched.filename, "notes.txt");
        assert_eq!(fetched.metadata.length, 5);
        assert_eq!(
            repo.metadata(&key, &FetchContext::default()).unwrap(),
            fetched.metadata
        );
    }

    #[test]
    fn missing_resource_is_source_error() {
        let temp = TempDir::new().unwrap();
        let repo = DirectoryRepository::new(temp.path());
        let key = CacheKey::for_resource(Uuid::new_v4(), 1);

        let err = repo.metadata(&key, &FetchContext::default()).unwrap_err();
        assert!(matches!(err, CacheError::Source(_)));
    }

    #[test]
    fn ambiguous_version_dir_is_rejected() {
        let temp = TempDir::new().unwrap();
        let repo = DirectoryRepository::new(temp.path());
        let key = CacheKey::for_resource(Uuid::new_v4(), 1);
        publish(&repo, &key, "a.txt", b"a");
        publish(&repo, &key, "b.txt", b"b");

        let err = repo.fetch(&key, &FetchContext::default()).unwrap_err();
        assert!(err.to_string().contains("expected one"));
    }
}
