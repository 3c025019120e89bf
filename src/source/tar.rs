//! Tar package format
//!
//! A package is a tar archive holding a manifest at its root plus any number
//! of regular files and directories. Links, absolute paths and paths that
//! climb out of the archive root are rejected.

use super::{PackageFormat, ValidationReport};
use crate::error::{CacheError, CacheResult};
use std::io::{self, Cursor};
use std::path::{Component, Path};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

/// Manifest every package must carry at its root
pub const DEFAULT_MANIFEST: &str = "imsmanifest.xml";

/// Tar archive validator and extractor
#[derive(Debug, Clone)]
pub struct TarPackage {
    manifest: String,
}

impl Default for TarPackage {
    fn default() -> Self {
        Self::new(DEFAULT_MANIFEST)
    }
}

impl TarPackage {
    /// Package format requiring `manifest` at the archive root
    pub fn new(manifest: impl Into<String>) -> Self {
        Self {
            manifest: manifest.into(),
        }
    }

    /// Build a package archive from `(path, contents)` pairs
    pub fn pack(files: &[(&str, &[u8])]) -> io::Result<Vec<u8>> {
        let mut builder = Builder::new(Vec::new());
        for (path, contents) in files {
            let mut header = Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(EntryType::Regular);
            builder.append_data(&mut header, path, *contents)?;
        }
        builder.into_inner()
    }

    fn scan(&self, bytes: &[u8], report: &mut ValidationReport) -> io::Result<()> {
        let mut archive = Archive::new(Cursor::new(bytes));
        let mut count = 0usize;
        let mut has_manifest = false;

        for entry in archive.entries()? {
            let entry = entry?;
            let path = entry.path()?.into_owned();
            count += 1;

            if !is_contained(&path) {
                report.error(format!("entry escapes the package root: {}", path.display()));
                continue;
            }

            match entry.header().entry_type() {
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                    if path == Path::new(&self.manifest) {
                        has_manifest = true;
                    }
                }
                EntryType::Directory => {}
                EntryType::Symlink | EntryType::Link => {
                    report.error(format!("links are not allowed: {}", path.display()));
                }
                other => {
                    report.warning(format!(
                        "ignoring entry {} of type {:?}",
                        path.display(),
                        other
                    ));
                }
            }
        }

        if count == 0 {
            report.error("archive is empty");
        } else if !has_manifest {
            report.error(format!("missing {} at package root", self.manifest));
        }
        Ok(())
    }
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl PackageFormat for TarPackage {
    fn validate(&self, bytes: &[u8]) -> ValidationReport {
        let mut report = ValidationReport::default();
        if let Err(e) = self.scan(bytes, &mut report) {
            report.error(format!("not a tar archive: {}", e));
        }
        report
    }

    fn extract(&self, bytes: &[u8], dest: &Path) -> CacheResult<()> {
        let report = self.validate(bytes);
        if report.has_errors() {
            return Err(CacheError::InvalidPackage {
                messages: report.error_messages(),
            });
        }

        let mut archive = Archive::new(Cursor::new(bytes));
        let entries = archive
            .entries()
            .map_err(|e| CacheError::io("reading package entries", e))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| CacheError::io("reading package entry", e))?;
            match entry.header().entry_type() {
                EntryType::Regular
                | EntryType::Continuous
                | EntryType::GNUSparse
                | EntryType::Directory => {}
                _ => continue,
            }
            entry
                .unpack_in(dest)
                .map_err(|e| CacheError::io(format!("extracting into {}", dest.display()), e))?;
        }

        debug!("Extracted package into {}", dest.display());
        Ok(())
    }
}
