//! External collaborators of the cache
//!
//! The cache never talks to a repository or parses packages itself. It calls
//! a [`ResourceSource`] for bytes and freshness data, and a [`PackageFormat`]
//! to validate and extract packages. Reference implementations for a local
//! directory repository and tar packages live in submodules.

pub mod dir;
pub mod tar;

pub use self::dir::DirectoryRepository;
pub use self::tar::TarPackage;

use crate::cache::{CacheKey, SourceMetadata};
use crate::error::CacheResult;
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Per-call context handed to the source
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    /// Identity to access the repository with, passed through untouched
    pub identity: Option<String>,
}

/// Resource bytes plus the metadata describing them
pub struct FetchedResource {
    /// Content stream
    pub reader: Box<dyn Read + Send>,
    /// Freshness data for the fetched content
    pub metadata: SourceMetadata,
    /// Suggested file name when stored as a single file
    pub filename: String,
}

impl fmt::Debug for FetchedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedResource")
            .field("metadata", &self.metadata)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

/// Supplier of resource content, typically a remote repository client
pub trait ResourceSource: Send + Sync {
    /// Current freshness data of the resource, without its content
    fn metadata(&self, key: &CacheKey, ctx: &FetchContext) -> CacheResult<SourceMetadata>;

    /// Fetch the resource content; called again on every rebuild
    fn fetch(&self, key: &CacheKey, ctx: &FetchContext) -> CacheResult<FetchedResource>;
}

/// Severity of a validation message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// One validation finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationMessage {
    pub severity: Severity,
    pub text: String,
}

/// Result of validating a byte stream as a package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub messages: Vec<ValidationMessage>,
}

impl ValidationReport {
    /// Add an error
    pub fn error(&mut self, text: impl Into<String>) {
        self.messages.push(ValidationMessage {
            severity: Severity::Error,
            text: text.into(),
        });
    }

    /// Add a warning
    pub fn warning(&mut self, text: impl Into<String>) {
        self.messages.push(ValidationMessage {
            severity: Severity::Warning,
            text: text.into(),
        });
    }

    /// Whether any error was reported
    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(|m| m.severity == Severity::Error)
    }

    /// Text of the error messages
    pub fn error_messages(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| m.severity == Severity::Error)
            .map(|m| m.text.clone())
            .collect()
    }
}

/// Package validator and extractor
pub trait PackageFormat: Send + Sync {
    /// Check whether `bytes` form a well-formed package
    fn validate(&self, bytes: &[u8]) -> ValidationReport;

    /// Write the package's file tree under `dest`, which already exists.
    ///
    /// Returns `CacheError::InvalidPackage` if the bytes aren't a package.
    fn extract(&self, bytes: &[u8], dest: &Path) -> CacheResult<()>;
}

/// Reduce a suggested file name to one safe path component
pub fn sanitize_filename(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or("");

    let cleaned: String = last
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.trim() {
        "" | "." | ".." => "content".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_errors_and_warnings() {
        let mut report = ValidationReport::default();
        report.warning("odd but fine");
        assert!(!report.has_errors());

        report.error("missing manifest");
        assert!(report.has_errors());
        assert_eq!(report.error_messages(), vec!["missing manifest".to_string()]);
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_filename("course.zip"), "course.zip");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("dir\\file.doc"), "file.doc");
        assert_eq!(sanitize_filename("trailing/"), "trailing");
    }

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_filename("a:b?.txt"), "a_b_.txt");
        assert_eq!(sanitize_filename(".."), "content");
        assert_eq!(sanitize_filename(""), "content");
    }
}
