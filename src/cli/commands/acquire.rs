//! Acquire command - build or reuse an entry and report it

use crate::cache::{CacheHandle, CacheKey, PackageCache, RequestedFormat};
use crate::cli::args::{AcquireArgs, OutputFormat};
use crate::cli::output;
use crate::config::Config;
use crate::error::{CacheError, CacheResult};
use crate::source::{DirectoryRepository, TarPackage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Entry details printed after acquisition
#[derive(Debug, Serialize)]
struct AcquiredEntry {
    key: String,
    name: String,
    path: PathBuf,
    content_file: Option<PathBuf>,
    format: String,
    invalid_package: bool,
    length: u64,
    last_modified: Option<DateTime<Utc>>,
}

impl AcquiredEntry {
    fn from_handle(handle: &CacheHandle<'_>) -> CacheResult<Self> {
        let record = handle.record();
        Ok(Self {
            key: handle.key().to_string(),
            name: handle.key().entry_name(),
            path: handle.path().to_path_buf(),
            content_file: handle.content_file()?,
            format: record.format.to_string(),
            invalid_package: handle.is_invalid_package(),
            length: record.length,
            last_modified: record.last_modified(),
        })
    }
}

/// Execute the acquire command
pub fn execute(args: AcquireArgs, config: &Config) -> CacheResult<()> {
    let mut settings = config.cache.to_settings()?;
    if let Some(secs) = args.timeout {
        settings.acquire_timeout = Duration::from_secs(secs);
    }

    let repository = args
        .repository
        .clone()
        .or_else(|| config.source.repository_path.clone())
        .ok_or_else(|| {
            CacheError::User(
                "No repository given; pass --repository or set source.repository_path".to_string(),
            )
        })?;
    let source = DirectoryRepository::new(repository);

    let cache = PackageCache::new(settings)?
        .with_package_format(TarPackage::new(config.source.manifest.as_str()));
    let key = CacheKey::for_resource(args.resource, args.version);
    let requested = if args.as_file {
        RequestedFormat::AsFile
    } else if args.as_package {
        RequestedFormat::AsPackage
    } else {
        cache.default_format()
    };

    let handle = cache.acquire_with(&key, &source, requested)?;
    let entry = AcquiredEntry::from_handle(&handle)?;

    match args.format {
        OutputFormat::Table => print_table(&entry),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entry)?),
        OutputFormat::Plain => {
            let path = entry.content_file.as_ref().unwrap_or(&entry.path);
            println!("{}", path.display());
        }
    }

    if args.hold > 0 {
        debug!("Holding {} for {}s", key, args.hold);
        std::thread::sleep(Duration::from_secs(args.hold));
    }
    handle.release();
    Ok(())
}

fn print_table(entry: &AcquiredEntry) {
    output::section("Cache entry");
    output::key_value("Key", &entry.key);
    output::key_value("Name", &entry.name);
    output::key_value("Path", &entry.path.display().to_string());
    if let Some(ref file) = entry.content_file {
        output::key_value("File", &file.display().to_string());
    }
    output::key_value_status("Format", &entry.format, !entry.invalid_package);
    output::key_value("Length", &entry.length.to_string());
    if let Some(modified) = entry.last_modified {
        output::key_value("Modified", &modified.format("%Y-%m-%d %H:%M:%S").to_string());
    }
    if entry.invalid_package {
        output::step_warn_hint(
            "Content is not a valid package",
            "stored as a single file and reused for every format",
        );
    }
}
