//! List command - show cache entries

use crate::cache::{is_entry_name, lockfile, EntryPaths, LockRecord};
use crate::cli::args::{ListArgs, OutputFormat};
use crate::cli::output;
use crate::config::Config;
use crate::error::{CacheError, CacheResult};
use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One entry as shown by `list`
#[derive(Debug, Serialize)]
struct EntryInfo {
    name: String,
    path: PathBuf,
    format: Option<String>,
    length: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
    last_access: Option<DateTime<Utc>>,
    disk_bytes: u64,
    problem: Option<String>,
}

/// Execute the list command
pub fn execute(args: ListArgs, config: &Config) -> CacheResult<()> {
    let settings = config.cache.to_settings()?;
    let entries = collect_entries(&settings.cache_path)?;

    if entries.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => output::step_info("No cache entries"),
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&entries),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.name);
            }
        }
    }

    Ok(())
}

fn collect_entries(root: &Path) -> CacheResult<Vec<EntryInfo>> {
    let mut entries = Vec::new();

    for item in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
        let item = item.map_err(|e| {
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
            CacheError::CachePathInaccessible {
                path: root.to_path_buf(),
                source,
            }
        })?;
        let Some(paths) = EntryPaths::from_lock(item.path()) else {
            continue;
        };
        if is_entry_name(&paths.name()) {
            entries.push(inspect(&paths));
        }
    }

    Ok(entries)
}

/// Read an entry's record without counting as a use
fn inspect(paths: &EntryPaths) -> EntryInfo {
    let last_access = lockfile::last_access_time(paths).ok();
    let contents = lockfile::peek_record(paths);

    let (record, problem) = match contents {
        Ok(text) => match LockRecord::parse(&text) {
            Ok(record) => (Some(record), None),
            Err(defect) => (None, Some(defect.to_string())),
        },
        Err(e) => (None, Some(e.to_string())),
    };
    let problem = problem.or_else(|| {
        (!paths.dir.exists()).then(|| "entry directory missing".to_string())
    });

    EntryInfo {
        name: paths.name(),
        path: paths.dir.clone(),
        format: record.map(|r| r.format.to_string()),
        length: record.map(|r| r.length),
        last_modified: record.and_then(|r| r.last_modified()),
        last_access: last_access.map(DateTime::<Utc>::from),
        disk_bytes: disk_usage(&paths.dir),
        problem,
    }
}

fn disk_usage(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn print_table(entries: &[EntryInfo]) {
    output::section("Cache entries");

    println!(
        "{:<36} {:<28} {:>10} {:<17}",
        style("NAME").bold(),
        style("FORMAT").bold(),
        style("SIZE").bold(),
        style("LAST USED").bold()
    );
    println!("{}", "-".repeat(94));

    let mut total = 0u64;
    for entry in entries {
        let format = match (&entry.format, &entry.problem) {
            (_, Some(problem)) => style(problem.clone()).red(),
            (Some(format), None) if format == "InvalidPackageWrittenAsFile" => {
                style(format.clone()).yellow()
            }
            (Some(format), None) => style(format.clone()).green(),
            (None, None) => style("unknown".to_string()).dim(),
        };
        let last_used = entry
            .last_access
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<36} {:<28} {:>10} {:<17}",
            entry.name,
            format,
            human_size(entry.disk_bytes),
            last_used
        );
        total += entry.disk_bytes;
    }

    println!();
    println!("{} entr(ies), {}", entries.len(), human_size(total));
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
