//! Sweep command - evict expired entries now

use crate::cache::{PackageCache, SweepReport};
use crate::cli::args::{OutputFormat, SweepArgs};
use crate::cli::output;
use crate::config::Config;
use crate::error::CacheResult;
use std::time::Duration;

/// Execute the sweep command
pub fn execute(args: SweepArgs, config: &Config) -> CacheResult<()> {
    let mut settings = config.cache.to_settings()?;
    if let Some(secs) = args.older_than {
        settings.expiration = Some(Duration::from_secs(secs));
    }
    if let Some(max) = args.max {
        settings.max_evictions_per_sweep = max;
    }

    if settings.expiration.is_none() {
        if matches!(args.format, OutputFormat::Table) {
            output::step_warn_hint(
                "No expiration configured, nothing to evict",
                "pass --older-than or set cache.expiration_secs",
            );
        }
        return print_report(&SweepReport::default(), args.format);
    }

    let cache = PackageCache::new(settings)?;
    let report = cache.sweep();
    print_report(&report, args.format)
}

fn print_report(report: &SweepReport, format: OutputFormat) -> CacheResult<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Plain => println!("{}", report.evicted),
        OutputFormat::Table => {
            output::section("Sweep");
            output::key_value("Scanned", &report.scanned.to_string());
            output::key_value("Evicted", &report.evicted.to_string());
            output::key_value("Skipped", &report.skipped.to_string());
            if report.stale_claims > 0 {
                output::key_value("Stale claims", &report.stale_claims.to_string());
            }
            for error in &report.errors {
                output::step_warn_hint(error, "left in place");
            }
            if report.complete {
                output::step_ok("Sweep complete");
            } else {
                output::step_ok_detail("Sweep stopped early", "run again to continue");
            }
        }
    }
    Ok(())
}
