//! pkgcache - Multi-process safe disk cache for content packages
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use pkgcache::cli::{Cli, Commands};
use pkgcache::config::ConfigManager;
use pkgcache::error::CacheResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn run() -> CacheResult<()> {
    let cli = Cli::parse();

    // Key command needs neither config nor logging
    if let Commands::Key(args) = cli.command {
        return pkgcache::cli::commands::key(args);
    }

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let mut config = config_manager.load()?;
    if let Some(path) = cli.cache_path {
        config.cache.cache_path = Some(path);
    }

    init_logging(cli.verbose, &config.general.log_format);

    match cli.command {
        Commands::Key(_) => unreachable!("Key handled above"),
        Commands::Acquire(args) => pkgcache::cli::commands::acquire(args, &config),
        Commands::List(args) => pkgcache::cli::commands::list(args, &config),
        Commands::Sweep(args) => pkgcache::cli::commands::sweep(args, &config),
        Commands::Config(args) => pkgcache::cli::commands::config(args, &config_manager, &config),
    }
}

/// Install the tracing subscriber: 0 = warn, 1 = info, 2+ = debug
fn init_logging(verbose: u8, log_format: &str) {
    let filter = match verbose {
        0 => EnvFilter::new("pkgcache=warn"),
        1 => EnvFilter::new("pkgcache=info"),
        _ => EnvFilter::new("pkgcache=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
