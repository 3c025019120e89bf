//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use uuid::Uuid;

/// pkgcache - Multi-process safe disk cache for content packages
///
/// Builds, reuses and evicts cache entries shared by every process that
/// points at the same cache root.
#[derive(Parser, Debug)]
#[command(name = "pkgcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "PKGCACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cache root, overriding cache.cache_path
    #[arg(long, global = true, env = "PKGCACHE_PATH")]
    pub cache_path: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the entry name for a resource version
    Key(KeyArgs),

    /// Acquire an entry, building it if needed, and print where it is
    Acquire(AcquireArgs),

    /// List cache entries
    List(ListArgs),

    /// Evict expired entries now
    Sweep(SweepArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the key command
#[derive(Parser, Debug)]
pub struct KeyArgs {
    /// Resource id
    pub resource: Uuid,

    /// Resource version
    #[arg(id = "resource_version", value_name = "VERSION")]
    pub version: u32,
}

/// Arguments for the acquire command
#[derive(Parser, Debug)]
pub struct AcquireArgs {
    /// Resource id
    pub resource: Uuid,

    /// Resource version
    #[arg(id = "resource_version", value_name = "VERSION")]
    pub version: u32,

    /// Directory repository to fetch from (default: source.repository_path)
    #[arg(short, long)]
    pub repository: Option<PathBuf>,

    /// Store the raw content as a single file
    #[arg(long, conflicts_with = "as_package")]
    pub as_file: bool,

    /// Extract the content as a package, even if always_cache_as_file is set
    #[arg(long)]
    pub as_package: bool,

    /// Give up after this many seconds (default: cache.acquire_timeout_secs)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Keep the entry held for this many seconds before releasing it
    #[arg(long, default_value = "0")]
    pub hold: u64,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the sweep command
#[derive(Parser, Debug)]
pub struct SweepArgs {
    /// Evict entries idle longer than this many seconds (default: cache.expiration_secs)
    #[arg(long)]
    pub older_than: Option<u64>,

    /// Maximum entries to evict (0 = unbounded)
    #[arg(long)]
    pub max: Option<usize>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
