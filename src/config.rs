//! Configuration management for tilecache.
//!
//! This module provides the command-line interface of the `tilecache` binary:
//! - Command-line arguments via clap
//! - Environment variables with `TILECACHE_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Example
//!
//! ```ignore
//! use tilecache::config::{Cli, Command};
//!
//! let cli = Cli::parse();
//! match cli.into_command() {
//!     Command::Run(config) => println!("{} worker(s)", config.cache.worker_count()),
//!     Command::Check(config) => println!("{:?}", config.cache.disk_dir),
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `TILECACHE_MEMORY_CAPACITY` - Memory tier size, e.g. `256MB` (default: 256MB)
//! - `TILECACHE_EVICTION_THRESHOLD` - Fraction to shrink to on overflow (default: 0.75)
//! - `TILECACHE_WORKERS` - Primary pool size (default: one per core)
//! - `TILECACHE_PREFETCH_WORKERS` - Prefetch pool size (default: 1)
//! - `TILECACHE_BATCH_SIZE` - Tiles per batch job (default: 1)
//! - `TILECACHE_DISK_DIR` - Directory of the disk overflow tier (default: none)
//! - `TILECACHE_DIAGNOSTICS` - Trace every cache transition (default: false)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::cache::{StoreConfig, DEFAULT_EVICTION_THRESHOLD};
use crate::scheduler::{default_worker_count, SchedulerConfig, DEFAULT_BATCH_SIZE, DEFAULT_PREFETCH_WORKERS};
use crate::service::ServiceConfig;

// =============================================================================
// Default Values
// =============================================================================

/// Default memory capacity as given on the command line.
pub const DEFAULT_MEMORY_CAPACITY_TEXT: &str = "256MB";

/// Default number of synthetic images driven by `run`.
pub const DEFAULT_IMAGES: usize = 2;

/// Default synthetic image size in tiles per side.
pub const DEFAULT_GRID: u32 = 8;

/// Default synthetic tile edge in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

// =============================================================================
// CLI Arguments
// =============================================================================

/// tilecache - A tiled-image render cache and tile scheduler.
#[derive(Parser, Debug, Clone)]
#[command(name = "tilecache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// The selected subcommand.
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Drive a synthetic tile workload and report cache statistics.
    Run(RunConfig),

    /// Validate the configuration and probe the disk tier.
    Check(CheckConfig),
}

/// Cache and scheduler settings shared by all subcommands.
#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Memory tier capacity (e.g. "256MB", "1GiB", or plain bytes).
    ///
    /// Zero disables caching.
    #[arg(long, default_value = DEFAULT_MEMORY_CAPACITY_TEXT, env = "TILECACHE_MEMORY_CAPACITY")]
    pub memory_capacity: String,

    /// Fraction of capacity to shrink to once it is exceeded (0.0-1.0).
    #[arg(long, default_value_t = DEFAULT_EVICTION_THRESHOLD, env = "TILECACHE_EVICTION_THRESHOLD")]
    pub eviction_threshold: f64,

    /// Primary worker pool size (defaults to one per core).
    #[arg(long, env = "TILECACHE_WORKERS")]
    pub workers: Option<usize>,

    /// Prefetch worker pool size.
    #[arg(long, default_value_t = DEFAULT_PREFETCH_WORKERS, env = "TILECACHE_PREFETCH_WORKERS")]
    pub prefetch_workers: usize,

    /// Tiles per batch job for blocking and prefetch calls.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, env = "TILECACHE_BATCH_SIZE")]
    pub batch_size: usize,

    /// Directory for the disk overflow tier.
    ///
    /// If not specified, evicted tiles are dropped.
    #[arg(long, env = "TILECACHE_DISK_DIR")]
    pub disk_dir: Option<PathBuf>,

    /// Trace every cache state transition.
    #[arg(long, default_value_t = false, env = "TILECACHE_DIAGNOSTICS")]
    pub diagnostics: bool,
}

impl CacheArgs {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        parse_size(&self.memory_capacity)?;

        if !(0.0..=1.0).contains(&self.eviction_threshold) {
            return Err("eviction_threshold must be between 0.0 and 1.0".to_string());
        }

        if self.workers == Some(0) {
            return Err("workers must be greater than 0".to_string());
        }
        if self.prefetch_workers == 0 {
            return Err("prefetch_workers must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Primary pool size after applying the default.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count)
    }

    /// Build the service configuration (call validate() first).
    pub fn to_service_config(&self) -> Result<ServiceConfig, String> {
        Ok(ServiceConfig {
            store: StoreConfig {
                capacity: parse_size(&self.memory_capacity)?,
                threshold: self.eviction_threshold,
                disk_dir: self.disk_dir.clone(),
                diagnostics: self.diagnostics,
            },
            scheduler: SchedulerConfig {
                workers: self.worker_count(),
                prefetch_workers: self.prefetch_workers,
                batch_size: self.batch_size,
            },
        })
    }
}

/// Settings of the `run` command.
#[derive(Args, Debug, Clone)]
pub struct RunConfig {
    #[command(flatten)]
    pub cache: CacheArgs,

    /// Number of synthetic images to open.
    #[arg(long, default_value_t = DEFAULT_IMAGES)]
    pub images: usize,

    /// Tiles per side of each synthetic image.
    #[arg(long, default_value_t = DEFAULT_GRID)]
    pub grid: u32,

    /// Tile edge in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    pub tile_size: u32,

    /// Spill evicted tiles of the synthetic images to the disk tier.
    #[arg(long, default_value_t = false)]
    pub persistent: bool,

    /// Print final statistics as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl RunConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate()?;

        if self.images == 0 {
            return Err("images must be greater than 0".to_string());
        }
        if self.grid == 0 {
            return Err("grid must be greater than 0".to_string());
        }
        if self.tile_size == 0 || self.tile_size > 4096 {
            return Err("tile_size must be between 1 and 4096".to_string());
        }

        Ok(())
    }
}

/// Settings of the `check` command.
#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    #[command(flatten)]
    pub cache: CacheArgs,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

// =============================================================================
// Size Parsing
// =============================================================================

/// Parse a byte size such as `"100MB"`, `"1GiB"`, `"512 kb"` or `"4096"`.
///
/// Units are 1024-based and case-insensitive.
pub fn parse_size(text: &str) -> Result<usize, String> {
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    if digits.is_empty() {
        return Err(format!("Invalid size '{}': expected a number", text));
    }

    let value: usize = digits
        .parse()
        .map_err(|_| format!("Invalid size '{}': number too large", text))?;

    let multiplier: usize = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "kib" | "k" => 1024,
        "mb" | "mib" | "m" => 1024 * 1024,
        "gb" | "gib" | "g" => 1024 * 1024 * 1024,
        other => return Err(format!("Invalid size '{}': unknown unit '{}'", text, other)),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("Invalid size '{}': too large", text))
}

// =============================================================================
// Tests
// =============================================================================
