//! tilecache - A tiled-image render cache and tile scheduler.
//!
//! This binary drives a synthetic workload through the cache or checks a
//! configuration.

use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use image::{Rgb, RgbImage};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tilecache::{
    cache::{FileOverflow, OverflowStore},
    config::{parse_size, CacheArgs, CheckConfig, Cli, Command, RunConfig},
    CacheStats, ComputeError, ImageHandle, PixelBuffer, TileEvent, TileKey, TileListener,
    TileService,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Run(config) => run_workload(config).await,
        Command::Check(config) => run_check(config).await,
    }
}

// =============================================================================
// Run Command
// =============================================================================

/// Counts tracked tile outcomes.
#[derive(Default)]
struct ProgressListener {
    computed: AtomicUsize,
    failed: AtomicUsize,
}

impl TileListener for ProgressListener {
    fn tile_computed(&self, _event: &TileEvent, _tile: &Arc<PixelBuffer>) {
        self.computed.fetch_add(1, Ordering::Relaxed);
    }

    fn tile_failed(&self, event: &TileEvent, error: &ComputeError) {
        warn!("Tile ({}, {}) of {} failed: {}", event.x, event.y, event.owner, error);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

async fn run_workload(config: RunConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let service_config = match config.cache.to_service_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Configuration:");
    info!("  Memory: {} bytes", service_config.store.capacity);
    info!("  Eviction threshold: {}", service_config.store.threshold);
    info!(
        "  Workers: {} primary, {} prefetch, batch size {}",
        service_config.scheduler.workers,
        service_config.scheduler.prefetch_workers,
        service_config.scheduler.batch_size
    );
    match service_config.store.disk_dir {
        Some(ref dir) => info!("  Disk tier: {}", dir.display()),
        None => info!("  Disk tier: disabled"),
    }
    info!(
        "  Workload: {} image(s) of {}x{} tiles, {}px",
        config.images, config.grid, config.grid, config.tile_size
    );

    let service = match TileService::start(&service_config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to start tile service: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let images: Vec<ImageHandle> = (0..config.images)
        .map(|seed| {
            let tile_size = config.tile_size;
            service.open_image(
                move |x: u32, y: u32| Ok(gradient_tile(seed as u8, x, y, tile_size)),
                config.persistent,
            )
        })
        .collect();

    let listener = Arc::new(ProgressListener::default());
    let mut exit = ExitCode::SUCCESS;

    for image in &images {
        if let Err(e) = drive_image(&service, image, config.grid, listener.clone()).await {
            error!("Workload for {} failed: {}", image.id(), e);
            exit = ExitCode::FAILURE;
        }
    }

    // Explicit release for the first image, reaper for the rest
    let mut images = images.into_iter();
    if let Some(first) = images.next() {
        let purged = service.release_image(first).await;
        info!("Released first image ({} tile(s) purged)", purged);
    }
    drop(images);

    info!(
        "Tracked tiles: {} computed, {} failed",
        listener.computed.load(Ordering::Relaxed),
        listener.failed.load(Ordering::Relaxed)
    );

    service.shutdown().await;
    report_stats(&service.stats().await, config.json);

    exit
}

/// Viewport, tracked row, prefetch of the rest, then a full render.
async fn drive_image(
    service: &TileService,
    image: &ImageHandle,
    grid: u32,
    listener: Arc<ProgressListener>,
) -> Result<(), ComputeError> {
    let all: Vec<(u32, u32)> = (0..grid)
        .flat_map(|y| (0..grid).map(move |x| (x, y)))
        .collect();

    let viewport_side = (grid / 2).max(1);
    let viewport: Vec<(u32, u32)> = all
        .iter()
        .copied()
        .filter(|&(x, y)| x < viewport_side && y < viewport_side)
        .collect();

    let tiles = service.schedule_blocking(image, &viewport).await?;
    info!("{}: viewport of {} tile(s) ready", image.id(), tiles.len());

    let row: Vec<(u32, u32)> = (0..grid).map(|x| (x, grid - 1)).collect();
    let request = service.schedule_tracked(image, &row, vec![listener])?;

    let rest: Vec<(u32, u32)> = all
        .iter()
        .copied()
        .filter(|coord| !viewport.contains(coord) && !row.contains(coord))
        .collect();
    if !rest.is_empty() {
        service.prefetch(image, &rest).await?;
    }

    request.wait().await;
    info!("{}: tracked row finished", image.id());

    let full = service.schedule_blocking(image, &all).await?;
    info!("{}: full render of {} tile(s) ready", image.id(), full.len());

    Ok(())
}

/// Deterministic RGB gradient, distinct per image and tile.
fn gradient_tile(seed: u8, x: u32, y: u32, size: u32) -> PixelBuffer {
    let image = RgbImage::from_fn(size, size, |px, py| {
        Rgb([
            (px * 255 / size) as u8 ^ seed,
            (py * 255 / size) as u8,
            ((x * 31 + y * 17) % 256) as u8,
        ])
    });
    PixelBuffer::from_rgb_image(image)
}

fn report_stats(stats: &CacheStats, json: bool) {
    if json {
        match serde_json::to_string_pretty(stats) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to serialize statistics: {}", e),
        }
        return;
    }

    info!("Cache statistics:");
    info!(
        "  Hits: {}, misses: {} (hit rate {:.1}%)",
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0
    );
    info!(
        "  Memory: {} tile(s), {} / {} bytes",
        stats.tile_count, stats.usage, stats.capacity
    );
    info!(
        "  Disk: {} written, {} read, {} resident",
        stats.disk_written, stats.disk_read, stats.disk_resident
    );
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tilecache=debug"
    } else {
        "tilecache=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// =============================================================================
// Check Command
// =============================================================================

async fn run_check(config: CheckConfig) -> ExitCode {
    // Initialize minimal logging for check command
    if config.verbose {
        init_logging(true);
    }

    println!("tilecache Configuration Check");
    println!("═════════════════════════════");
    println!();

    if let Err(e) = config.cache.validate() {
        println!("✗ Configuration: {}", e);
        return ExitCode::FAILURE;
    }
    print_settings(&config.cache);

    let Some(ref dir) = config.cache.disk_dir else {
        println!();
        println!("═════════════════════════════");
        println!("✓ All checks passed!");
        return ExitCode::SUCCESS;
    };

    println!();
    print!("Probing disk tier at {}... ", dir.display());

    match probe_disk_tier(dir).await {
        Ok(()) => println!("✓ success"),
        Err(e) => {
            println!("✗ failed");
            println!();
            println!("Error: {}", e);
            println!();
            println!("Please check:");
            println!("  - The directory exists or can be created");
            println!("  - The current user can write to it");
            return ExitCode::FAILURE;
        }
    }

    println!();
    println!("═════════════════════════════");
    println!("✓ All checks passed!");

    ExitCode::SUCCESS
}

fn print_settings(args: &CacheArgs) {
    match parse_size(&args.memory_capacity) {
        Ok(0) => println!("✓ Memory capacity: 0 (caching disabled)"),
        Ok(bytes) => println!("✓ Memory capacity: {} ({} bytes)", args.memory_capacity, bytes),
        Err(e) => println!("✗ Memory capacity: {}", e),
    }
    println!("✓ Eviction threshold: {}", args.eviction_threshold);
    println!(
        "✓ Workers: {} primary, {} prefetch",
        args.worker_count(),
        args.prefetch_workers
    );
    println!("✓ Batch size: {}", args.batch_size);
}

/// Write, read back and delete one entry.
async fn probe_disk_tier(dir: &std::path::Path) -> Result<(), String> {
    let tier = FileOverflow::open(dir).await.map_err(|e| e.to_string())?;

    let probe = ImageHandle::new(|x: u32, y: u32| Ok(gradient_tile(0, x, y, 1)));
    let key = TileKey::new(probe.id(), 0, 0);
    let data = Bytes::from_static(b"tilecache probe");

    tier.write(&key, &data).await.map_err(|e| e.to_string())?;
    let read = tier.read(&key).await.map_err(|e| e.to_string())?;
    tier.remove(&key).await.map_err(|e| e.to_string())?;

    match read {
        Some(bytes) if bytes == data => Ok(()),
        Some(_) => Err("read back different bytes than written".to_string()),
        None => Err("entry vanished after write".to_string()),
    }
}
