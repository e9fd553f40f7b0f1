//! Pixel Cache CLI
//!
//! Exercises the cache from the command line.
//!
//! ```text
//! pixel-cache probe   --columns 2048 --rows 2048 --memory-limit 8
//! pixel-cache persist --columns 640 --rows 480 --output /tmp/cache.px
//! pixel-cache verify  --columns 640 --rows 480 --input /tmp/cache.px
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pixel_cache::{
    CacheConfig, Image, MetricsSnapshot, PixelPacket, ResourceLimits, ResourceRegistry,
    StorageClass, VirtualPixelMethod, QUANTUM_RANGE,
};

const MEGABYTE: u64 = 1024 * 1024;
const GIGABYTE: u64 = 1024 * MEGABYTE;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Pixel Cache - tiered pixel storage probe
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    limits: LimitArgs,

    /// Directory for temporary cache files
    #[arg(long, env = "MAGICK_TMPDIR", global = true)]
    temporary_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(ClapArgs, Debug)]
struct LimitArgs {
    /// Largest in-memory store, in megabytes
    #[arg(long, env = "MAGICK_AREA_LIMIT", global = true)]
    area_limit: Option<u64>,

    /// Heap budget, in megabytes
    #[arg(long, env = "MAGICK_MEMORY_LIMIT", global = true)]
    memory_limit: Option<u64>,

    /// Memory-mapped budget, in megabytes
    #[arg(long, env = "MAGICK_MAP_LIMIT", global = true)]
    map_limit: Option<u64>,

    /// Disk budget, in gigabytes
    #[arg(long, env = "MAGICK_DISK_LIMIT", global = true)]
    disk_limit: Option<u64>,

    /// Temporary file handles
    #[arg(long, env = "MAGICK_FILES_LIMIT", global = true)]
    files_limit: Option<u64>,
}

#[derive(ClapArgs, Debug)]
struct GeometryArgs {
    /// Image width in pixels
    #[arg(long, default_value = "640")]
    columns: usize,

    /// Image height in pixels
    #[arg(long, default_value = "480")]
    rows: usize,

    /// Store palette indexes alongside the pixels
    #[arg(long)]
    pseudo: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Materialize an image, write a gradient, read it back, and report
    Probe {
        #[command(flatten)]
        geometry: GeometryArgs,

        /// Policy for reads outside the image
        #[arg(long, default_value = "edge")]
        virtual_pixel_method: VirtualPixelMethod,

        /// Worker threads writing disjoint row bands
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a gradient image to a persistent cache file
    Persist {
        #[command(flatten)]
        geometry: GeometryArgs,

        /// Cache file to write
        #[arg(long)]
        output: PathBuf,

        /// Byte offset within the file
        #[arg(long, default_value = "0")]
        offset: u64,
    },
    /// Attach to a persistent cache file and check the gradient
    Verify {
        #[command(flatten)]
        geometry: GeometryArgs,

        /// Cache file to read
        #[arg(long)]
        input: PathBuf,

        /// Byte offset within the file
        #[arg(long, default_value = "0")]
        offset: u64,
    },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let registry = ResourceRegistry::new(build_config(&args))
        .context("unable to initialize the resource registry")?;
    info!("Starting pixel cache {}", pixel_cache::version());
    info!("  Limits: {:?}", registry.config().limits);
    info!("  Temporary path: {}", registry.temporary_path().display());

    let result = match &args.command {
        Command::Probe {
            geometry,
            virtual_pixel_method,
            threads,
            json,
        } => probe(&registry, geometry, *virtual_pixel_method, *threads, *json),
        Command::Persist {
            geometry,
            output,
            offset,
        } => persist(&registry, geometry, output, *offset),
        Command::Verify {
            geometry,
            input,
            offset,
        } => verify(&registry, geometry, input, *offset),
    };

    registry.teardown();
    result
}

fn build_config(args: &Args) -> CacheConfig {
    let mut limits = ResourceLimits::from_system();
    let l = &args.limits;
    if let Some(v) = l.area_limit {
        limits.area = Some(v.saturating_mul(MEGABYTE));
    }
    if let Some(v) = l.memory_limit {
        limits.memory = Some(v.saturating_mul(MEGABYTE));
    }
    if let Some(v) = l.map_limit {
        limits.map = Some(v.saturating_mul(MEGABYTE));
    }
    if let Some(v) = l.disk_limit {
        limits.disk = Some(v.saturating_mul(GIGABYTE));
    }
    if let Some(v) = l.files_limit {
        limits.file = Some(v);
    }
    let mut config = CacheConfig {
        limits,
        ..CacheConfig::default()
    };
    if let Some(path) = &args.temporary_path {
        config.temporary_path = path.clone();
    }
    config
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Gradient
// =============================================================================

fn scale(value: usize, extent: usize) -> u16 {
    if extent <= 1 {
        return 0;
    }
    ((value as u64 * QUANTUM_RANGE as u64) / (extent as u64 - 1)) as u16
}

fn gradient(x: usize, y: usize, columns: usize, rows: usize) -> PixelPacket {
    PixelPacket::rgb(
        scale(x, columns),
        scale(y, rows),
        ((x + y) % (QUANTUM_RANGE as usize + 1)) as u16,
    )
}

fn gradient_index(x: usize, y: usize) -> u16 {
    ((x ^ y) & 0xff) as u16
}

fn make_image(registry: &Arc<ResourceRegistry>, geometry: &GeometryArgs) -> Image {
    let class = if geometry.pseudo {
        StorageClass::Pseudo
    } else {
        StorageClass::Direct
    };
    Image::new(registry, geometry.columns, geometry.rows)
        .with_filename(format!("gradient-{}x{}", geometry.columns, geometry.rows))
        .with_storage_class(class)
}

/// Write the gradient in row bands, one view per worker.
fn write_gradient(image: &Image, threads: usize) -> anyhow::Result<()> {
    let (columns, rows) = (image.columns(), image.rows());
    let threads = threads.clamp(1, rows.max(1));
    let band = rows.div_ceil(threads);

    thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                scope.spawn(move || -> pixel_cache::Result<()> {
                    let mut view = image.open_view()?;
                    for y in (t * band)..((t + 1) * band).min(rows) {
                        let pixels = view.set(0, y as i64, columns, 1)?;
                        for (x, pixel) in pixels.iter_mut().enumerate() {
                            *pixel = gradient(x, y, columns, rows);
                        }
                        if let Some(indexes) = view.indexes_mut() {
                            for (x, index) in indexes.iter_mut().enumerate() {
                                *index = gradient_index(x, y);
                            }
                        }
                        view.sync()?;
                    }
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            match worker.join() {
                Ok(result) => result?,
                Err(_) => bail!("gradient worker panicked"),
            }
        }
        Ok(())
    })
}

/// Count pixels (and indexes) that differ from the gradient.
fn count_mismatches(image: &mut Image) -> anyhow::Result<usize> {
    let (columns, rows) = (image.columns(), image.rows());
    let mut mismatches = 0;
    for y in 0..rows {
        let pixels = image.acquire_pixels(0, y as i64, columns, 1)?;
        mismatches += pixels
            .iter()
            .enumerate()
            .filter(|(x, p)| **p != gradient(*x, y, columns, rows))
            .count();
        if let Some(indexes) = image.indexes() {
            mismatches += indexes
                .iter()
                .enumerate()
                .filter(|(x, i)| **i != gradient_index(*x, y))
                .count();
        }
    }
    Ok(mismatches)
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Serialize)]
struct ProbeReport {
    columns: usize,
    rows: usize,
    storage_class: String,
    cache_type: String,
    length: u64,
    cache_filename: Option<PathBuf>,
    virtual_pixel_method: String,
    corner: Vec<PixelPacket>,
    mismatches: usize,
    metrics: MetricsSnapshot,
}

fn probe(
    registry: &Arc<ResourceRegistry>,
    geometry: &GeometryArgs,
    method: VirtualPixelMethod,
    threads: usize,
    json: bool,
) -> anyhow::Result<()> {
    let mut image = make_image(registry, geometry);
    image.open_cache().context("unable to open pixel cache")?;
    image.set_virtual_pixel_method(method);

    write_gradient(&image, threads)?;
    let mismatches = count_mismatches(&mut image)?;
    let corner = image.acquire_pixels(-1, -1, 2, 2)?.to_vec();

    let report = ProbeReport {
        columns: image.columns(),
        rows: image.rows(),
        storage_class: image.cache_storage_class().to_string(),
        cache_type: image.cache_type().to_string(),
        length: image.cache_length(),
        cache_filename: image.cache_filename(),
        virtual_pixel_method: image.virtual_pixel_method().to_string(),
        corner,
        mismatches,
        metrics: registry.metrics().snapshot(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("geometry:       {}x{} {}", report.columns, report.rows, report.storage_class);
        println!(
            "cache:          {} ({})",
            report.cache_type,
            pixel_cache::cache::format_size(report.length)
        );
        if let Some(path) = &report.cache_filename {
            println!("cache file:     {}", path.display());
        }
        println!("virtual pixels: {}", report.virtual_pixel_method);
        let corner: Vec<String> = report.corner.iter().map(|p| p.to_string()).collect();
        println!("corner:         {}", corner.join(" "));
        println!("mismatches:     {}", report.mismatches);
        println!("in-core ratio:  {:.2}", report.metrics.in_core_ratio);
    }

    if mismatches > 0 {
        bail!("{} pixels differ from the gradient", mismatches);
    }
    Ok(())
}

fn persist(
    registry: &Arc<ResourceRegistry>,
    geometry: &GeometryArgs,
    output: &Path,
    offset: u64,
) -> anyhow::Result<()> {
    let mut image = make_image(registry, geometry);
    write_gradient(&image, 1)?;
    let mut next = offset;
    image
        .persist(output, &mut next)
        .with_context(|| format!("unable to persist to {}", output.display()))?;
    info!(
        "persisted {}x{} at offset {} of {}",
        geometry.columns,
        geometry.rows,
        offset,
        output.display()
    );
    println!("{}", next);
    Ok(())
}

fn verify(
    registry: &Arc<ResourceRegistry>,
    geometry: &GeometryArgs,
    input: &Path,
    offset: u64,
) -> anyhow::Result<()> {
    let mut image = make_image(registry, geometry);
    let mut next = offset;
    image
        .attach_persistent_store(input, &mut next)
        .with_context(|| format!("unable to attach {}", input.display()))?;
    let mismatches = count_mismatches(&mut image)?;
    if mismatches > 0 {
        warn!("{} pixels differ in {}", mismatches, input.display());
        bail!("{} pixels differ from the gradient", mismatches);
    }
    println!("ok {}", next);
    Ok(())
}
