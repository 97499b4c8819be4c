//! # vtex CLI
//!
//! Command-line interface for the vtex texture streaming system.
//!
//! ## Commands
//! - `simulate` - Drive the streaming engine on a headless device and print statistics
//! - `generate` - Write a synthetic texture asset
//! - `inspect` - Print the header, levels and tile grid of a texture asset

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glam::{UVec2, Vec3};
use vtex_assets::{
    AssetStore, FileAssetStore, MemoryAssetStore, TextureAssetHeader, TextureFormat,
    build_synthetic_texture, full_mip_count,
};
use vtex_core::{GpuTileId, LinearUploadHeap, StreamingConfig, TextureId, TileId};
use vtex_platform::{FileHandle, FileMode};
use vtex_renderer::{
    Camera, FeedbackDraw, HeadlessDevice, ResourceStates, StreamingStats, TextureInfo,
    TextureStreamingEngine,
};

/// vtex texture streaming CLI
#[derive(Parser)]
#[command(name = "vtex")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream synthetic textures on a headless device
    Simulate {
        /// Frames to run
        #[arg(short, long, default_value = "240")]
        frames: u32,

        /// Number of textures
        #[arg(short, long, default_value = "4")]
        textures: u32,

        /// Tile cache size in MiB
        #[arg(long, default_value = "16")]
        cache_mib: u64,

        /// JSON streaming configuration, overrides the cache size
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print statistics as JSON
        #[arg(long)]
        json: bool,

        /// Let updates overlap following frames instead of waiting for each one
        #[arg(long)]
        no_wait: bool,
    },

    /// Write a synthetic texture asset
    Generate {
        /// Output file
        output: PathBuf,

        /// Width and height in texels
        #[arg(short, long, default_value = "2048")]
        size: u32,

        /// Block-compressed format
        #[arg(short, long, default_value = "bc7")]
        format: TextureFormat,
    },

    /// Print the layout of a texture asset
    Inspect {
        /// Asset file
        file: PathBuf,
    },
}

/// Parameters of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Frames to run
    pub frames: u32,
    /// Number of textures
    pub textures: u32,
    /// Edge length of every texture
    pub texture_size: u32,
    /// Streaming configuration
    pub config: StreamingConfig,
    /// Wait for each update before the next frame
    pub wait_for_updates: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            frames: 240,
            textures: 4,
            texture_size: 2048,
            config: StreamingConfig::default(),
            wait_for_updates: true,
        }
    }
}

/// Tiles a slowly moving view samples from one texture in one frame
fn view_samples(texture: TextureId, info: &TextureInfo, frame: u32, seed: u32) -> Vec<GpuTileId> {
    let layout = info.layout();
    let tiled_levels = layout.packed_info().starting_level.min(info.mip_count).max(1);
    let mip = (frame / 32 + seed) % tiled_levels;
    let grid = layout.tile_grid(mip);
    if grid.x == 0 || grid.y == 0 {
        return vec![GpuTileId::new(texture, layout.packed_tile())];
    }

    let cx = (frame / 4 + seed * 3) % grid.x;
    let cy = (frame / 8 + seed) % grid.y;
    let mut samples = Vec::with_capacity(4);
    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
        let x = (cx + dx).min(grid.x - 1);
        let y = (cy + dy).min(grid.y - 1);
        samples.push(GpuTileId::new(texture, TileId::new(x, y, mip)));
    }
    samples
}

/// Run the streaming engine over synthetic content and return its statistics
pub fn run_simulation(options: &SimulationOptions) -> Result<StreamingStats> {
    let device = Arc::new(HeadlessDevice::new());
    let store = Arc::new(MemoryAssetStore::new());
    let engine = TextureStreamingEngine::new(device.clone(), store.clone(), options.config.clone())
        .context("failed to create streaming engine")?;

    let wh = UVec2::splat(options.texture_size);
    let mip_count = full_mip_count(wh);
    let mut textures = Vec::new();
    for index in 0..options.textures {
        let format = if index % 2 == 0 {
            TextureFormat::Bc7
        } else {
            TextureFormat::Bc1
        };
        let info = TextureInfo { wh, mip_count, format };
        let texture = device.create_texture(info);
        let asset = store.insert(build_synthetic_texture(format, wh, mip_count)?);
        engine.bind_asset(asset, texture);
        engine
            .load_lowest_level(texture)
            .with_context(|| format!("failed to load packed tail of {texture}"))?;
        textures.push((texture, info));
    }

    let mut constants = LinearUploadHeap::new(256 * 1024);
    let mut vertices = LinearUploadHeap::new(1024 * 1024);
    let draws: Vec<_> = textures
        .iter()
        .enumerate()
        .map(|(i, (texture, _))| {
            let draw = FeedbackDraw::new(i as u32, [*texture]);
            if i % 3 == 2 { draw.with_skinning(16 * 1024) } else { draw }
        })
        .collect();

    for frame in 0..options.frames {
        let angle = frame as f32 * 0.01;
        let camera = Camera::look_at(
            Vec3::new(angle.cos() * 10.0, 2.0, angle.sin() * 10.0),
            Vec3::ZERO,
            60f32.to_radians(),
            16.0 / 9.0,
        );

        let mut samples = Vec::new();
        for (seed, (texture, info)) in textures.iter().enumerate() {
            // Streamed textures are sampled by the frame before the next copy
            device.set_resource_state(*texture, ResourceStates::PIXEL_SHADER_RESOURCE);
            samples.extend(view_samples(*texture, info, frame, seed as u32));
        }
        device.stage_samples(&samples);

        constants.reset();
        vertices.reset();
        engine.texture_feedback_pass(&camera, UVec2::new(1920, 1080), &draws, &mut constants, &mut vertices)?;
        device.process_readbacks();

        if options.wait_for_updates {
            engine.wait_idle();
        }
    }

    engine.wait_idle();
    device.process_readbacks();
    engine.wait_idle();
    Ok(engine.stats())
}

fn load_config(path: &Path) -> Result<StreamingConfig> {
    let file = FileHandle::open(path, FileMode::Read)?;
    let bytes = file.read_all()?;
    let config: StreamingConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn print_stats(stats: &StreamingStats) {
    println!("Feedback passes:      {} ({} skipped)", stats.feedback_passes, stats.feedback_passes_skipped);
    println!("Updates:              {} completed, {} aborted", stats.updates_completed, stats.updates_aborted);
    println!("Tiles requested:      {} ({} after expansion)", stats.tiles_requested, stats.expanded_requests);
    println!("Allocations:          {} tiles, {} packed", stats.allocations, stats.packed_allocations);
    println!("Reallocations:        {}", stats.reallocations);
    println!("Tiles copied:         {}", stats.tiles_copied);
    println!("Skipped (unbound):    {}", stats.skipped_unbound);
    println!(
        "Blocks:               {} free, {} stale, {} in use",
        stats.free_blocks, stats.stale_blocks, stats.in_use_blocks
    );
    println!(
        "Update time:          {:.3} ms last, {:.3} ms average",
        stats.last_update_ms, stats.average_update_ms
    );
    println!("GPU feedback time:    {:.3} ms", stats.last_gpu_feedback_ms);
}

fn generate(output: &Path, size: u32, format: TextureFormat) -> Result<()> {
    let wh = UVec2::splat(size);
    let mip_count = full_mip_count(wh);
    let bytes = build_synthetic_texture(format, wh, mip_count)?;

    let mut file = FileHandle::open(output, FileMode::Write)?;
    file.write_all(&bytes)?;
    file.flush()?;
    log::info!(
        "Wrote {} {size}x{size} texture with {mip_count} levels to {} ({} bytes)",
        format,
        output.display(),
        bytes.len()
    );
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let store = FileAssetStore::new();
    let asset = store.mount(path)?;
    let (header, data_offset) = TextureAssetHeader::read(&store, asset)?;
    let layout = header.layout();
    let packed = layout.packed_info();

    println!("Asset:       {asset}");
    println!("Format:      {}", header.format);
    println!("Size:        {}x{}", header.width, header.height);
    println!("Levels:      {}", header.mip_count());
    println!("Data offset: {data_offset}");
    println!("File size:   {} bytes", store.size(asset)?);
    println!(
        "Packed tail: levels {}..{}",
        packed.starting_level, packed.ending_level
    );
    println!();
    println!("{:>5} {:>11} {:>10} {:>10}", "level", "size", "bytes", "tiles");
    for level in 0..header.mip_count() {
        let wh = header.level_wh(level);
        let tiles = if layout.is_tiled_level(level) {
            let grid = layout.tile_grid(level);
            format!("{}x{}", grid.x, grid.y)
        } else {
            "packed".to_string()
        };
        println!(
            "{:>5} {:>11} {:>10} {:>10}",
            level,
            format!("{}x{}", wh.x, wh.y),
            header.level_size(level)?,
            tiles
        );
    }
    Ok(())
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cli.command {
        Commands::Simulate {
            frames,
            textures,
            cache_mib,
            config,
            json,
            no_wait,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => StreamingConfig {
                    cache_size_bytes: cache_mib * 1024 * 1024,
                    ..Default::default()
                },
            };
            let options = SimulationOptions {
                frames,
                textures,
                config,
                wait_for_updates: !no_wait,
                ..Default::default()
            };

            log::info!("Simulating {frames} frames over {textures} textures...");
            let stats = run_simulation(&options)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&stats);
            }
        }

        Commands::Generate { output, size, format } => generate(&output, size, format)?,

        Commands::Inspect { file } => inspect(&file)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::parse_from(["vtex", "simulate"]);
        assert!(matches!(cli.command, Commands::Simulate { frames: 240, .. }));
    }

    #[test]
    fn test_generate_command() {
        let cli = Cli::parse_from(["vtex", "generate", "out.vtx", "-s", "1024", "-f", "BC1"]);
        if let Commands::Generate { output, size, format } = cli.command {
            assert_eq!(output, PathBuf::from("out.vtx"));
            assert_eq!(size, 1024);
            assert_eq!(format, TextureFormat::Bc1);
        } else {
            panic!("Expected Generate command");
        }
    }

    #[test]
    fn test_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["vtex", "generate", "out.vtx", "-f", "dxt9"]).is_err());
    }

    #[test]
    fn test_view_samples_stay_in_grid() {
        let info = TextureInfo {
            wh: UVec2::splat(1024),
            mip_count: 11,
            format: TextureFormat::Bc7,
        };
        let layout = info.layout();
        for frame in 0..200 {
            for sample in view_samples(TextureId(0), &info, frame, 1) {
                assert!(layout.contains(sample.tile), "{:?}", sample.tile);
            }
        }
    }

    #[test]
    fn test_simulation_streams_tiles() {
        let options = SimulationOptions {
            frames: 24,
            textures: 2,
            texture_size: 1024,
            config: StreamingConfig {
                cache_size_bytes: 32 * 64 * 1024,
                worker_threads: 1,
                ..Default::default()
            },
            wait_for_updates: true,
        };

        let stats = run_simulation(&options).unwrap();
        assert_eq!(stats.feedback_passes, 24);
        assert_eq!(stats.updates_completed, 24);
        assert_eq!(stats.updates_aborted, 0);
        assert!(stats.tiles_copied > 0);
        assert_eq!(stats.free_blocks + stats.stale_blocks + stats.in_use_blocks, 32);
    }

    #[test]
    fn test_generate_and_inspect() {
        let path = std::env::temp_dir().join(format!("vtex-cli-{}.vtx", std::process::id()));
        generate(&path, 512, TextureFormat::Bc7).unwrap();
        inspect(&path).unwrap();

        let store = FileAssetStore::new();
        let asset = store.mount(&path).unwrap();
        let (header, _) = TextureAssetHeader::read(&store, asset).unwrap();
        assert_eq!(header.mip_count(), 10);
        std::fs::remove_file(&path).unwrap();
    }
}
