//! # Shadowcommit simulation driver
//!
//! Runs every configured pipeline against the simulated display controller
//! with one producer per output submitting jittered frames, then prints the
//! per-pipeline counters.
//!
//! - `--frames` frames are submitted per pipeline
//! - `--pipelines` restricts which outputs get a producer
//! - `--blank-every` cycles the outputs through `Off` and back

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shadowcommit::buffer::BufferHandle;
use shadowcommit::config::{DisplayConfig, PipelineConfig, PipelineKind};
use shadowcommit::frame::{BufferWindow, FrameDesc, PixelFormat, Rect, WindowConfig, WritebackTarget};
use shadowcommit::hw::sim::SimRig;
use shadowcommit::{logging, FenceWait, MultiOutputManager, Pipeline, PowerState};

#[derive(Parser)]
#[command(name = "shadowcommit")]
#[command(about = "Drive the shadow-register commit pipeline against a simulated controller")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/shadowcommit/display.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Frames submitted per pipeline
    #[arg(short, long, default_value_t = 240)]
    frames: u32,

    /// Only drive these pipeline ids (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    pipelines: Vec<u32>,

    /// Blank and unblank every N frames (0 = never)
    #[arg(long, default_value_t = 0)]
    blank_every: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = DisplayConfig::load(&cli.config);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => DisplayConfig::default(),
    };
    logging::init(&config.logging, cli.debug)?;

    info!("🚀 Starting shadowcommit {}", env!("CARGO_PKG_VERSION"));
    info!("📄 Built {}", env!("BUILD_DATE"));
    match loaded {
        Ok(_) => info!("✅ Configuration loaded from: {}", cli.config),
        Err(e) => {
            error!("❌ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
        }
    }
    config.validate()?;

    let rig = Arc::new(SimRig::new());
    let deps = rig.collaborators(&config);
    deps.recovery
        .lock()
        .init()
        .context("Failed to initialize recovery manager")?;
    let outputs = Arc::new(MultiOutputManager::new(&config, deps)?);

    let selected: Vec<PipelineConfig> = config
        .pipelines
        .iter()
        .filter(|p| cli.pipelines.is_empty() || cli.pipelines.contains(&p.id))
        .cloned()
        .collect();
    if selected.is_empty() {
        warn!("No pipeline selected, nothing to do");
        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut producers = Vec::new();
    for pipeline_config in selected {
        let outputs = Arc::clone(&outputs);
        let rig = Arc::clone(&rig);
        let stop = Arc::clone(&stop);
        let channels: Vec<u32> = config.channels.iter().map(|c| c.id).collect();
        let frames = cli.frames;
        let blank_every = cli.blank_every;
        producers.push(tokio::task::spawn_blocking(move || -> Result<()> {
            let pipeline = outputs.get(pipeline_config.id)?;
            produce(pipeline, &pipeline_config, &rig, &channels, frames, blank_every, &stop)
        }));
    }

    let all = join_producers(producers);
    tokio::select! {
        result = all => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Interrupted, draining pipelines");
            stop.store(true, Ordering::Relaxed);
        }
    }

    for (id, result) in outputs.recover_fatal() {
        match result {
            Ok(()) => info!("pipeline {} re-initialized", id),
            Err(e) => error!("pipeline {} could not be re-initialized: {}", id, e),
        }
    }
    for (id, stats) in outputs.stats() {
        info!(
            "📊 pipeline {}: {} committed, {} no-op, {} aborted, {} demoted windows, {} conflicts, {} synthesized",
            id,
            stats.committed,
            stats.noop,
            stats.aborted,
            stats.demoted_windows,
            stats.conflicts,
            stats.synthesized
        );
    }
    let recovery = outputs.collaborators().recovery.lock().stats();
    info!(
        "💾 {} diagnostic dumps, {} re-inits, {} buffers still mapped",
        recovery.total_dumps,
        recovery.reinits,
        rig.buffers.live_mappings()
    );

    outputs.shutdown_all();
    info!("👋 shadowcommit shutting down");
    Ok(())
}

async fn join_producers(handles: Vec<tokio::task::JoinHandle<Result<()>>>) -> Result<()> {
    for handle in handles {
        handle.await.context("producer task panicked")??;
    }
    Ok(())
}

fn produce(
    pipeline: &Pipeline,
    config: &PipelineConfig,
    rig: &SimRig,
    channels: &[u32],
    frames: u32,
    blank_every: u32,
    stop: &AtomicBool,
) -> Result<()> {
    let mut rng = rand::thread_rng();
    let mut pending = Vec::new();

    for frame in 0..frames {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if blank_every > 0 && frame > 0 && frame % blank_every == 0 {
            pipeline.set_power(PowerState::Off)?;
            std::thread::sleep(Duration::from_millis(rng.gen_range(5..20)));
            pipeline.set_power(PowerState::On)?;
        }

        let desc = random_frame(&mut rng, config, rig, channels);
        match pipeline.submit(desc) {
            Ok(fences) => pending.push(fences.retire),
            Err(e) if e.is_fatal() => {
                warn!("pipeline {} is wedged, re-initializing", config.id);
                pipeline.reinit()?;
            }
            Err(e) => warn!("pipeline {} rejected frame {}: {}", config.id, frame, e),
        }
        if frame % 30 == 15 {
            let x = rng.gen_range(0..config.width.saturating_sub(32).max(1)) as i32;
            let y = rng.gen_range(0..config.height.saturating_sub(32).max(1)) as i32;
            if let Err(e) = pipeline.update_cursor_position(x, y) {
                debug!("pipeline {} cursor move skipped: {}", config.id, e);
            }
        }

        // keep a bounded number of frames in flight
        if pending.len() > 3 {
            let oldest = pending.remove(0);
            if let FenceWait::Ready(Err(e)) = oldest.wait(Duration::from_secs(1)) {
                warn!("pipeline {} frame retired with error: {}", config.id, e);
            }
        }
        std::thread::sleep(Duration::from_millis(rng.gen_range(2..12)));
    }

    pipeline.flush()?;
    Ok(())
}

fn allocate(rig: &SimRig, w: u32, h: u32) -> BufferHandle {
    rig.buffers.allocate(w as u64 * h as u64 * 4)
}

fn random_frame(rng: &mut impl Rng, config: &PipelineConfig, rig: &SimRig, channels: &[u32]) -> FrameDesc {
    let mut pool = channels.to_vec();
    pool.shuffle(rng);

    let mut windows = vec![WindowConfig::Color {
        color: 0xff00_0000 | rng.gen_range(0..0x00ff_ffff),
        dst: Rect::new(0, 0, config.width, config.height),
    }];
    let layers = rng.gen_range(1..config.window_count.max(2));
    for (layer, channel) in pool.into_iter().take(layers).enumerate() {
        let w = rng.gen_range(32..=config.width.min(512).max(32));
        let h = rng.gen_range(32..=config.height.min(512).max(32));
        let x = rng.gen_range(0..=(config.width - w)) as i32;
        let y = rng.gen_range(0..=(config.height - h)) as i32;
        let window = BufferWindow::simple(channel, Rect::new(x, y, w, h), allocate(rig, w, h));
        // the top layer doubles as the cursor
        if layer == 0 && config.kind == PipelineKind::Display {
            windows.push(WindowConfig::Cursor(window));
        } else {
            windows.push(WindowConfig::Buffer(window));
        }
    }
    windows.truncate(config.window_count);

    let mut desc = FrameDesc::new(windows);
    if config.kind == PipelineKind::Writeback {
        desc = desc.with_writeback(WritebackTarget {
            rect: Rect::new(0, 0, config.width, config.height),
            format: PixelFormat::Argb8888,
            handle: allocate(rig, config.width, config.height),
        });
    }
    if rng.gen_bool(0.5) {
        let w = config.width / 2;
        let h = config.height / 2;
        desc = desc.with_update_region(Rect::new(0, 0, w.max(1), h.max(1)));
    }
    desc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["shadowcommit"]).unwrap();
        assert!(!cli.debug);
        assert_eq!(cli.frames, 240);
        assert!(cli.pipelines.is_empty());
    }

    #[test]
    fn test_cli_flags() {
        let cli =
            Cli::try_parse_from(["shadowcommit", "--debug", "--frames", "10", "--pipelines", "0,2"]).unwrap();
        assert!(cli.debug);
        assert_eq!(cli.frames, 10);
        assert_eq!(cli.pipelines, vec![0, 2]);
    }

    #[test]
    fn test_random_frame_fits_pipeline() {
        let rig = SimRig::new();
        let config = DisplayConfig::default();
        let channels: Vec<u32> = config.channels.iter().map(|c| c.id).collect();
        let mut rng = rand::thread_rng();
        for pipeline in &config.pipelines {
            for _ in 0..20 {
                let desc = random_frame(&mut rng, pipeline, &rig, &channels);
                assert!(desc.windows.len() <= pipeline.window_count);
                assert_eq!(desc.writeback.is_some(), pipeline.kind == PipelineKind::Writeback);
            }
        }
    }
}
