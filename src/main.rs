// =============================================================================
// MIP RENDERER - textured, mip-mapped, multisampled model on raw Vulkan
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Window (winit, pumped between frames)                          │
// │    └── FrameOrchestrator (fence/acquire/record/submit/present)  │
// │          └── Renderer (FrameBackend over Vulkan)                │
// │                └── SurfaceManager, pipeline, buffers, texture   │
// │                      └── VulkanDevice                           │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the slot's fence
// 2. Acquire a swapchain image (rebuild and skip if out of date)
// 3. Update the slot's uniforms, reset its fence
// 4. Record and submit the slot's command buffer
// 5. Present, rebuild if the surface changed
//
// =============================================================================

mod assets;
mod backend;
mod config;
mod error;
mod frame;
mod renderer;
mod window;

use anyhow::{Context, Result};
use backend::swapchain::{wait_for_drawable_extent, ExtentSource};
use backend::VulkanDevice;
use config::Config;
use frame::{FrameOrchestrator, FrameOutcome};
use renderer::Renderer;
use std::fs::File;
use std::io::Write;
use std::time::{Duration, Instant};
use window::Window;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let (config, load_error) = Config::load();
    init_logging(&config)?;
    log::info!("Starting mip renderer");
    if let Some(e) = load_error {
        log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
    }
    log::info!("Present mode: {}", config.graphics.present_mode);

    if let Err(e) = run(&config) {
        log::error!("Fatal: {:#}", e);
        return Err(e);
    }

    log::info!("Clean shutdown");
    Ok(())
}

/// Log to stderr, or to a fresh log file when `debug.log_to_file` is set.
/// `RUST_LOG` overrides the default Info filter.
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    if config.debug.log_to_file {
        let mut file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {}", config.debug.log_file))?;
        writeln!(file, "=== Mip Renderer Log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn run(config: &Config) -> Result<()> {
    config.validate()?;

    let mut window = Window::new(&config.window)?;
    let device = VulkanDevice::new(window.handle()?, config)?;

    // Starting minimized: nothing to build a swapchain for yet
    let Some(extent) = wait_for_drawable_extent(&mut window) else {
        return Ok(());
    };
    let mut renderer = Renderer::new(device, config, extent)?;

    let mut frames = FrameOrchestrator::new(&renderer);
    let resize = frames.resize_flag();
    window.on_resize(move |_| resize.raise());

    let mut fps = FpsCounter::new(Instant::now());

    while !window.should_close() {
        window.poll_events();
        if window.should_close() {
            break;
        }

        let outcome = frames.draw_frame(&mut renderer, &mut window)?;
        if let FrameOutcome::Presented { .. } = outcome {
            if config.debug.show_fps {
                if let Some(stats) = fps.frame(Instant::now()) {
                    window.set_title(&format!(
                        "{} - {:.0} FPS ({:.2}ms)",
                        config.window.title, stats.fps, stats.frame_ms
                    ));
                }
            }
        }
    }

    frames.shutdown(&mut renderer)?;
    Ok(())
}

// =============================================================================
// FPS TRACKING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct FpsStats {
    fps: f32,
    frame_ms: f32,
}

/// Averages frame rate over windows of at least one second
struct FpsCounter {
    last_frame: Instant,
    last_report: Instant,
    frames: u32,
}

impl FpsCounter {
    const REPORT_INTERVAL: Duration = Duration::from_secs(1);

    fn new(now: Instant) -> Self {
        Self {
            last_frame: now,
            last_report: now,
            frames: 0,
        }
    }

    /// Count a presented frame. Returns stats once per report interval.
    fn frame(&mut self, now: Instant) -> Option<FpsStats> {
        let frame_time = now.duration_since(self.last_frame);
        self.last_frame = now;
        self.frames += 1;

        let elapsed = now.duration_since(self.last_report);
        if elapsed < Self::REPORT_INTERVAL {
            return None;
        }

        let stats = FpsStats {
            fps: self.frames as f32 / elapsed.as_secs_f32(),
            frame_ms: frame_time.as_secs_f32() * 1000.0,
        };
        self.frames = 0;
        self.last_report = now;
        Some(stats)
    }
}
