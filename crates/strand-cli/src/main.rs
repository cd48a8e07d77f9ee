use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use strand_core::config::{default_config_path, BackendKind};
use strand_core::{FenceStatus, StrandConfig};
use strand_driver::Engine;
use strand_protocol::{
    Attachment, BufferDescriptor, BufferUsage, RenderPassParams, RenderTargetDescriptor,
    SwapChainDescriptor, TargetBufferFlags, TextureDescriptor, TextureFormat, TextureUsage,
};
use tracing::{info, warn};

const FORMATS: [TextureFormat; 10] = [
    TextureFormat::R8,
    TextureFormat::Rg8,
    TextureFormat::Rgba8,
    TextureFormat::Srgb8A8,
    TextureFormat::Bgra8,
    TextureFormat::R32F,
    TextureFormat::Rgba16F,
    TextureFormat::Rgba32F,
    TextureFormat::Depth24,
    TextureFormat::Depth32F,
];

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Strand - GPU command execution engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a backend and print what it supports
    Info {
        /// Backend to start (overrides the configuration file)
        #[arg(short, long)]
        backend: Option<BackendArg>,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Render and present frames to an offscreen swap chain
    Smoke {
        /// Number of frames to present
        #[arg(short, long, default_value_t = 60)]
        frames: u32,

        /// Frame size in pixels
        #[arg(long, default_value_t = 256)]
        size: u32,

        /// Backend to start (overrides the configuration file)
        #[arg(short, long)]
        backend: Option<BackendArg>,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Validate a configuration file and print the effective settings
    Config {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Headless,
    Vulkan,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Headless => BackendKind::Headless,
            BackendArg::Vulkan => BackendKind::Vulkan,
        }
    }
}

fn main() -> anyhow::Result<()> {
    strand_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { backend, config } => {
            let config = load_config(config, backend)?;
            let mut engine = Engine::new(&config)?;
            let capabilities = engine.get_capabilities();

            println!("Backend:  {}", capabilities.backend);
            println!("Device:   {}", capabilities.device_name);
            println!("Color samples:    {:?}", capabilities.color_sample_counts);
            println!("Depth samples:    {:?}", capabilities.depth_sample_counts);
            println!("Storage buffers:  {}", capabilities.storage_buffers);
            println!("Color attachments: {}", capabilities.max_color_attachments);
            println!("Uniform alignment: {}", capabilities.uniform_offset_alignment);
            println!();
            println!("Formats:");
            for format in FORMATS {
                let usage = if format.is_depth() {
                    TextureUsage::DEPTH_ATTACHMENT
                } else {
                    TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLEABLE
                };
                let supported = engine.is_texture_format_supported(format, usage);
                println!("  {:<10} {}", format!("{:?}", format), if supported { "yes" } else { "no" });
            }
        }

        Commands::Smoke {
            frames,
            size,
            backend,
            config,
        } => {
            let config = load_config(config, backend)?;
            let mut engine = Engine::new(&config)?;
            info!(
                "smoke test: {} frames at {}x{} on {}",
                frames,
                size,
                size,
                engine.capabilities().backend
            );
            smoke(&mut engine, frames, size)?;
        }

        Commands::Config { config } => {
            let path = config.unwrap_or_else(default_config_path);
            let config = match StrandConfig::load(&path) {
                Ok(config) => config,
                Err(strand_core::CoreError::Io(_)) => {
                    println!("{} not found, showing defaults", path);
                    StrandConfig::default()
                }
                Err(e) => anyhow::bail!("{}: {}", path, e),
            };
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<String>, backend: Option<BackendArg>) -> anyhow::Result<StrandConfig> {
    let mut config = match path {
        Some(path) => StrandConfig::load(&path).map_err(|e| anyhow::anyhow!("{}: {}", path, e))?,
        None => StrandConfig::load_or_default(&default_config_path()),
    };
    if let Some(backend) = backend {
        config.backend.kind = backend.into();
    }
    Ok(config)
}

/// Offscreen pass into a sampleable texture followed by a presented
/// swap-chain pass, once per frame.
fn smoke(engine: &mut Engine, frames: u32, size: u32) -> anyhow::Result<()> {
    let swap_chain = engine.create_swap_chain(SwapChainDescriptor {
        width: size,
        height: size,
        format: TextureFormat::Bgra8,
        image_count: 3,
    });
    let screen = engine.create_swap_chain_render_target(swap_chain);

    let texture = engine.create_texture(TextureDescriptor::new_2d(
        TextureFormat::Rgba8,
        size,
        size,
        TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLEABLE,
    ));
    let offscreen = engine.create_render_target(RenderTargetDescriptor {
        width: size,
        height: size,
        color: vec![Attachment::new(texture)],
        depth: None,
        samples: 4,
        layer_count: 1,
    });
    let uniforms = engine.create_buffer(BufferDescriptor {
        size: 64,
        usage: BufferUsage::UNIFORM,
    });

    let started = Instant::now();
    for frame in 0..frames {
        let t = frame as f32 / frames.max(1) as f32;
        engine.update_buffer_pod(uniforms, 0, &[t, 1.0 - t, 0.5, 1.0]);

        engine.begin_render_pass(
            offscreen,
            RenderPassParams {
                clear: TargetBufferFlags::COLOR0,
                clear_color: [t, 0.2, 1.0 - t, 1.0],
                ..RenderPassParams::default()
            },
        );
        engine.end_render_pass();

        engine.begin_frame(swap_chain);
        engine.begin_render_pass(
            screen,
            RenderPassParams {
                clear: TargetBufferFlags::COLOR0,
                clear_color: [0.0, t, 0.0, 1.0],
                ..RenderPassParams::default()
            },
        );
        engine.end_render_pass();
        engine.end_frame(swap_chain);
        engine.flush();
    }

    let status = engine.flush_and_wait(Some(Duration::from_secs(10)));
    engine.check_device()?;
    if status != FenceStatus::ConditionSatisfied {
        anyhow::bail!("frames did not complete: {:?}", status);
    }
    let elapsed = started.elapsed();

    let stats = engine.get_stats();
    if stats.frames_skipped > 0 {
        warn!("{} frames skipped", stats.frames_skipped);
    }
    println!(
        "{} frames in {:.1} ms ({:.1} fps)",
        stats.frames_presented,
        elapsed.as_secs_f64() * 1000.0,
        stats.frames_presented as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("  command buffers:  {}", stats.buffers_executed);
    println!("  commands:         {}", stats.commands_executed);
    println!("  render passes:    {}", stats.render_passes);
    println!("  transitions:      {}", stats.layout_transitions);
    println!(
        "  cached:           {} passes, {} framebuffers",
        stats.cached_render_passes, stats.cached_framebuffers
    );

    engine.destroy_render_target(offscreen);
    engine.destroy_texture(texture);
    engine.destroy_buffer(uniforms);
    engine.destroy_render_target(screen);
    engine.destroy_swap_chain(swap_chain);
    engine.flush_and_wait(Some(Duration::from_secs(10)));
    Ok(())
}
