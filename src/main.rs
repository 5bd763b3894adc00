use anyhow::Context;
use clap::{Parser, ValueEnum};
use dmabuf_player_lib::config::{PipelineConfig, PlayerConfig};
use dmabuf_player_lib::decoder::mailbox::Backpressure;
use dmabuf_player_lib::decoder::{DecoderConfig, HwDeviceKind};
use dmabuf_player_lib::pipeline::PipelineError;
use dmabuf_player_lib::renderer::WindowConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Device {
    /// Kernel DRM device (V4L2 mem2mem decoders)
    Drm,
    /// VAAPI (Intel/AMD)
    Vaapi,
}

impl From<Device> for HwDeviceKind {
    fn from(device: Device) -> Self {
        match device {
            Device::Drm => HwDeviceKind::Drm,
            Device::Vaapi => HwDeviceKind::Vaapi,
        }
    }
}

/// Play a video with hardware decoding and zero-copy display
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Input media file
    input: PathBuf,

    /// Hardware device type
    #[arg(long, value_enum, default_value_t = Device::Drm)]
    device: Device,

    /// Force a specific FFmpeg decoder (e.g. hevc_v4l2m2m)
    #[arg(long)]
    decoder: Option<String>,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Decode on a separate thread
    #[arg(long)]
    threaded: bool,

    /// With --threaded, drop frames instead of pacing the decoder
    #[arg(long)]
    drop_frames: bool,

    /// Most planes a frame may have (1-4)
    #[arg(long, default_value_t = 4)]
    max_planes: usize,

    /// Sleep between polls while no frame is ready
    #[arg(long, default_value_t = 3)]
    poll_interval_ms: u64,

    /// Give up after this many seconds without a frame (0 waits forever)
    #[arg(long, default_value_t = 10)]
    stall_timeout_secs: u64,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl From<&Args> for PlayerConfig {
    fn from(args: &Args) -> Self {
        PlayerConfig {
            decoder: DecoderConfig {
                input: args.input.clone(),
                device: args.device.into(),
                decoder_name: args.decoder.clone(),
                ..Default::default()
            },
            window: WindowConfig {
                width: args.width,
                height: args.height,
                ..Default::default()
            },
            pipeline: PipelineConfig {
                max_planes: args.max_planes,
                poll_interval: Duration::from_millis(args.poll_interval_ms),
                stall_timeout: (args.stall_timeout_secs > 0)
                    .then(|| Duration::from_secs(args.stall_timeout_secs)),
                ..Default::default()
            },
            threaded: args.threaded,
            backpressure: if args.drop_frames {
                Backpressure::DropNewest
            } else {
                Backpressure::Block
            },
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt().with_env_filter(env_filter).with_target(false).init();
}

fn play(args: &Args) -> anyhow::Result<()> {
    let config = PlayerConfig::from(args);
    let stats = dmabuf_player_lib::run(&config)
        .with_context(|| format!("Playback of {} failed", args.input.display()))?;
    log::info!(
        "Done: {} frames presented, {} skipped",
        stats.frames_presented,
        stats.frames_skipped
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match play(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            match e.downcast_ref::<PipelineError>() {
                Some(PipelineError::Usage(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
