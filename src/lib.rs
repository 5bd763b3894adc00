// dmabuf-player - zero-copy hardware video playback
// Main library entry point

pub mod config;
pub mod decoder;
pub mod pipeline;
pub mod renderer;

#[cfg(test)]
mod testing;

use config::PlayerConfig;
use decoder::ffmpeg::FfmpegFrameSource;
use decoder::mailbox::MailboxSource;
use decoder::{FramePixelFormat, FrameSource};
use pipeline::{PipelineError, RenderCoordinator, SessionStats};
use renderer::{EglRenderer, PlayerWindow};

/// Play the configured input until it ends, the window is closed, or a fatal
/// error occurs
pub fn run(config: &PlayerConfig) -> Result<SessionStats, PipelineError> {
    config.validate()?;

    let window = PlayerWindow::open(&config.window)?;
    let renderer = EglRenderer::new(window)?;

    if config.threaded {
        let decoder_config = config.decoder.clone();
        let source = MailboxSource::spawn(
            FramePixelFormat::DrmPrime,
            config.backpressure,
            config.pipeline.poll_interval,
            move || FfmpegFrameSource::open(&decoder_config),
        )?;
        play(source, renderer, config)
    } else {
        let source = FfmpegFrameSource::open(&config.decoder)?;
        play(source, renderer, config)
    }
}

fn play<S: FrameSource>(
    source: S,
    renderer: EglRenderer,
    config: &PlayerConfig,
) -> Result<SessionStats, PipelineError> {
    let _span = tracing::info_span!("playback", device = %config.decoder.device).entered();
    log::info!("Playing {}", config.decoder.input.display());
    let mut coordinator = RenderCoordinator::new(source, renderer, &config.pipeline)?;
    coordinator.run()
}
