//! Render coordinator.
//!
//! One frame at a time: pull, extract, import, bind, draw, present, release.
//! The frame goes back to the source only after presentation, and the texture
//! slot is marked unbacked at that point so it is never sampled afterwards.

use super::descriptor::DescriptorExtractor;
use super::importer::ImageImporter;
use super::texture::{TextureBinder, TextureSlot};
use super::PipelineError;
use crate::config::PipelineConfig;
use crate::decoder::{DecoderError, FramePixelFormat, FramePoll, FrameSource};
use crate::renderer::{GpuContext, Presenter};
use std::time::Instant;

/// Where the coordinator is within the current iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    FrameReady,
    Presented,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    EndOfStream,
    /// The window was closed
    Stopped,
}

/// Result of one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// No frame was ready; nothing drawn
    Waiting,
    Presented,
    /// The frame (or decode attempt) failed and was dropped
    Skipped,
    Finished(FinishReason),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub decode_errors: u64,
    pub waits: u64,
    pub texture_allocations: u64,
}

pub struct RenderCoordinator<S, G>
where
    S: FrameSource,
    G: GpuContext + Presenter,
{
    source: S,
    gpu: G,
    extractor: DescriptorExtractor,
    importer: ImageImporter,
    binder: TextureBinder,
    config: PipelineConfig,
    state: CoordinatorState,
    stats: SessionStats,
    allocation_failures: u32,
    decode_failures: u32,
    waiting_since: Option<Instant>,
}

impl<S, G> RenderCoordinator<S, G>
where
    S: FrameSource,
    G: GpuContext + Presenter,
{
    /// Set up the loop. Fails if the source does not produce DRM PRIME frames.
    pub fn new(source: S, gpu: G, config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let extractor = DescriptorExtractor::new(FramePixelFormat::DrmPrime);
        extractor.check_format(&source.output_format())?;
        let importer = ImageImporter::new(config.max_planes)?;

        log::info!("Render coordinator ready: {}", source.info());

        Ok(Self {
            source,
            gpu,
            extractor,
            importer,
            binder: TextureBinder::new(),
            config: config.clone(),
            state: CoordinatorState::Idle,
            stats: SessionStats::default(),
            allocation_failures: 0,
            decode_failures: 0,
            waiting_since: None,
        })
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn slot(&self) -> &TextureSlot {
        self.binder.slot()
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Run one iteration. Returns `Err` only when the session has to end.
    pub fn step(&mut self) -> Result<StepOutcome, PipelineError> {
        if self.gpu.poll_stop_requested() {
            return Ok(StepOutcome::Finished(FinishReason::Stopped));
        }

        self.state = CoordinatorState::Idle;
        let frame = match self.source.receive_frame() {
            Ok(FramePoll::Ready(frame)) => frame,
            Ok(FramePoll::NotYetAvailable) => return self.wait(),
            Ok(FramePoll::EndOfStream) => {
                self.waiting_since = None;
                return Ok(StepOutcome::Finished(FinishReason::EndOfStream));
            }
            Err(e) => return self.decode_failed(e),
        };
        self.waiting_since = None;
        self.decode_failures = 0;
        self.state = CoordinatorState::FrameReady;

        let shown = self.show(&frame);

        // The texture must not be sampled once the buffer is back with the decoder
        self.binder.slot_mut().release_backing();
        self.source.release(frame);
        self.state = CoordinatorState::Released;

        match shown {
            Ok(()) => {
                self.allocation_failures = 0;
                self.stats.frames_presented += 1;
                Ok(StepOutcome::Presented)
            }
            Err(e) => self.frame_failed(e),
        }
    }

    fn show(&mut self, frame: &S::Frame) -> Result<(), PipelineError> {
        let desc = self.extractor.extract(frame)?;
        let image = self.importer.import(&mut self.gpu, &desc)?;
        let bound = self.binder.bind(&mut self.gpu, image);
        self.stats.texture_allocations = self.binder.allocations();
        bound?;

        let texture = self.binder.slot().drawable().ok_or_else(|| {
            PipelineError::ImportRejected("texture has no backing frame".to_string())
        })?;
        self.gpu.draw(texture)?;
        self.gpu.present()?;
        self.state = CoordinatorState::Presented;
        Ok(())
    }

    fn frame_failed(&mut self, e: PipelineError) -> Result<StepOutcome, PipelineError> {
        if e.is_fatal() {
            return Err(e);
        }

        if let PipelineError::AllocationFailed(reason) = &e {
            self.allocation_failures += 1;
            if self.allocation_failures >= self.config.max_consecutive_allocation_failures {
                return Err(PipelineError::AllocationFailed(format!(
                    "{} consecutive failures, last: {}",
                    self.allocation_failures, reason
                )));
            }
        }

        log::warn!("Skipping frame: {}", e);
        self.stats.frames_skipped += 1;
        Ok(StepOutcome::Skipped)
    }

    fn decode_failed(&mut self, e: DecoderError) -> Result<StepOutcome, PipelineError> {
        self.waiting_since = None;
        self.stats.decode_errors += 1;
        if !e.is_recoverable() {
            return Err(e.into());
        }

        self.decode_failures += 1;
        if self.decode_failures >= self.config.max_consecutive_decode_errors {
            log::error!("{} decode errors in a row, giving up", self.decode_failures);
            return Err(e.into());
        }

        log::warn!("Decode error, skipping: {}", e);
        Ok(StepOutcome::Skipped)
    }

    fn wait(&mut self) -> Result<StepOutcome, PipelineError> {
        self.stats.waits += 1;
        let since = *self.waiting_since.get_or_insert_with(Instant::now);
        if let Some(timeout) = self.config.stall_timeout {
            if since.elapsed() >= timeout {
                return Err(PipelineError::Stalled(timeout));
            }
        }

        if !self.config.poll_interval.is_zero() && !self.source.blocks_on_receive() {
            std::thread::sleep(self.config.poll_interval);
        }
        Ok(StepOutcome::Waiting)
    }

    /// Loop until end of stream, a stop request, or a fatal error. The texture
    /// is deleted in every case.
    pub fn run(&mut self) -> Result<SessionStats, PipelineError> {
        let result = loop {
            match self.step() {
                Ok(StepOutcome::Finished(reason)) => {
                    log::info!("Session finished: {:?}", reason);
                    break Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("Session aborted: {}", e);
                    break Err(e);
                }
            }
        };

        self.shutdown();
        log::info!(
            "Presented {} frames ({} skipped, {} decode errors, {} texture allocations, {} imports)",
            self.stats.frames_presented,
            self.stats.frames_skipped,
            self.stats.decode_errors,
            self.stats.texture_allocations,
            self.importer.imports()
        );
        result.map(|()| self.stats)
    }

    /// Release GPU objects owned by the loop
    pub fn shutdown(&mut self) {
        self.binder.teardown(&mut self.gpu);
        self.state = CoordinatorState::Idle;
    }
}
