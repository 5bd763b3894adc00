// Zero-copy frame import pipeline
//
// decoded frame -> descriptor -> imported image -> external texture -> draw -> release

pub mod coordinator;
pub mod descriptor;
pub mod importer;
pub mod texture;

pub use coordinator::{CoordinatorState, FinishReason, RenderCoordinator, SessionStats, StepOutcome};
pub use descriptor::{DescriptorExtractor, FrameBufferDescriptor, PlaneDescriptor};
pub use importer::{ImageAttributes, ImageImporter, ImportedImage};
pub use texture::{TextureBinder, TextureKey, TextureSlot};

use crate::decoder::{DecoderError, FramePixelFormat};
use crate::renderer::RendererError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Frame format mismatch: expected {expected}, got {actual}")]
    FormatMismatch {
        expected: FramePixelFormat,
        actual: FramePixelFormat,
    },
    #[error("Image import rejected: {0}")]
    ImportRejected(String),
    #[error("Texture allocation failed: {0}")]
    AllocationFailed(String),
    #[error(transparent)]
    Decode(#[from] DecoderError),
    #[error("Usage: {0}")]
    Usage(String),
    #[error("Frame source stalled for {0:?}")]
    Stalled(Duration),
    #[error(transparent)]
    Renderer(#[from] RendererError),
}

impl PipelineError {
    /// Per-frame errors drop the frame; everything else ends the session
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::ImportRejected(_) | PipelineError::AllocationFailed(_) => false,
            PipelineError::Decode(e) => !e.is_recoverable(),
            PipelineError::FormatMismatch { .. }
            | PipelineError::Usage(_)
            | PipelineError::Stalled(_)
            | PipelineError::Renderer(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        let mismatch = PipelineError::FormatMismatch {
            expected: FramePixelFormat::DrmPrime,
            actual: FramePixelFormat::Other("yuv420p".to_string()),
        };
        assert!(mismatch.is_fatal());
        assert!(!PipelineError::ImportRejected("bad fd".to_string()).is_fatal());
        assert!(!PipelineError::AllocationFailed("oom".to_string()).is_fatal());
        assert!(!PipelineError::from(DecoderError::DecodeError("x".to_string())).is_fatal());
        assert!(PipelineError::from(DecoderError::InitError("x".to_string())).is_fatal());
        assert!(PipelineError::Usage("missing input".to_string()).is_fatal());
    }

    #[test]
    fn test_mismatch_message_names_formats() {
        let err = PipelineError::FormatMismatch {
            expected: FramePixelFormat::DrmPrime,
            actual: FramePixelFormat::Other("vaapi".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Frame format mismatch: expected drm_prime, got vaapi"
        );
    }
}
