// Video decoder module
// Hardware decoding into DRM PRIME frames (zero-copy)
//
// Sources:
// 1. FFmpeg with a DRM or VAAPI hardware device (ffmpeg)
// 2. Any source moved onto a decode thread behind a single-slot mailbox (mailbox)

pub mod drm;
pub mod ffmpeg;
pub mod mailbox;

pub use drm::DrmFrameDescriptor;

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("Failed to initialize decoder: {0}")]
    InitError(String),
    #[error("Decoding failed: {0}")]
    DecodeError(String),
    #[error("Hardware decoder not available: {0}")]
    HardwareNotAvailable(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl DecoderError {
    /// Whether the session can continue with the next frame after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecoderError::DecodeError(_) | DecoderError::InvalidData(_))
    }
}

/// Hardware device used by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwDeviceKind {
    /// Kernel DRM device, frames come out as DRM PRIME directly
    Drm,
    /// VAAPI surfaces, mapped to DRM PRIME after decode
    Vaapi,
}

impl HwDeviceKind {
    /// FFmpeg hardware device type name
    pub fn name(&self) -> &'static str {
        match self {
            HwDeviceKind::Drm => "drm",
            HwDeviceKind::Vaapi => "vaapi",
        }
    }
}

impl fmt::Display for HwDeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pixel format a decoded frame is stored in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePixelFormat {
    /// Frame data is a DRM PRIME descriptor (dma-buf fds)
    DrmPrime,
    /// Anything else, by name
    Other(String),
}

impl fmt::Display for FramePixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramePixelFormat::DrmPrime => f.write_str("drm_prime"),
            FramePixelFormat::Other(name) => f.write_str(name),
        }
    }
}

/// Decoder configuration
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Input media path
    pub input: PathBuf,
    pub device: HwDeviceKind,
    /// Force a specific FFmpeg decoder by name (e.g. "h264_v4l2m2m")
    pub decoder_name: Option<String>,
    /// Packets fed per poll before reporting "no frame yet"
    pub max_packets_per_poll: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            device: HwDeviceKind::Drm,
            decoder_name: None,
            max_packets_per_poll: 8,
        }
    }
}

/// A decoded frame whose pixels live in decoder-owned hardware buffers
pub trait HwFrame {
    fn pixel_format(&self) -> FramePixelFormat;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// DRM PRIME descriptor, valid only while the frame is alive
    fn drm_descriptor(&self) -> Option<&DrmFrameDescriptor>;
}

/// Result of polling a frame source
#[derive(Debug)]
pub enum FramePoll<F> {
    Ready(F),
    NotYetAvailable,
    EndOfStream,
}

/// Producer of hardware-decoded frames
pub trait FrameSource {
    type Frame: HwFrame;

    /// Pixel format every frame from this source is negotiated to
    fn output_format(&self) -> FramePixelFormat;

    /// Pull the next decoded frame
    fn receive_frame(&mut self) -> Result<FramePoll<Self::Frame>, DecoderError>;

    /// Hand a frame's buffers back to the decoder
    fn release(&mut self, frame: Self::Frame) {
        drop(frame);
    }

    /// True when `receive_frame` already waits before reporting
    /// `NotYetAvailable`, so callers need not sleep between polls
    fn blocks_on_receive(&self) -> bool {
        false
    }

    /// Get source info
    fn info(&self) -> &str;
}
