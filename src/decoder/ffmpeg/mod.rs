//! FFmpeg-based hardware video frame source
//!
//! Demuxes the input file and decodes on a hardware device so frames stay in
//! kernel buffers:
//! - DRM (V4L2 mem2mem decoders, native DRM PRIME output)
//! - VAAPI (Intel/AMD, surfaces mapped to DRM PRIME after decode)
//!
//! The hardware device context and the negotiated surface format live in an
//! [`HwSession`] owned by the source. FFmpeg's `get_format` callback reaches it
//! through the codec context's `opaque` pointer.

use crate::decoder::{
    DecoderConfig, DecoderError, DrmFrameDescriptor, FramePixelFormat, FramePoll, FrameSource,
    HwDeviceKind, HwFrame,
};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::Id;
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame::Video as VideoFrame;
use ffmpeg_next::Packet;
use once_cell::sync::OnceCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};
use std::ptr;

static FFMPEG_INIT: OnceCell<()> = OnceCell::new();

/// Initialize FFmpeg (once per process)
fn init_ffmpeg() -> Result<(), DecoderError> {
    FFMPEG_INIT
        .get_or_try_init(|| {
            ffmpeg::init()
                .map_err(|e| DecoderError::InitError(format!("Failed to initialize FFmpeg: {}", e)))?;
            // Enable verbose logging in debug builds
            if cfg!(debug_assertions) {
                ffmpeg::log::set_level(ffmpeg::log::Level::Info);
            }
            Ok(())
        })
        .map(|_| ())
}

impl HwDeviceKind {
    fn device_type(&self) -> ffi::AVHWDeviceType {
        match self {
            HwDeviceKind::Drm => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DRM,
            HwDeviceKind::Vaapi => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
        }
    }

    /// Surface format the decoder must hand out for this device
    fn surface_format(&self) -> ffi::AVPixelFormat {
        match self {
            HwDeviceKind::Drm => ffi::AVPixelFormat::AV_PIX_FMT_DRM_PRIME,
            HwDeviceKind::Vaapi => ffi::AVPixelFormat::AV_PIX_FMT_VAAPI,
        }
    }

    /// Decoders tried before the codec's default one
    fn preferred_decoders(&self, codec: Id) -> &'static [&'static str] {
        match (self, codec) {
            (HwDeviceKind::Drm, Id::H264) => &["h264_v4l2m2m"],
            (HwDeviceKind::Drm, Id::HEVC) => &["hevc_v4l2m2m"],
            (HwDeviceKind::Drm, Id::VP9) => &["vp9_v4l2m2m"],
            _ => &[],
        }
    }
}

/// Hardware device types compiled into this FFmpeg build
fn available_device_types() -> Vec<String> {
    let mut names = Vec::new();
    let mut kind = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;
    loop {
        kind = unsafe { ffi::av_hwdevice_iterate_types(kind) };
        if kind == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            break;
        }
        let name = unsafe { ffi::av_hwdevice_get_type_name(kind) };
        if !name.is_null() {
            names.push(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned());
        }
    }
    names
}

/// Hardware device context plus the surface format negotiated with the decoder
pub struct HwSession {
    device_ctx: *mut ffi::AVBufferRef,
    kind: HwDeviceKind,
    surface_format: ffi::AVPixelFormat,
}

impl HwSession {
    /// Create the hardware device. Boxed so the codec context can keep a stable pointer to it.
    pub fn new(kind: HwDeviceKind) -> Result<Box<Self>, DecoderError> {
        init_ffmpeg()?;

        let name = CString::new(kind.name())
            .map_err(|e| DecoderError::InitError(format!("Invalid device name: {}", e)))?;
        let found = unsafe { ffi::av_hwdevice_find_type_by_name(name.as_ptr()) };
        if found == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            return Err(DecoderError::HardwareNotAvailable(format!(
                "Device type {} is not supported. Available device types: {}",
                kind,
                available_device_types().join(" ")
            )));
        }

        let mut device_ctx: *mut ffi::AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut device_ctx,
                kind.device_type(),
                ptr::null(),
                ptr::null_mut(),
                0,
            )
        };
        if ret < 0 {
            return Err(DecoderError::HardwareNotAvailable(format!(
                "Failed to create {} device: {}",
                kind,
                ffmpeg::Error::from(ret)
            )));
        }

        log::info!("Created {} hardware device", kind);

        Ok(Box::new(Self {
            device_ctx,
            kind,
            surface_format: kind.surface_format(),
        }))
    }

    pub fn kind(&self) -> HwDeviceKind {
        self.kind
    }
}

impl Drop for HwSession {
    fn drop(&mut self) {
        unsafe { ffi::av_buffer_unref(&mut self.device_ctx) };
        log::debug!("Released {} hardware device", self.kind);
    }
}

/// `get_format` callback: pick the session's hardware surface format or fail
unsafe extern "C" fn negotiate_hw_format(
    ctx: *mut ffi::AVCodecContext,
    formats: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    let session = unsafe { (*ctx).opaque as *const HwSession };
    if session.is_null() || formats.is_null() {
        return ffi::AVPixelFormat::AV_PIX_FMT_NONE;
    }
    let wanted = unsafe { (*session).surface_format };

    let mut cursor = formats;
    unsafe {
        while *cursor != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
            if *cursor == wanted {
                return wanted;
            }
            cursor = cursor.add(1);
        }
    }

    log::error!("Failed to get HW surface format {:?}", wanted);
    ffi::AVPixelFormat::AV_PIX_FMT_NONE
}

/// Decoded frame backed by a DRM PRIME descriptor
pub struct FfmpegFrame {
    // Dropped before `frame`: the mapping references it
    mapped: Option<VideoFrame>,
    frame: VideoFrame,
}

impl FfmpegFrame {
    fn drm_view(&self) -> &VideoFrame {
        self.mapped.as_ref().unwrap_or(&self.frame)
    }
}

impl HwFrame for FfmpegFrame {
    fn pixel_format(&self) -> FramePixelFormat {
        match self.drm_view().format() {
            Pixel::DRM_PRIME => FramePixelFormat::DrmPrime,
            other => FramePixelFormat::Other(format!("{:?}", other).to_lowercase()),
        }
    }

    fn width(&self) -> u32 {
        self.frame.width()
    }

    fn height(&self) -> u32 {
        self.frame.height()
    }

    fn drm_descriptor(&self) -> Option<&DrmFrameDescriptor> {
        let view = self.drm_view();
        if view.format() != Pixel::DRM_PRIME {
            return None;
        }
        // SAFETY: DRM PRIME frames store an AVDRMFrameDescriptor in data[0],
        // owned by the frame's buffer and alive as long as the frame is.
        unsafe {
            let desc = (*view.as_ptr()).data[0] as *const DrmFrameDescriptor;
            desc.as_ref()
        }
    }
}

/// Map a VAAPI surface to a DRM PRIME frame without copying
fn map_to_drm_prime(frame: &VideoFrame) -> Result<VideoFrame, DecoderError> {
    let mut mapped = VideoFrame::empty();
    let ret = unsafe {
        (*mapped.as_mut_ptr()).format = ffi::AVPixelFormat::AV_PIX_FMT_DRM_PRIME as c_int;
        ffi::av_hwframe_map(mapped.as_mut_ptr(), frame.as_ptr(), 0)
    };
    if ret < 0 {
        return Err(DecoderError::DecodeError(format!(
            "Failed to map frame (format={:?}) to DRM PRIME: {}",
            frame.format(),
            ffmpeg::Error::from(ret)
        )));
    }
    Ok(mapped)
}

/// FFmpeg demuxer + hardware decoder producing DRM PRIME frames
pub struct FfmpegFrameSource {
    // Declared before `session`: the codec context points at it through `opaque`
    decoder: ffmpeg::decoder::Video,
    input: ffmpeg::format::context::Input,
    session: Box<HwSession>,
    stream_index: usize,
    info: String,
    max_packets_per_poll: usize,
    pending: Option<Packet>,
    input_exhausted: bool,
    frames_decoded: u64,
    frames_released: u64,
}

impl FfmpegFrameSource {
    /// Open the input and set up a hardware decoder for its best video stream
    pub fn open(config: &DecoderConfig) -> Result<Self, DecoderError> {
        let session = HwSession::new(config.device)?;

        let input = ffmpeg::format::input(&config.input).map_err(|e| {
            DecoderError::InitError(format!(
                "Cannot open input file '{}': {}",
                config.input.display(),
                e
            ))
        })?;

        let (stream_index, parameters) = {
            let stream = input.streams().best(ffmpeg::media::Type::Video).ok_or_else(|| {
                DecoderError::InitError("Cannot find a video stream in the input file".to_string())
            })?;
            (stream.index(), stream.parameters())
        };
        let codec_id = parameters.id();

        let codec = match &config.decoder_name {
            Some(name) => ffmpeg::decoder::find_by_name(name).ok_or_else(|| {
                DecoderError::HardwareNotAvailable(format!("Decoder {} not found", name))
            })?,
            None => config
                .device
                .preferred_decoders(codec_id)
                .iter()
                .find_map(|name| {
                    let found = ffmpeg::decoder::find_by_name(name);
                    if found.is_none() {
                        log::debug!("Decoder not available: {}", name);
                    }
                    found
                })
                .or_else(|| ffmpeg::decoder::find(codec_id))
                .ok_or_else(|| {
                    DecoderError::InitError(format!("No decoder found for codec {:?}", codec_id))
                })?,
        };
        let codec_name = codec.name().to_string();

        let mut context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| DecoderError::InitError(format!("Failed to create decoder context: {}", e)))?;

        unsafe {
            let raw = context.as_mut_ptr();
            let device_ref = ffi::av_buffer_ref(session.device_ctx);
            if device_ref.is_null() {
                return Err(DecoderError::InitError(
                    "Failed to reference hardware device".to_string(),
                ));
            }
            (*raw).hw_device_ctx = device_ref;
            (*raw).get_format = Some(negotiate_hw_format);
            (*raw).opaque = &*session as *const HwSession as *mut c_void;
        }

        let decoder = context
            .decoder()
            .open_as(codec)
            .and_then(|opened| opened.video())
            .map_err(|e| {
                DecoderError::InitError(format!(
                    "Failed to open codec {} for stream #{}: {}",
                    codec_name, stream_index, e
                ))
            })?;

        log::info!(
            "FFmpeg {} decoder initialized on {}: {}x{}, stream #{}",
            codec_name,
            session.kind(),
            decoder.width(),
            decoder.height(),
            stream_index
        );

        let info = format!("FFmpeg {} ({})", codec_name, session.kind());

        Ok(Self {
            decoder,
            input,
            session,
            stream_index,
            info,
            max_packets_per_poll: config.max_packets_per_poll.max(1),
            pending: None,
            input_exhausted: false,
            frames_decoded: 0,
            frames_released: 0,
        })
    }

    /// Send one encoded packet to the decoder.
    ///
    /// Returns `false` when the decoder is full; the packet is kept and resent
    /// on the next poll.
    pub fn submit(&mut self, packet: Packet) -> Result<bool, DecoderError> {
        match self.decoder.send_packet(&packet) {
            Ok(()) => Ok(true),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                self.pending = Some(packet);
                Ok(false)
            }
            Err(e) => Err(DecoderError::DecodeError(format!("Error during decoding: {}", e))),
        }
    }

    /// Feed the next packet of our stream, or signal end of input
    fn feed_next_packet(&mut self) -> Result<(), DecoderError> {
        if let Some(packet) = self.pending.take() {
            return self.submit(packet).map(|_| ());
        }

        loop {
            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) if packet.stream() == self.stream_index => {
                    return self.submit(packet).map(|_| ());
                }
                Ok(()) => continue,
                Err(ffmpeg::Error::Eof) => {
                    log::debug!("End of input, draining decoder");
                    self.input_exhausted = true;
                    return self
                        .decoder
                        .send_eof()
                        .map_err(|e| DecoderError::DecodeError(format!("Failed to drain decoder: {}", e)));
                }
                Err(e) => {
                    return Err(DecoderError::InvalidData(format!("Failed to read packet: {}", e)));
                }
            }
        }
    }

    fn wrap(&self, frame: VideoFrame) -> Result<FfmpegFrame, DecoderError> {
        let mapped = match self.session.kind() {
            HwDeviceKind::Drm => None,
            HwDeviceKind::Vaapi => Some(map_to_drm_prime(&frame)?),
        };
        Ok(FfmpegFrame { mapped, frame })
    }
}

impl FrameSource for FfmpegFrameSource {
    type Frame = FfmpegFrame;

    fn output_format(&self) -> FramePixelFormat {
        FramePixelFormat::DrmPrime
    }

    fn receive_frame(&mut self) -> Result<FramePoll<FfmpegFrame>, DecoderError> {
        let mut fed = 0;
        loop {
            let mut frame = VideoFrame::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    self.frames_decoded += 1;
                    return self.wrap(frame).map(FramePoll::Ready);
                }
                Err(ffmpeg::Error::Eof) => return Ok(FramePoll::EndOfStream),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {}
                Err(e) => {
                    return Err(DecoderError::DecodeError(format!("Error while decoding: {}", e)));
                }
            }

            let starved = self.input_exhausted && self.pending.is_none();
            if starved || fed >= self.max_packets_per_poll {
                return Ok(FramePoll::NotYetAvailable);
            }
            self.feed_next_packet()?;
            fed += 1;
        }
    }

    fn release(&mut self, frame: FfmpegFrame) {
        self.frames_released += 1;
        drop(frame);
    }

    fn info(&self) -> &str {
        &self.info
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        log::info!(
            "{} closed: {} frames decoded, {} released",
            self.info,
            self.frames_decoded,
            self.frames_released
        );
    }
}
