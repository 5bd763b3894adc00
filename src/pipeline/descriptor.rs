//! Descriptor extraction.
//!
//! Reads the DRM PRIME descriptor of a decoded frame and normalizes it into an
//! ordered plane list plus width/height/fourcc. The result borrows the frame:
//! its file descriptors are only valid while the decoder keeps the frame alive.

use super::PipelineError;
use crate::decoder::drm::DrmFrameDescriptor;
use crate::decoder::{FramePixelFormat, HwFrame};
use drm_fourcc::DrmFourcc;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

/// Build a DRM fourcc code from its four characters
pub const fn fourcc_code(tag: &[u8; 4]) -> u32 {
    (tag[0] as u32) | (tag[1] as u32) << 8 | (tag[2] as u32) << 16 | (tag[3] as u32) << 24
}

pub const FOURCC_R8: u32 = fourcc_code(b"R8  ");
pub const FOURCC_R16: u32 = fourcc_code(b"R16 ");
pub const FOURCC_GR88: u32 = fourcc_code(b"GR88");
pub const FOURCC_GR1616: u32 = fourcc_code(b"GR32");
pub const FOURCC_NV12: u32 = fourcc_code(b"NV12");
pub const FOURCC_P010: u32 = fourcc_code(b"P010");
pub const FOURCC_YUV420: u32 = fourcc_code(b"YU12");
pub const FOURCC_XRGB8888: u32 = fourcc_code(b"XR24");

/// Human readable fourcc for logs
pub fn fourcc_name(code: u32) -> String {
    DrmFourcc::try_from(code)
        .map(|fourcc| fourcc.to_string())
        .unwrap_or_else(|_| format!("{:#010x}", code))
}

/// One image plane inside a dma-buf
#[derive(Debug, Clone, Copy)]
pub struct PlaneDescriptor<'f> {
    fd: BorrowedFd<'f>,
    offset: u32,
    pitch: u32,
    modifier: u64,
}

impl<'f> PlaneDescriptor<'f> {
    pub fn new(fd: BorrowedFd<'f>, offset: u32, pitch: u32, modifier: u64) -> Self {
        Self {
            fd,
            offset,
            pitch,
            modifier,
        }
    }

    pub fn fd(&self) -> BorrowedFd<'f> {
        self.fd
    }

    /// Byte offset of the plane inside the buffer
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Row pitch in bytes
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    /// DRM format modifier, 0 for linear
    pub fn modifier(&self) -> u64 {
        self.modifier
    }
}

/// Normalized buffer layout of one decoded frame
#[derive(Debug, Clone)]
pub struct FrameBufferDescriptor<'f> {
    width: u32,
    height: u32,
    fourcc: u32,
    planes: Vec<PlaneDescriptor<'f>>,
}

impl<'f> FrameBufferDescriptor<'f> {
    pub fn new(
        width: u32,
        height: u32,
        fourcc: u32,
        planes: Vec<PlaneDescriptor<'f>>,
    ) -> Result<Self, PipelineError> {
        if planes.is_empty() {
            return Err(PipelineError::ImportRejected(
                "descriptor has no planes".to_string(),
            ));
        }
        if width == 0 || height == 0 {
            return Err(PipelineError::ImportRejected(format!(
                "invalid frame size {}x{}",
                width, height
            )));
        }
        Ok(Self {
            width,
            height,
            fourcc,
            planes,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fourcc(&self) -> u32 {
        self.fourcc
    }

    /// Planes in the order the import call expects them
    pub fn planes(&self) -> &[PlaneDescriptor<'f>] {
        &self.planes
    }

    /// Buffer handle of the first plane, for diagnostics
    pub fn buffer_fd(&self) -> RawFd {
        self.planes[0].fd.as_raw_fd()
    }
}

/// Turns decoded hardware frames into [`FrameBufferDescriptor`]s
#[derive(Debug, Clone)]
pub struct DescriptorExtractor {
    negotiated: FramePixelFormat,
}

impl DescriptorExtractor {
    pub fn new(negotiated: FramePixelFormat) -> Self {
        Self { negotiated }
    }

    pub fn negotiated(&self) -> &FramePixelFormat {
        &self.negotiated
    }

    pub fn check_format(&self, actual: &FramePixelFormat) -> Result<(), PipelineError> {
        if *actual != self.negotiated {
            return Err(PipelineError::FormatMismatch {
                expected: self.negotiated.clone(),
                actual: actual.clone(),
            });
        }
        Ok(())
    }

    /// Read the frame's buffer layout without taking ownership of anything
    pub fn extract<'f, F: HwFrame>(
        &self,
        frame: &'f F,
    ) -> Result<FrameBufferDescriptor<'f>, PipelineError> {
        self.check_format(&frame.pixel_format())?;

        let drm = frame.drm_descriptor().ok_or_else(|| {
            PipelineError::ImportRejected("frame carries no DRM PRIME descriptor".to_string())
        })?;

        let fourcc = compose_fourcc(drm)?;
        let planes = flatten_planes(drm)?;
        FrameBufferDescriptor::new(frame.width(), frame.height(), fourcc, planes)
    }
}

/// Collapse the layer formats into the fourcc of the whole image
fn compose_fourcc(drm: &DrmFrameDescriptor) -> Result<u32, PipelineError> {
    let formats: Vec<u32> = drm.layers().iter().map(|layer| layer.format).collect();
    match formats.as_slice() {
        [] => Err(PipelineError::ImportRejected(
            "descriptor has no layers".to_string(),
        )),
        [single] => Ok(*single),
        [FOURCC_R8, FOURCC_GR88] => Ok(FOURCC_NV12),
        [FOURCC_R16, FOURCC_GR1616] => Ok(FOURCC_P010),
        [FOURCC_R8, FOURCC_R8, FOURCC_R8] => Ok(FOURCC_YUV420),
        other => Err(PipelineError::ImportRejected(format!(
            "unsupported layer composition [{}]",
            other
                .iter()
                .map(|code| fourcc_name(*code))
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Planes of all layers, in layer order then plane order
fn flatten_planes(drm: &DrmFrameDescriptor) -> Result<Vec<PlaneDescriptor<'_>>, PipelineError> {
    let objects = drm.objects();
    let mut planes = Vec::new();

    for (layer_index, layer) in drm.layers().iter().enumerate() {
        for (plane_index, plane) in layer.planes().iter().enumerate() {
            let object = usize::try_from(plane.object_index)
                .ok()
                .and_then(|index| objects.get(index))
                .ok_or_else(|| {
                    PipelineError::ImportRejected(format!(
                        "layer {} plane {} references object {} of {}",
                        layer_index,
                        plane_index,
                        plane.object_index,
                        objects.len()
                    ))
                })?;

            if object.fd < 0 {
                return Err(PipelineError::ImportRejected(format!(
                    "object {} has invalid fd {}",
                    plane.object_index, object.fd
                )));
            }

            let offset = u32::try_from(plane.offset).map_err(|_| {
                PipelineError::ImportRejected(format!("plane offset {} out of range", plane.offset))
            })?;
            let pitch = u32::try_from(plane.pitch)
                .ok()
                .filter(|pitch| *pitch > 0)
                .ok_or_else(|| {
                    PipelineError::ImportRejected(format!("plane pitch {} out of range", plane.pitch))
                })?;

            // SAFETY: the fd is owned by the frame's DRM descriptor, which
            // outlives this borrow of `drm`.
            let fd = unsafe { BorrowedFd::borrow_raw(object.fd) };
            planes.push(PlaneDescriptor::new(fd, offset, pitch, object.format_modifier));
        }
    }

    Ok(planes)
}
