//! Image import.
//!
//! Encodes a [`FrameBufferDescriptor`] into the `EGL_EXT_image_dma_buf_import`
//! attribute list and asks the GPU context for an image. The resulting
//! [`ImportedImage`] borrows the frame it was imported from.

use super::descriptor::{fourcc_name, FrameBufferDescriptor};
use super::texture::TextureKey;
use super::PipelineError;
use crate::renderer::{GpuContext, ImageHandle};
use drm_fourcc::DrmModifier;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, RawFd};

pub const EGL_NONE: i32 = 0x3038;
pub const EGL_HEIGHT: i32 = 0x3056;
pub const EGL_WIDTH: i32 = 0x3057;
pub const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
pub const EGL_LINUX_DRM_FOURCC_EXT: i32 = 0x3271;

/// Attribute keys for one plane slot
#[derive(Debug, Clone, Copy)]
struct PlaneTokens {
    fd: i32,
    offset: i32,
    pitch: i32,
    modifier_lo: i32,
    modifier_hi: i32,
}

const PLANE_TOKENS: [PlaneTokens; 4] = [
    PlaneTokens {
        fd: 0x3272,
        offset: 0x3273,
        pitch: 0x3274,
        modifier_lo: 0x3443,
        modifier_hi: 0x3444,
    },
    PlaneTokens {
        fd: 0x3275,
        offset: 0x3276,
        pitch: 0x3277,
        modifier_lo: 0x3445,
        modifier_hi: 0x3446,
    },
    PlaneTokens {
        fd: 0x3278,
        offset: 0x3279,
        pitch: 0x327A,
        modifier_lo: 0x3447,
        modifier_hi: 0x3448,
    },
    PlaneTokens {
        fd: 0x3440,
        offset: 0x3441,
        pitch: 0x3442,
        modifier_lo: 0x3449,
        modifier_hi: 0x344A,
    },
];

/// Most planes the import extension can describe
pub const MAX_IMPORT_PLANES: usize = PLANE_TOKENS.len();

/// Split a 64-bit modifier into the (low, high) attribute values
pub fn split_modifier(modifier: u64) -> (i32, i32) {
    (
        (modifier & 0xffff_ffff) as u32 as i32,
        (modifier >> 32) as u32 as i32,
    )
}

pub fn join_modifier(lo: i32, hi: i32) -> u64 {
    (u64::from(hi as u32) << 32) | u64::from(lo as u32)
}

fn attribute_value(what: &str, value: u32) -> Result<i32, PipelineError> {
    i32::try_from(value)
        .map_err(|_| PipelineError::ImportRejected(format!("{} {} does not fit an attribute", what, value)))
}

/// Ordered (key, value) pairs of a dma-buf import request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageAttributes {
    pairs: Vec<(i32, i32)>,
}

impl ImageAttributes {
    fn push(&mut self, key: i32, value: i32) {
        self.pairs.push((key, value));
    }

    pub fn pairs(&self) -> &[(i32, i32)] {
        &self.pairs
    }

    /// First value stored under `key`
    pub fn value(&self, key: i32) -> Option<i32> {
        self.pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// Number of planes described
    pub fn plane_count(&self) -> usize {
        PLANE_TOKENS
            .iter()
            .take_while(|tokens| self.value(tokens.fd).is_some())
            .count()
    }

    /// Modifier of plane `index`, if one was encoded
    pub fn modifier(&self, index: usize) -> Option<u64> {
        let tokens = PLANE_TOKENS.get(index)?;
        Some(join_modifier(
            self.value(tokens.modifier_lo)?,
            self.value(tokens.modifier_hi)?,
        ))
    }

    /// Flat key/value list terminated by `EGL_NONE`
    pub fn to_egl_list(&self) -> Vec<i32> {
        let mut list = Vec::with_capacity(self.pairs.len() * 2 + 1);
        for (key, value) in &self.pairs {
            list.push(*key);
            list.push(*value);
        }
        list.push(EGL_NONE);
        list
    }
}

/// A live import of one frame's buffer.
///
/// Must be handed to the texture binder (which destroys it) before the frame
/// is released.
#[must_use = "an imported image must be bound or destroyed"]
#[derive(Debug)]
pub struct ImportedImage<'f> {
    handle: ImageHandle,
    key: TextureKey,
    buffer_fd: RawFd,
    _frame: PhantomData<&'f ()>,
}

impl ImportedImage<'_> {
    pub fn handle(&self) -> ImageHandle {
        self.handle
    }

    pub fn key(&self) -> TextureKey {
        self.key
    }

    pub fn buffer_fd(&self) -> RawFd {
        self.buffer_fd
    }
}

/// Creates GPU images from frame buffer descriptors
#[derive(Debug)]
pub struct ImageImporter {
    max_planes: usize,
    imports: u64,
    rejections: u64,
}

impl ImageImporter {
    pub fn new(max_planes: usize) -> Result<Self, PipelineError> {
        if max_planes == 0 || max_planes > MAX_IMPORT_PLANES {
            return Err(PipelineError::Usage(format!(
                "max planes must be between 1 and {}, got {}",
                MAX_IMPORT_PLANES, max_planes
            )));
        }
        Ok(Self {
            max_planes,
            imports: 0,
            rejections: 0,
        })
    }

    pub fn max_planes(&self) -> usize {
        self.max_planes
    }

    pub fn imports(&self) -> u64 {
        self.imports
    }

    pub fn rejections(&self) -> u64 {
        self.rejections
    }

    /// Build the attribute list: size, fourcc, then each plane's fd, offset,
    /// pitch and (for non-linear layouts) modifier halves, in plane order.
    pub fn encode(&self, desc: &FrameBufferDescriptor<'_>) -> Result<ImageAttributes, PipelineError> {
        let planes = desc.planes();
        if planes.len() > self.max_planes {
            return Err(PipelineError::ImportRejected(format!(
                "{} planes exceeds the limit of {}",
                planes.len(),
                self.max_planes
            )));
        }

        let mut attribs = ImageAttributes::default();
        attribs.push(EGL_WIDTH, attribute_value("width", desc.width())?);
        attribs.push(EGL_HEIGHT, attribute_value("height", desc.height())?);
        attribs.push(EGL_LINUX_DRM_FOURCC_EXT, desc.fourcc() as i32);

        let linear = u64::from(DrmModifier::Linear);
        for (plane, tokens) in planes.iter().zip(PLANE_TOKENS.iter()) {
            attribs.push(tokens.fd, plane.fd().as_raw_fd());
            attribs.push(tokens.offset, attribute_value("offset", plane.offset())?);
            attribs.push(tokens.pitch, attribute_value("pitch", plane.pitch())?);
            if plane.modifier() != linear {
                let (lo, hi) = split_modifier(plane.modifier());
                attribs.push(tokens.modifier_lo, lo);
                attribs.push(tokens.modifier_hi, hi);
            }
        }

        Ok(attribs)
    }

    /// Import the frame's buffer. Driver rejections are per-frame errors.
    pub fn import<'f, G: GpuContext + ?Sized>(
        &mut self,
        gpu: &mut G,
        desc: &FrameBufferDescriptor<'f>,
    ) -> Result<ImportedImage<'f>, PipelineError> {
        let attribs = match self.encode(desc) {
            Ok(attribs) => attribs,
            Err(e) => {
                self.rejections += 1;
                return Err(e);
            }
        };

        let handle = gpu.create_image(&attribs.to_egl_list()).map_err(|e| {
            self.rejections += 1;
            PipelineError::ImportRejected(format!(
                "{} ({} {}x{}, {} planes, fd {})",
                e,
                fourcc_name(desc.fourcc()),
                desc.width(),
                desc.height(),
                desc.planes().len(),
                desc.buffer_fd()
            ))
        })?;

        self.imports += 1;
        log::trace!(
            "Imported {}x{} {} from fd {}",
            desc.width(),
            desc.height(),
            fourcc_name(desc.fourcc()),
            desc.buffer_fd()
        );

        Ok(ImportedImage {
            handle,
            key: TextureKey::of(desc),
            buffer_fd: desc.buffer_fd(),
            _frame: PhantomData,
        })
    }
}
