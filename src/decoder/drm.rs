//! DRM PRIME frame descriptor as laid out by libavutil's `hwcontext_drm.h`.
//!
//! A DRM PRIME `AVFrame` stores a pointer to one of these in `data[0]`. The
//! layout is part of FFmpeg's public ABI, so it is mirrored here with
//! `#[repr(C)]` instead of relying on generated bindings.

use std::os::raw::c_int;

/// Maximum objects, layers, and planes per layer in a descriptor
pub const AV_DRM_MAX_PLANES: usize = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DrmObjectDescriptor {
    /// dma-buf file descriptor
    pub fd: c_int,
    /// Total size of the object in bytes (0 if unknown)
    pub size: usize,
    /// DRM format modifier, 0 for linear
    pub format_modifier: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DrmPlaneDescriptor {
    /// Index into `DrmFrameDescriptor::objects`
    pub object_index: c_int,
    pub offset: isize,
    pub pitch: isize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DrmLayerDescriptor {
    /// DRM fourcc of this layer
    pub format: u32,
    pub nb_planes: c_int,
    pub planes: [DrmPlaneDescriptor; AV_DRM_MAX_PLANES],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DrmFrameDescriptor {
    pub nb_objects: c_int,
    pub objects: [DrmObjectDescriptor; AV_DRM_MAX_PLANES],
    pub nb_layers: c_int,
    pub layers: [DrmLayerDescriptor; AV_DRM_MAX_PLANES],
}

impl DrmFrameDescriptor {
    /// Objects actually in use
    pub fn objects(&self) -> &[DrmObjectDescriptor] {
        &self.objects[..clamp_count(self.nb_objects)]
    }

    /// Layers actually in use
    pub fn layers(&self) -> &[DrmLayerDescriptor] {
        &self.layers[..clamp_count(self.nb_layers)]
    }
}

impl DrmLayerDescriptor {
    /// Planes actually in use
    pub fn planes(&self) -> &[DrmPlaneDescriptor] {
        &self.planes[..clamp_count(self.nb_planes)]
    }
}

fn clamp_count(count: c_int) -> usize {
    usize::try_from(count).unwrap_or(0).min(AV_DRM_MAX_PLANES)
}
