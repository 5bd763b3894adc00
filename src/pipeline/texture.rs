//! Single-slot external texture cache.
//!
//! One texture is reused for as long as the frame geometry and format stay the
//! same. Each frame's image is attached to it, after which the image itself is
//! destroyed; the texture keeps sampling the frame's memory until the frame is
//! released, at which point the slot is marked unbacked.

use super::descriptor::{fourcc_name, FrameBufferDescriptor};
use super::importer::ImportedImage;
use super::PipelineError;
use crate::renderer::{GpuContext, TextureId};
use std::fmt;
use std::os::fd::RawFd;

/// What a cached texture was allocated for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureKey {
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
}

impl TextureKey {
    pub fn new(width: u32, height: u32, fourcc: u32) -> Self {
        Self {
            width,
            height,
            fourcc,
        }
    }

    pub fn of(desc: &FrameBufferDescriptor<'_>) -> Self {
        Self::new(desc.width(), desc.height(), desc.fourcc())
    }
}

impl fmt::Display for TextureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, fourcc_name(self.fourcc))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Bound {
        texture: TextureId,
        key: TextureKey,
        /// Buffer the texture samples, for diagnostics
        buffer: RawFd,
        /// False once the backing frame went back to the decoder
        backed: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSlot {
    state: SlotState,
}

impl Default for TextureSlot {
    fn default() -> Self {
        Self {
            state: SlotState::Empty,
        }
    }
}

impl TextureSlot {
    pub fn is_empty(&self) -> bool {
        self.state == SlotState::Empty
    }

    pub fn texture(&self) -> Option<TextureId> {
        match self.state {
            SlotState::Bound { texture, .. } => Some(texture),
            SlotState::Empty => None,
        }
    }

    pub fn key(&self) -> Option<TextureKey> {
        match self.state {
            SlotState::Bound { key, .. } => Some(key),
            SlotState::Empty => None,
        }
    }

    pub fn buffer(&self) -> Option<RawFd> {
        match self.state {
            SlotState::Bound { buffer, backed: true, .. } => Some(buffer),
            _ => None,
        }
    }

    /// Texture that may be sampled right now
    pub fn drawable(&self) -> Option<TextureId> {
        match self.state {
            SlotState::Bound {
                texture,
                backed: true,
                ..
            } => Some(texture),
            _ => None,
        }
    }

    /// The frame behind the texture was released; its contents are undefined
    pub fn release_backing(&mut self) {
        if let SlotState::Bound { backed, .. } = &mut self.state {
            *backed = false;
        }
    }
}

/// Attaches imported images to the cached texture
#[derive(Debug, Default)]
pub struct TextureBinder {
    slot: TextureSlot,
    allocations: u64,
    binds: u64,
}

impl TextureBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self) -> &TextureSlot {
        &self.slot
    }

    pub fn slot_mut(&mut self) -> &mut TextureSlot {
        &mut self.slot
    }

    /// Texture allocations performed so far
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn binds(&self) -> u64 {
        self.binds
    }

    /// Attach `image` to the slot texture, reallocating only on a key change.
    /// The image is destroyed in every case.
    pub fn bind<G: GpuContext + ?Sized>(
        &mut self,
        gpu: &mut G,
        image: ImportedImage<'_>,
    ) -> Result<TextureId, PipelineError> {
        let result = self.attach(gpu, &image);
        gpu.destroy_image(image.handle());
        result
    }

    fn attach<G: GpuContext + ?Sized>(
        &mut self,
        gpu: &mut G,
        image: &ImportedImage<'_>,
    ) -> Result<TextureId, PipelineError> {
        let key = image.key();
        let texture = match self.slot.state {
            SlotState::Bound {
                texture,
                key: cached,
                ..
            } if cached == key => texture,
            previous => {
                if let SlotState::Bound {
                    texture,
                    key: cached,
                    ..
                } = previous
                {
                    log::debug!("Frame layout changed from {} to {}, reallocating texture", cached, key);
                    gpu.delete_texture(texture);
                    self.slot.state = SlotState::Empty;
                }

                let texture = gpu
                    .create_external_texture()
                    .map_err(|e| PipelineError::AllocationFailed(e.to_string()))?;
                self.allocations += 1;
                log::debug!("Allocated texture {} for {}", texture.0, key);
                texture
            }
        };

        // Until the bind succeeds the texture has no valid contents
        self.slot.state = SlotState::Bound {
            texture,
            key,
            buffer: image.buffer_fd(),
            backed: false,
        };

        gpu.bind_image(texture, image.handle())
            .map_err(|e| PipelineError::ImportRejected(format!("bind failed: {}", e)))?;

        self.slot.state = SlotState::Bound {
            texture,
            key,
            buffer: image.buffer_fd(),
            backed: true,
        };
        self.binds += 1;
        Ok(texture)
    }

    /// Delete the cached texture
    pub fn teardown<G: GpuContext + ?Sized>(&mut self, gpu: &mut G) {
        if let Some(texture) = self.slot.texture() {
            gpu.delete_texture(texture);
        }
        self.slot = TextureSlot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::descriptor::{PlaneDescriptor, FOURCC_NV12, FOURCC_P010};
    use crate::pipeline::importer::ImageImporter;
    use crate::testing::{Event, Journal, MockGpu};
    use std::fs::File;
    use std::os::fd::{AsFd, AsRawFd};

    struct Fixture {
        journal: Journal,
        gpu: MockGpu,
        importer: ImageImporter,
        binder: TextureBinder,
        buffer: File,
    }

    impl Fixture {
        fn new() -> Self {
            let journal = Journal::default();
            Self {
                gpu: MockGpu::new(journal.clone()),
                journal,
                importer: ImageImporter::new(4).unwrap(),
                binder: TextureBinder::new(),
                buffer: tempfile::tempfile().unwrap(),
            }
        }

        fn bind(&mut self, width: u32, height: u32, fourcc: u32) -> Result<TextureId, PipelineError> {
            let plane = PlaneDescriptor::new(self.buffer.as_fd(), 0, width, 0);
            let desc = FrameBufferDescriptor::new(width, height, fourcc, vec![plane]).unwrap();
            let image = self.importer.import(&mut self.gpu, &desc)?;
            self.binder.bind(&mut self.gpu, image)
        }
    }

    #[test]
    fn test_same_key_reuses_texture() {
        let mut fx = Fixture::new();
        let first = fx.bind(64, 64, FOURCC_NV12).unwrap();
        for _ in 0..9 {
            assert_eq!(fx.bind(64, 64, FOURCC_NV12).unwrap(), first);
        }

        assert_eq!(fx.binder.allocations(), 1);
        assert_eq!(fx.binder.binds(), 10);
        assert_eq!(fx.gpu.max_live_images, 1);
        assert_eq!(fx.gpu.live_images(), 0);
        assert_eq!(fx.journal.count(|e| matches!(e, Event::TextureCreated(_))), 1);
    }

    #[test]
    fn test_key_change_reallocates() {
        let mut fx = Fixture::new();
        let first = fx.bind(64, 64, FOURCC_NV12).unwrap();
        let second = fx.bind(128, 64, FOURCC_NV12).unwrap();
        let third = fx.bind(128, 64, FOURCC_P010).unwrap();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(fx.binder.allocations(), 3);
        assert_eq!(
            fx.journal.count(|e| matches!(e, Event::TextureDeleted(_))),
            2
        );
        assert_eq!(
            fx.binder.slot().key(),
            Some(TextureKey::new(128, 64, FOURCC_P010))
        );
    }

    #[test]
    fn test_old_texture_deleted_before_new_one() {
        let mut fx = Fixture::new();
        fx.bind(64, 64, FOURCC_NV12).unwrap();
        fx.bind(32, 32, FOURCC_NV12).unwrap();

        let events = fx.journal.events();
        let deleted = events
            .iter()
            .position(|e| *e == Event::TextureDeleted(1))
            .unwrap();
        let created = events
            .iter()
            .position(|e| *e == Event::TextureCreated(2))
            .unwrap();
        assert!(deleted < created);
    }

    #[test]
    fn test_allocation_failure_destroys_image() {
        let mut fx = Fixture::new();
        fx.gpu.failing_allocations = 1;

        let err = fx.bind(64, 64, FOURCC_NV12).unwrap_err();
        assert!(matches!(err, PipelineError::AllocationFailed(_)));
        assert_eq!(fx.gpu.live_images(), 0);
        assert!(fx.binder.slot().is_empty());

        fx.bind(64, 64, FOURCC_NV12).unwrap();
        assert_eq!(fx.binder.allocations(), 1);
    }

    #[test]
    fn test_bind_failure_leaves_slot_unbacked() {
        let mut fx = Fixture::new();
        let texture = fx.bind(64, 64, FOURCC_NV12).unwrap();
        assert_eq!(fx.binder.slot().drawable(), Some(texture));

        fx.gpu.failing_binds = 1;
        let err = fx.bind(64, 64, FOURCC_NV12).unwrap_err();
        assert!(matches!(err, PipelineError::ImportRejected(_)));
        assert_eq!(fx.binder.slot().texture(), Some(texture));
        assert_eq!(fx.binder.slot().drawable(), None);
        assert_eq!(fx.gpu.live_images(), 0);
    }

    #[test]
    fn test_release_backing() {
        let mut fx = Fixture::new();
        let texture = fx.bind(64, 64, FOURCC_NV12).unwrap();
        assert_eq!(fx.binder.slot().buffer(), Some(fx.buffer.as_fd().as_raw_fd()));

        fx.binder.slot_mut().release_backing();
        assert_eq!(fx.binder.slot().drawable(), None);
        assert_eq!(fx.binder.slot().buffer(), None);
        assert_eq!(fx.binder.slot().texture(), Some(texture));
    }

    #[test]
    fn test_teardown_deletes_texture() {
        let mut fx = Fixture::new();
        fx.bind(64, 64, FOURCC_NV12).unwrap();
        fx.binder.teardown(&mut fx.gpu);

        assert!(fx.binder.slot().is_empty());
        assert_eq!(fx.journal.events().last(), Some(&Event::TextureDeleted(1)));

        // Nothing left to delete
        fx.binder.teardown(&mut fx.gpu);
        assert_eq!(fx.journal.count(|e| matches!(e, Event::TextureDeleted(_))), 1);
    }
}
