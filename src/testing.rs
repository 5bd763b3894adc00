//! Test doubles: scripted frame source, recording GPU, shared event journal.

use crate::decoder::drm::{DrmFrameDescriptor, DrmObjectDescriptor, DrmPlaneDescriptor};
use crate::decoder::{DecoderError, FramePixelFormat, FramePoll, FrameSource, HwFrame};
use crate::pipeline::descriptor::{FOURCC_GR88, FOURCC_NV12, FOURCC_R8, FOURCC_XRGB8888};
use crate::pipeline::importer::EGL_NONE;
use crate::renderer::{GpuContext, ImageHandle, Presenter, RendererError, TextureId};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::num::NonZeroU32;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ImageCreated(usize),
    ImageDestroyed(usize),
    TextureCreated(u32),
    TextureDeleted(u32),
    Bound { texture: u32, image: usize },
    Drawn(u32),
    Presented,
    Released(u32),
}

/// Ordered record of everything the mocks saw, shared across threads
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.0.lock().iter().filter(|e| pred(e)).count()
    }
}

/// Stand-in for a dma-buf: a real, open file descriptor
fn dmabuf() -> File {
    tempfile::tempfile().expect("failed to create temp file")
}

pub struct ScriptedFrame {
    pub seq: u32,
    pub format: FramePixelFormat,
    pub width: u32,
    pub height: u32,
    pub descriptor: Option<DrmFrameDescriptor>,
    buffers: Vec<File>,
}

impl ScriptedFrame {
    fn with_layers(
        seq: u32,
        width: u32,
        height: u32,
        modifier: u64,
        layers: &[(u32, &[(isize, isize)])],
    ) -> Self {
        let buffer = dmabuf();
        let mut desc = DrmFrameDescriptor {
            nb_objects: 1,
            nb_layers: layers.len() as i32,
            ..Default::default()
        };
        desc.objects[0] = DrmObjectDescriptor {
            fd: buffer.as_raw_fd(),
            size: (width * height * 4) as usize,
            format_modifier: modifier,
        };
        for (layer, (format, planes)) in desc.layers.iter_mut().zip(layers) {
            layer.format = *format;
            layer.nb_planes = planes.len() as i32;
            for (slot, (offset, pitch)) in layer.planes.iter_mut().zip(planes.iter()) {
                *slot = DrmPlaneDescriptor {
                    object_index: 0,
                    offset: *offset,
                    pitch: *pitch,
                };
            }
        }

        Self {
            seq,
            format: FramePixelFormat::DrmPrime,
            width,
            height,
            descriptor: Some(desc),
            buffers: vec![buffer],
        }
    }

    /// Single-plane linear XRGB8888 frame
    pub fn linear(seq: u32, width: u32, height: u32) -> Self {
        let pitch = (width * 4) as isize;
        Self::with_layers(seq, width, height, 0, &[(FOURCC_XRGB8888, &[(0, pitch)])])
    }

    /// NV12 exported as one layer with two planes
    pub fn nv12(seq: u32, width: u32, height: u32, modifier: u64) -> Self {
        let luma = (width * height) as isize;
        let pitch = width as isize;
        Self::with_layers(
            seq,
            width,
            height,
            modifier,
            &[(FOURCC_NV12, &[(0, pitch), (luma, pitch)])],
        )
    }

    /// NV12 exported as separate R8 and GR88 layers
    pub fn nv12_two_layers(seq: u32, width: u32, height: u32) -> Self {
        let luma = (width * height) as isize;
        let pitch = width as isize;
        Self::with_layers(
            seq,
            width,
            height,
            0,
            &[(FOURCC_R8, &[(0, pitch)]), (FOURCC_GR88, &[(luma, pitch)])],
        )
    }

    pub fn with_format(mut self, format: FramePixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn buffer_fd(&self, index: usize) -> RawFd {
        self.buffers[index].as_raw_fd()
    }
}

impl HwFrame for ScriptedFrame {
    fn pixel_format(&self) -> FramePixelFormat {
        self.format.clone()
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn drm_descriptor(&self) -> Option<&DrmFrameDescriptor> {
        self.descriptor.as_ref()
    }
}

pub enum Step {
    Frame(ScriptedFrame),
    NotYet,
    Fail(DecoderError),
}

/// Plays back a fixed list of poll results, then reports end of stream
pub struct ScriptedSource {
    steps: VecDeque<Step>,
    journal: Journal,
    format: FramePixelFormat,
    blocking: bool,
}

impl ScriptedSource {
    pub fn new(journal: Journal, steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
            journal,
            format: FramePixelFormat::DrmPrime,
            blocking: false,
        }
    }

    pub fn frames(journal: Journal, frames: impl IntoIterator<Item = ScriptedFrame>) -> Self {
        Self::new(journal, frames.into_iter().map(Step::Frame).collect())
    }

    pub fn with_output_format(mut self, format: FramePixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Claim that polls wait on their own, like a decode thread mailbox
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }
}

impl FrameSource for ScriptedSource {
    type Frame = ScriptedFrame;

    fn output_format(&self) -> FramePixelFormat {
        self.format.clone()
    }

    fn receive_frame(&mut self) -> Result<FramePoll<ScriptedFrame>, DecoderError> {
        match self.steps.pop_front() {
            Some(Step::Frame(frame)) => Ok(FramePoll::Ready(frame)),
            Some(Step::NotYet) => Ok(FramePoll::NotYetAvailable),
            Some(Step::Fail(e)) => Err(e),
            None => Ok(FramePoll::EndOfStream),
        }
    }

    fn release(&mut self, frame: ScriptedFrame) {
        self.journal.push(Event::Released(frame.seq));
    }

    fn blocks_on_receive(&self) -> bool {
        self.blocking
    }

    fn info(&self) -> &str {
        "scripted"
    }
}

/// GPU that hands out sequential ids and records every call
pub struct MockGpu {
    journal: Journal,
    next_image: usize,
    next_texture: u32,
    import_attempts: usize,
    live_images: usize,
    presents: usize,
    pub max_live_images: usize,
    pub last_attribs: Vec<i32>,
    /// Import attempts (0-based) that the driver rejects
    pub reject_imports: HashSet<usize>,
    /// Number of upcoming texture allocations that fail
    pub failing_allocations: usize,
    /// Number of upcoming image binds that fail
    pub failing_binds: usize,
    /// Ask the coordinator to stop once this many frames were presented
    pub stop_after_presents: Option<usize>,
}

impl MockGpu {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            next_image: 0,
            next_texture: 0,
            import_attempts: 0,
            live_images: 0,
            presents: 0,
            max_live_images: 0,
            last_attribs: Vec::new(),
            reject_imports: HashSet::new(),
            failing_allocations: 0,
            failing_binds: 0,
            stop_after_presents: None,
        }
    }

    pub fn live_images(&self) -> usize {
        self.live_images
    }
}

impl GpuContext for MockGpu {
    fn create_image(&mut self, attribs: &[i32]) -> Result<ImageHandle, RendererError> {
        let attempt = self.import_attempts;
        self.import_attempts += 1;
        self.last_attribs = attribs.to_vec();
        assert_eq!(attribs.last(), Some(&EGL_NONE), "attribute list must be terminated");

        if self.reject_imports.contains(&attempt) {
            return Err(RendererError::ImportError("EGL_BAD_MATCH".to_string()));
        }

        self.next_image += 1;
        self.live_images += 1;
        self.max_live_images = self.max_live_images.max(self.live_images);
        self.journal.push(Event::ImageCreated(self.next_image));
        Ok(ImageHandle::from_raw(std::ptr::without_provenance_mut(self.next_image)).unwrap())
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        self.live_images -= 1;
        self.journal.push(Event::ImageDestroyed(image.as_ptr() as usize));
    }

    fn create_external_texture(&mut self) -> Result<TextureId, RendererError> {
        if self.failing_allocations > 0 {
            self.failing_allocations -= 1;
            return Err(RendererError::AllocationError("out of memory".to_string()));
        }
        self.next_texture += 1;
        self.journal.push(Event::TextureCreated(self.next_texture));
        Ok(TextureId(NonZeroU32::new(self.next_texture).unwrap()))
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.journal.push(Event::TextureDeleted(texture.0.get()));
    }

    fn bind_image(&mut self, texture: TextureId, image: ImageHandle) -> Result<(), RendererError> {
        if self.failing_binds > 0 {
            self.failing_binds -= 1;
            return Err(RendererError::ImportError("GL_INVALID_OPERATION".to_string()));
        }
        self.journal.push(Event::Bound {
            texture: texture.0.get(),
            image: image.as_ptr() as usize,
        });
        Ok(())
    }
}

impl Presenter for MockGpu {
    fn poll_stop_requested(&mut self) -> bool {
        self.stop_after_presents
            .is_some_and(|limit| self.presents >= limit)
    }

    fn draw(&mut self, texture: TextureId) -> Result<(), RendererError> {
        self.journal.push(Event::Drawn(texture.0.get()));
        Ok(())
    }

    fn present(&mut self) -> Result<(), RendererError> {
        self.presents += 1;
        self.journal.push(Event::Presented);
        Ok(())
    }
}
