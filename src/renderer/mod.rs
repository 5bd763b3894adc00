// GPU renderer module
// EGL/GLES rendering of imported dma-buf frames

mod egl;
mod quad;
mod window;

pub use egl::EglRenderer;
pub use window::PlayerWindow;

use std::ffi::c_void;
use std::num::NonZeroU32;
use std::ptr::NonNull;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Failed to initialize renderer: {0}")]
    InitError(String),
    #[error("Render failed: {0}")]
    RenderError(String),
    #[error("Window error: {0}")]
    WindowError(String),
    #[error("GPU not available: {0}")]
    GpuNotAvailable(String),
    #[error("Image import failed: {0}")]
    ImportError(String),
    #[error("Texture allocation failed: {0}")]
    AllocationError(String),
}

/// Window configuration
#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "dmabuf-player".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// GPU texture object name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub NonZeroU32);

/// Imported external image (an `EGLImage`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHandle(NonNull<c_void>);

impl ImageHandle {
    /// Wrap a driver image pointer; `None` for the null image
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Import and texture operations on the active GPU context
pub trait GpuContext {
    /// Create an image from an `EGL_NONE`-terminated dma-buf attribute list
    fn create_image(&mut self, attribs: &[i32]) -> Result<ImageHandle, RendererError>;

    /// Destroy the import binding. The underlying buffer is not touched.
    fn destroy_image(&mut self, image: ImageHandle);

    /// Allocate an external-sampling texture
    fn create_external_texture(&mut self) -> Result<TextureId, RendererError>;

    fn delete_texture(&mut self, texture: TextureId);

    /// Point `texture` at the image's memory
    fn bind_image(&mut self, texture: TextureId, image: ImageHandle) -> Result<(), RendererError>;
}

/// Draw and present side of the display
pub trait Presenter {
    /// Process pending window events; true once the user asked to stop
    fn poll_stop_requested(&mut self) -> bool;

    /// Draw a full-screen quad sampling `texture`
    fn draw(&mut self, texture: TextureId) -> Result<(), RendererError>;

    /// Show the drawn image
    fn present(&mut self) -> Result<(), RendererError>;
}
