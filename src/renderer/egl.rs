// EGL + GLES renderer
//
// Owns the EGL display/context/surface on the player window and implements
// dma-buf image import (EGL_EXT_image_dma_buf_import) and external textures
// (GL_OES_EGL_image_external).

use super::quad::{QuadRenderer, TEXTURE_EXTERNAL_OES};
use super::{GpuContext, ImageHandle, PlayerWindow, Presenter, RendererError, TextureId};
use crate::pipeline::importer::EGL_LINUX_DMA_BUF_EXT;
use glow::HasContext;
use khronos_egl as egl;
use std::ffi::c_void;

const EGL_OPENGL_ES3_BIT: egl::Int = 0x0040;

const REQUIRED_EGL_EXTENSIONS: &[&str] = &["EGL_KHR_image_base", "EGL_EXT_image_dma_buf_import"];
const REQUIRED_GL_EXTENSIONS: &[&str] = &["GL_OES_EGL_image_external"];

const CONFIG_ATTRIBS: [egl::Int; 11] = [
    egl::RED_SIZE,
    8,
    egl::GREEN_SIZE,
    8,
    egl::BLUE_SIZE,
    8,
    egl::SURFACE_TYPE,
    egl::WINDOW_BIT,
    egl::RENDERABLE_TYPE,
    EGL_OPENGL_ES3_BIT,
    egl::NONE,
];

const CONTEXT_ATTRIBS: [egl::Int; 3] = [egl::CONTEXT_CLIENT_VERSION, 3, egl::NONE];

type CreateImageKhr = unsafe extern "system" fn(
    display: *mut c_void,
    context: *mut c_void,
    target: u32,
    buffer: *mut c_void,
    attribs: *const i32,
) -> *mut c_void;
type DestroyImageKhr = unsafe extern "system" fn(display: *mut c_void, image: *mut c_void) -> u32;
type ImageTargetTexture2dOes = unsafe extern "system" fn(target: u32, image: *mut c_void);

/// Extension entry points, resolved once after the context is current
struct ImageFns {
    create_image: CreateImageKhr,
    destroy_image: DestroyImageKhr,
    image_target_texture: ImageTargetTexture2dOes,
}

impl ImageFns {
    fn load(egl: &egl::Instance<egl::Static>) -> Result<Self, RendererError> {
        let lookup = |name: &str| {
            egl.get_proc_address(name)
                .ok_or_else(|| RendererError::GpuNotAvailable(format!("{} not available", name)))
        };

        let create_image = lookup("eglCreateImageKHR")?;
        let destroy_image = lookup("eglDestroyImageKHR")?;
        let image_target_texture = lookup("glEGLImageTargetTexture2DOES")?;

        // SAFETY: the names above are resolved to these exact prototypes
        unsafe {
            Ok(Self {
                create_image: std::mem::transmute::<extern "system" fn(), CreateImageKhr>(create_image),
                destroy_image: std::mem::transmute::<extern "system" fn(), DestroyImageKhr>(destroy_image),
                image_target_texture: std::mem::transmute::<extern "system" fn(), ImageTargetTexture2dOes>(
                    image_target_texture,
                ),
            })
        }
    }
}

fn has_extension(extensions: &str, name: &str) -> bool {
    extensions.split_whitespace().any(|ext| ext == name)
}

fn egl_error(egl: &egl::Instance<egl::Static>) -> String {
    egl.get_error()
        .map_or_else(|| "no EGL error".to_string(), |e| e.to_string())
}

/// GPU side of the player: imports, textures, draw and present
pub struct EglRenderer {
    window: PlayerWindow,
    egl: egl::Instance<egl::Static>,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
    gl: glow::Context,
    quad: Option<QuadRenderer>,
    fns: ImageFns,
}

impl EglRenderer {
    pub fn new(window: PlayerWindow) -> Result<Self, RendererError> {
        let (xdisplay, xwindow) = window.x11_handles()?;
        let egl = egl::Instance::new(egl::Static);

        // SAFETY: the Xlib display stays open for the lifetime of `window`
        let display = unsafe { egl.get_display(xdisplay.as_ptr()) }
            .ok_or_else(|| RendererError::GpuNotAvailable("No EGL display for X11".to_string()))?;
        let (major, minor) = egl
            .initialize(display)
            .map_err(|e| RendererError::InitError(format!("eglInitialize failed: {}", e)))?;
        log::info!("EGL {}.{} initialized", major, minor);

        match Self::create_context(&egl, display, xwindow) {
            Ok((context, surface, gl, fns)) => {
                let mut renderer = Self {
                    window,
                    egl,
                    display,
                    context,
                    surface,
                    gl,
                    quad: None,
                    fns,
                };
                // SAFETY: the context was made current above
                renderer.quad = Some(unsafe { QuadRenderer::new(&renderer.gl)? });
                Ok(renderer)
            }
            Err(e) => {
                let _ = egl.terminate(display);
                Err(e)
            }
        }
    }

    fn create_context(
        egl: &egl::Instance<egl::Static>,
        display: egl::Display,
        xwindow: std::ffi::c_ulong,
    ) -> Result<(egl::Context, egl::Surface, glow::Context, ImageFns), RendererError> {
        let extensions = egl
            .query_string(Some(display), egl::EXTENSIONS)
            .map_err(|e| RendererError::InitError(format!("eglQueryString failed: {}", e)))?
            .to_string_lossy()
            .into_owned();
        for name in REQUIRED_EGL_EXTENSIONS {
            if !has_extension(&extensions, name) {
                return Err(RendererError::GpuNotAvailable(format!("{} not supported", name)));
            }
        }
        if !has_extension(&extensions, "EGL_EXT_image_dma_buf_import_modifiers") {
            log::warn!("EGL_EXT_image_dma_buf_import_modifiers missing, tiled frames will be rejected");
        }

        egl.bind_api(egl::OPENGL_ES_API)
            .map_err(|e| RendererError::InitError(format!("eglBindAPI failed: {}", e)))?;
        let config = egl
            .choose_first_config(display, &CONFIG_ATTRIBS)
            .map_err(|e| RendererError::InitError(format!("eglChooseConfig failed: {}", e)))?
            .ok_or_else(|| RendererError::GpuNotAvailable("No GLES3 window config".to_string()))?;
        let context = egl
            .create_context(display, config, None, &CONTEXT_ATTRIBS)
            .map_err(|e| RendererError::InitError(format!("eglCreateContext failed: {}", e)))?;

        // SAFETY: `xwindow` is a live X11 window on the same display
        let surface = match unsafe {
            egl.create_window_surface(display, config, xwindow as egl::NativeWindowType, None)
        } {
            Ok(surface) => surface,
            Err(e) => {
                let _ = egl.destroy_context(display, context);
                return Err(RendererError::InitError(format!("eglCreateWindowSurface failed: {}", e)));
            }
        };

        let current = egl
            .make_current(display, Some(surface), Some(surface), Some(context))
            .map_err(|e| RendererError::InitError(format!("eglMakeCurrent failed: {}", e)))
            .and_then(|()| {
                if let Err(e) = egl.swap_interval(display, 1) {
                    log::warn!("Failed to enable vsync: {}", e);
                }
                let fns = ImageFns::load(egl)?;

                // SAFETY: the context is current on this thread
                let gl = unsafe {
                    glow::Context::from_loader_function(|name| {
                        egl.get_proc_address(name)
                            .map_or(std::ptr::null(), |f| f as *const c_void)
                    })
                };
                for name in REQUIRED_GL_EXTENSIONS {
                    if !gl.supported_extensions().contains(*name) {
                        return Err(RendererError::GpuNotAvailable(format!("{} not supported", name)));
                    }
                }
                Ok((gl, fns))
            });

        match current {
            Ok((gl, fns)) => {
                log::info!("GLES context ready: {}", unsafe { gl.get_parameter_string(glow::RENDERER) });
                Ok((context, surface, gl, fns))
            }
            Err(e) => {
                let _ = egl.make_current(display, None, None, None);
                let _ = egl.destroy_surface(display, surface);
                let _ = egl.destroy_context(display, context);
                Err(e)
            }
        }
    }
}

impl GpuContext for EglRenderer {
    fn create_image(&mut self, attribs: &[i32]) -> Result<ImageHandle, RendererError> {
        // SAFETY: dma-buf imports take no client buffer or context, and the
        // attribute list is EGL_NONE terminated
        let image = unsafe {
            (self.fns.create_image)(
                self.display.as_ptr(),
                std::ptr::null_mut(),
                EGL_LINUX_DMA_BUF_EXT,
                std::ptr::null_mut(),
                attribs.as_ptr(),
            )
        };
        ImageHandle::from_raw(image).ok_or_else(|| {
            RendererError::ImportError(format!("eglCreateImageKHR failed: {}", egl_error(&self.egl)))
        })
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        // SAFETY: `image` was created on this display and is destroyed once
        let ok = unsafe { (self.fns.destroy_image)(self.display.as_ptr(), image.as_ptr()) };
        if ok == 0 {
            log::warn!("eglDestroyImageKHR failed: {}", egl_error(&self.egl));
        }
    }

    fn create_external_texture(&mut self) -> Result<TextureId, RendererError> {
        let gl = &self.gl;
        unsafe {
            let texture = gl
                .create_texture()
                .map_err(|e| RendererError::AllocationError(e.to_string()))?;
            gl.bind_texture(TEXTURE_EXTERNAL_OES, Some(texture));
            gl.tex_parameter_i32(TEXTURE_EXTERNAL_OES, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(TEXTURE_EXTERNAL_OES, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(TEXTURE_EXTERNAL_OES, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            gl.tex_parameter_i32(TEXTURE_EXTERNAL_OES, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
            gl.bind_texture(TEXTURE_EXTERNAL_OES, None);
            Ok(TextureId(texture.0))
        }
    }

    fn delete_texture(&mut self, texture: TextureId) {
        unsafe { self.gl.delete_texture(glow::NativeTexture(texture.0)) };
    }

    fn bind_image(&mut self, texture: TextureId, image: ImageHandle) -> Result<(), RendererError> {
        let gl = &self.gl;
        let error = unsafe {
            gl.bind_texture(TEXTURE_EXTERNAL_OES, Some(glow::NativeTexture(texture.0)));
            (self.fns.image_target_texture)(TEXTURE_EXTERNAL_OES, image.as_ptr());
            let error = gl.get_error();
            gl.bind_texture(TEXTURE_EXTERNAL_OES, None);
            error
        };
        if error != glow::NO_ERROR {
            return Err(RendererError::ImportError(format!(
                "glEGLImageTargetTexture2DOES failed: {:#06x}",
                error
            )));
        }
        Ok(())
    }
}

impl Presenter for EglRenderer {
    fn poll_stop_requested(&mut self) -> bool {
        self.window.pump()
    }

    fn draw(&mut self, texture: TextureId) -> Result<(), RendererError> {
        let quad = self
            .quad
            .as_ref()
            .ok_or_else(|| RendererError::RenderError("Renderer already torn down".to_string()))?;
        let (width, height) = self.window.size();
        unsafe { quad.draw(&self.gl, glow::NativeTexture(texture.0), width, height) };
        Ok(())
    }

    fn present(&mut self) -> Result<(), RendererError> {
        self.egl
            .swap_buffers(self.display, self.surface)
            .map_err(|e| RendererError::RenderError(format!("eglSwapBuffers failed: {}", e)))
    }
}

impl Drop for EglRenderer {
    fn drop(&mut self) {
        if let Some(quad) = self.quad.take() {
            unsafe { quad.destroy(&self.gl) };
        }
        let _ = self.egl.make_current(self.display, None, None, None);
        let _ = self.egl.destroy_surface(self.display, self.surface);
        let _ = self.egl.destroy_context(self.display, self.context);
        let _ = self.egl.terminate(self.display);
        log::debug!("EGL renderer destroyed");
    }
}
