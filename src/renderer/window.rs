// Player window
// An X11 winit window whose events are pumped from the render loop

use super::{RendererError, WindowConfig};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_ulong, c_void};
use std::ptr::NonNull;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{Key, NamedKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    platform::x11::EventLoopBuilderExtX11,
    window::{Window, WindowId},
};

/// Event pumps to wait for the window to appear
const OPEN_ATTEMPTS: usize = 200;

struct WindowState {
    config: WindowConfig,
    window: Option<Window>,
    error: Option<RendererError>,
    stop_requested: bool,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_resizable(false);

        match event_loop.create_window(attrs) {
            Ok(window) => {
                log::info!(
                    "Window created: {}x{}",
                    self.config.width,
                    self.config.height
                );
                self.window = Some(window);
            }
            Err(e) => {
                self.error = Some(RendererError::WindowError(format!(
                    "Failed to create window: {}",
                    e
                )));
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Window closed");
                self.stop_requested = true;
            }
            WindowEvent::KeyboardInput { event, .. }
                if event.state == ElementState::Pressed
                    && event.logical_key == Key::Named(NamedKey::Escape) =>
            {
                log::info!("Escape pressed");
                self.stop_requested = true;
            }
            _ => {}
        }

        if self.stop_requested {
            event_loop.exit();
        }
    }
}

/// Window driven by the caller: events are only processed in [`PlayerWindow::pump`]
pub struct PlayerWindow {
    event_loop: EventLoop<()>,
    state: WindowState,
}

impl PlayerWindow {
    pub fn open(config: &WindowConfig) -> Result<Self, RendererError> {
        let event_loop = EventLoop::builder()
            .with_x11()
            .build()
            .map_err(|e| RendererError::WindowError(format!("Failed to create event loop: {}", e)))?;
        event_loop.set_control_flow(ControlFlow::Poll);

        let mut player = Self {
            event_loop,
            state: WindowState {
                config: config.clone(),
                window: None,
                error: None,
                stop_requested: false,
            },
        };

        for _ in 0..OPEN_ATTEMPTS {
            player.pump();
            if let Some(e) = player.state.error.take() {
                return Err(e);
            }
            if player.state.window.is_some() {
                return Ok(player);
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        Err(RendererError::WindowError(
            "Window was not created by the event loop".to_string(),
        ))
    }

    /// Process pending events without blocking. True once the user asked to stop.
    pub fn pump(&mut self) -> bool {
        let status = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.state);
        if let PumpStatus::Exit(code) = status {
            log::debug!("Event loop exited with code {}", code);
            self.state.stop_requested = true;
        }
        self.state.stop_requested
    }

    fn window(&self) -> Result<&Window, RendererError> {
        self.state
            .window
            .as_ref()
            .ok_or_else(|| RendererError::WindowError("Window is not open".to_string()))
    }

    /// Drawable size in pixels
    pub fn size(&self) -> (u32, u32) {
        match &self.state.window {
            Some(window) => {
                let size = window.inner_size();
                (size.width, size.height)
            }
            None => (self.state.config.width, self.state.config.height),
        }
    }

    /// Xlib display pointer and window id for EGL
    pub(super) fn x11_handles(&self) -> Result<(NonNull<c_void>, c_ulong), RendererError> {
        let window = self.window()?;
        let display = window
            .display_handle()
            .map_err(|e| RendererError::WindowError(format!("No display handle: {}", e)))?
            .as_raw();
        let handle = window
            .window_handle()
            .map_err(|e| RendererError::WindowError(format!("No window handle: {}", e)))?
            .as_raw();

        match (display, handle) {
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                let display = display.display.ok_or_else(|| {
                    RendererError::GpuNotAvailable("Xlib display pointer is null".to_string())
                })?;
                Ok((display, handle.window))
            }
            (display, _) => Err(RendererError::GpuNotAvailable(format!(
                "X11 is required, got {:?}",
                display
            ))),
        }
    }
}
