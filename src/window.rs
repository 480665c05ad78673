// Window - winit driven by pump_events
//
// The renderer owns the loop, so instead of handing control to
// EventLoop::run_app the window pumps events between frames: with a zero
// timeout while drawing, blocking while minimized.

use anyhow::{Context, Result};
use ash::vk;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Fullscreen, Window as WinitWindow, WindowAttributes, WindowId},
};

use crate::backend::swapchain::ExtentSource;
use crate::config::WindowConfig;

type ResizeCallback = Box<dyn FnMut(vk::Extent2D)>;

/// Receives winit's callbacks during a pump
struct WindowState {
    attributes: WindowAttributes,
    window: Option<WinitWindow>,
    create_error: Option<winit::error::OsError>,
    close_requested: bool,
    on_resize: Vec<ResizeCallback>,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => self.window = Some(window),
            Err(e) => self.create_error = Some(e),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                let extent = to_extent(size);
                for callback in &mut self.on_resize {
                    callback(extent);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.close_requested = true;
                }
            }
            _ => {}
        }
    }
}

fn to_extent(size: PhysicalSize<u32>) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

pub struct Window {
    state: WindowState,
    event_loop: EventLoop<()>,
}

impl Window {
    pub fn new(config: &WindowConfig) -> Result<Self> {
        let mut attributes = WindowAttributes::default()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height));
        if config.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let event_loop = EventLoop::new().context("Failed to create event loop")?;
        let mut window = Self {
            state: WindowState {
                attributes,
                window: None,
                create_error: None,
                close_requested: false,
                on_resize: Vec::new(),
            },
            event_loop,
        };

        // The window is created from the first resumed callback
        while window.state.window.is_none() {
            if let Some(e) = window.state.create_error.take() {
                anyhow::bail!("Failed to create window: {}", e);
            }
            if !window.pump(Some(Duration::ZERO)) {
                anyhow::bail!("Event loop exited before the window was created");
            }
        }

        log::info!(
            "Window: {}x{} ({})",
            config.width,
            config.height,
            if config.fullscreen { "fullscreen" } else { "windowed" }
        );
        Ok(window)
    }

    /// Returns false once the event loop has exited.
    fn pump(&mut self, timeout: Option<Duration>) -> bool {
        match self.event_loop.pump_app_events(timeout, &mut self.state) {
            PumpStatus::Continue => true,
            PumpStatus::Exit(code) => {
                log::debug!("Event loop exited with code {}", code);
                self.state.close_requested = true;
                false
            }
        }
    }

    /// Handle pending events without blocking.
    pub fn poll_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    /// Called with the new framebuffer size on every resize event.
    pub fn on_resize(&mut self, callback: impl FnMut(vk::Extent2D) + 'static) {
        self.state.on_resize.push(Box::new(callback));
    }

    pub fn set_title(&self, title: &str) {
        if let Some(window) = &self.state.window {
            window.set_title(title);
        }
    }

    /// The winit window, for surface creation
    pub fn handle(&self) -> Result<&WinitWindow> {
        self.state.window.as_ref().context("Window not created")
    }
}

impl ExtentSource for Window {
    fn framebuffer_extent(&self) -> vk::Extent2D {
        self.state
            .window
            .as_ref()
            .map_or(vk::Extent2D::default(), |w| to_extent(w.inner_size()))
    }

    fn wait_events(&mut self) {
        self.pump(None);
    }

    fn should_close(&self) -> bool {
        self.state.close_requested
    }
}
