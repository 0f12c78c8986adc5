//! Window and Vulkan surface creation.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info};
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window as WinitWindow, WindowAttributes};

use framepace_core::{Error, Result};

/// Owned `VkSurfaceKHR`, destroyed on drop.
///
/// The instance it was created from must outlive it.
pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
}

impl Surface {
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
        debug!("Vulkan surface destroyed");
    }
}

/// A resizable window and its last known drawable size.
pub struct Window {
    window: Arc<WinitWindow>,
    size: PhysicalSize<u32>,
}

impl Window {
    pub fn new(event_loop: &ActiveEventLoop, title: &str, width: u32, height: u32) -> Result<Self> {
        let attributes = WindowAttributes::default()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .with_resizable(true);

        let window = event_loop
            .create_window(attributes)
            .map_err(|e| Error::Window(e.to_string()))?;
        let size = window.inner_size();
        info!("Window '{}' created ({}x{})", title, size.width, size.height);

        Ok(Self {
            window: Arc::new(window),
            size,
        })
    }

    #[inline]
    pub fn inner(&self) -> &WinitWindow {
        &self.window
    }

    /// Drawable size in pixels. Zero in either dimension while minimized.
    #[inline]
    pub fn size(&self) -> (u32, u32) {
        (self.size.width, self.size.height)
    }

    #[inline]
    pub fn is_minimized(&self) -> bool {
        self.size.width == 0 || self.size.height == 0
    }

    /// Records a new drawable size. Returns `false` if it did not change.
    pub fn set_size(&mut self, size: PhysicalSize<u32>) -> bool {
        if size == self.size {
            return false;
        }
        debug!(
            "Window resized {}x{} -> {}x{}",
            self.size.width, self.size.height, size.width, size.height
        );
        self.size = size;
        true
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    /// Creates a presentation surface for this window.
    ///
    /// # Errors
    ///
    /// Fails if the platform handles are unavailable or the driver rejects
    /// the surface.
    pub fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<Surface> {
        let display = self
            .window
            .display_handle()
            .map_err(|e| Error::Window(format!("No display handle: {}", e)))?;
        let window = self
            .window
            .window_handle()
            .map_err(|e| Error::Window(format!("No window handle: {}", e)))?;

        let handle = unsafe {
            ash_window::create_surface(entry, instance, display.as_raw(), window.as_raw(), None)
        }
        .map_err(|e| Error::Vulkan(format!("Surface creation failed: {}", e)))?;
        info!("Vulkan surface created");

        Ok(Surface {
            handle,
            loader: ash::khr::surface::Instance::new(entry, instance),
        })
    }
}
