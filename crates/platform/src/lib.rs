//! Windowing for the framepace demo.
//!
//! A thin layer over winit: one window, its current drawable size, and the
//! Vulkan surface presented to it.

mod window;

pub use window::{Surface, Window};

pub use winit::event::WindowEvent;
pub use winit::event_loop::{ActiveEventLoop, EventLoop};
