//! Shared foundations for the framepace crates.
//!
//! - Error types and result aliases
//! - Logging initialization
//! - Render configuration loaded from JSON
//! - Frame timing statistics

mod config;
mod error;
mod logging;
mod timer;

pub use config::{DescriptorPoolConfig, MAX_FRAMES_IN_FLIGHT, PresentModePreference, RenderConfig};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::FrameTimer;
