//! Render configuration.
//!
//! Configuration is plain data: the renderer crates translate it into Vulkan
//! types at the point of use, so this crate stays free of GPU dependencies.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest accepted number of frames in flight.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

/// Preferred presentation mode. Falls back to FIFO when the surface does
/// not support the preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    /// Low latency without tearing
    #[default]
    Mailbox,
    /// Vertical sync, always available
    Fifo,
    /// No synchronization, may tear
    Immediate,
}

/// Capacity of each descriptor pool the allocator creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorPoolConfig {
    pub max_sets: u32,
    pub uniform_buffers: u32,
    pub storage_buffers: u32,
    pub combined_image_samplers: u32,
    pub sampled_images: u32,
    pub storage_images: u32,
    pub samplers: u32,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            max_sets: 256,
            uniform_buffers: 256,
            storage_buffers: 128,
            combined_image_samplers: 256,
            sampled_images: 128,
            storage_images: 32,
            samplers: 32,
        }
    }
}

/// Top-level configuration for a render context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Number of frames the CPU may run ahead of the GPU.
    pub frames_in_flight: usize,
    /// Requested presentable image count, clamped to surface limits.
    pub preferred_image_count: Option<u32>,
    pub present_mode: PresentModePreference,
    pub descriptor_pool: DescriptorPoolConfig,
    pub enable_validation: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            preferred_image_count: None,
            present_mode: PresentModePreference::default(),
            descriptor_pool: DescriptorPoolConfig::default(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl RenderConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Reject values the frame scheduler cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight) {
            return Err(Error::Config(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if self.preferred_image_count == Some(0) {
            return Err(Error::Config(
                "preferred_image_count must be at least 1".to_string(),
            ));
        }
        if self.descriptor_pool.max_sets == 0 {
            return Err(Error::Config(
                "descriptor_pool.max_sets must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
