//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No GPU offers graphics and presentation for the surface
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Surface query or capability error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Handle unknown to the device that received it
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
}

impl RhiError {
    /// The raw Vulkan result, when this error carries one.
    pub fn vk_result(&self) -> Option<ash::vk::Result> {
        match self {
            Self::VulkanError(result) => Some(*result),
            _ => None,
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
